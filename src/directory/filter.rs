use super::DirectoryEntry;
use std::fmt;

/// Search filter in the LDAP string representation (RFC 4515).
///
/// Values are stored unescaped; `Display` escapes them, so addresses taken
/// from an SMTP session can never alter the structure of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal(String, String),
}

impl Filter {
    pub fn eq(attr: &str, value: &str) -> Self {
        Filter::Equal(attr.to_string(), value.to_string())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// `(|(attr=v1)(attr=v2)...)` over several attributes and values.
    pub fn any_of(attrs: &[&str], values: &[String]) -> Self {
        Filter::Or(
            values
                .iter()
                .flat_map(|value| attrs.iter().map(move |attr| Filter::eq(attr, value)))
                .collect(),
        )
    }

    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(filter) => !filter.matches(entry),
            Filter::Equal(attr, value) => entry.has_value(attr, value),
        }
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({op}")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            Filter::Not(filter) => write!(f, "(!{filter})"),
            Filter::Equal(attr, value) => write!(f, "({attr}={})", escape(value)),
        }
    }
}
