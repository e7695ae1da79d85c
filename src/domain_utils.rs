use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9_.+=/\-']+@[a-zA-Z0-9\-]+(\.[a-zA-Z0-9\-]+)*\.[a-zA-Z]{2,}$")
            .expect("email pattern");
    static ref DOMAIN_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9\-]+(\.[a-zA-Z0-9\-]+)*\.[a-zA-Z]{2,}$").expect("domain pattern");
}

/// Address and domain helpers shared by the plugins.
pub struct DomainUtils;

impl DomainUtils {
    /// Extract domain from email address
    pub fn extract_domain(email: &str) -> Option<String> {
        email
            .split_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .filter(|domain| !domain.is_empty())
    }

    /// Local part of an address, or the whole string when there is no `@`.
    pub fn local_part(email: &str) -> &str {
        email.split_once('@').map(|(user, _)| user).unwrap_or(email)
    }

    /// Remove a `+tag` subaddress extension: `user+tag@example.com` becomes
    /// `user@example.com`.
    pub fn strip_extension(email: &str) -> String {
        match email.split_once('@') {
            Some((user, domain)) => {
                let user = user.split_once('+').map(|(u, _)| u).unwrap_or(user);
                format!("{user}@{domain}")
            }
            None => email.to_string(),
        }
    }

    pub fn is_email(s: &str) -> bool {
        EMAIL_RE.is_match(s)
    }

    pub fn is_domain(s: &str) -> bool {
        DOMAIN_RE.is_match(s)
    }

    /// Check if `domain` equals `parent` or sits below it on a label boundary.
    ///
    /// - is_subdomain_of("mail.example.com", "example.com") -> true
    /// - is_subdomain_of("notexample.com", "example.com") -> false
    pub fn is_subdomain_of(domain: &str, parent: &str) -> bool {
        if domain == parent {
            return true;
        }

        domain.len() > parent.len()
            && domain.ends_with(parent)
            && domain.as_bytes()[domain.len() - parent.len() - 1] == b'.'
    }

    /// The domain itself followed by every dot-prefixed suffix, longest first.
    ///
    /// `a.b.example.com` yields `a.b.example.com`, `.a.b.example.com`,
    /// `.b.example.com`, `.example.com`, `.com`.
    pub fn ancestor_suffixes(domain: &str) -> Vec<String> {
        let mut suffixes = vec![domain.to_string()];
        let labels: Vec<&str> = domain.split('.').collect();
        for i in 0..labels.len() {
            suffixes.push(format!(".{}", labels[i..].join(".")));
        }
        suffixes
    }
}
