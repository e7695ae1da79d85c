use super::{DirectoryEntry, DirectoryStore, Filter, SearchScope};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Directory held in memory, loaded from a YAML list of entries:
///
/// ```yaml
/// - dn: mail=list@example.com,ou=Groups,domainName=example.com,o=domains,dc=example,dc=com
///   attributes:
///     objectClass: [mailList]
///     accountStatus: active
///     accessPolicy: membersonly
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: Vec<(String, DirectoryEntry)>,
}

#[derive(Debug, Deserialize)]
struct EntryRecord {
    dn: String,
    #[serde(default)]
    attributes: BTreeMap<String, OneOrMany>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory entries: {path}"))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse directory entries: {path}"))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let records: Vec<EntryRecord> = serde_yaml::from_str(content)?;
        let mut directory = Self::new();
        for record in records {
            let mut entry = DirectoryEntry::new();
            for (attr, values) in record.attributes {
                entry = match values {
                    OneOrMany::One(value) => entry.with(&attr, [value]),
                    OneOrMany::Many(values) => entry.with(&attr, values),
                };
            }
            directory.insert(&record.dn, entry);
        }
        Ok(directory)
    }

    pub fn insert(&mut self, dn: &str, entry: DirectoryEntry) {
        let dn = normalize_dn(dn);
        self.entries.retain(|(existing, _)| *existing != dn);
        self.entries.push((dn, entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    match scope {
        SearchScope::Base => dn == base,
        SearchScope::OneLevel => dn
            .split_once(',')
            .map(|(_, parent)| parent == base)
            .unwrap_or(false),
        SearchScope::Subtree => {
            dn == base || base.is_empty() || dn.ends_with(&format!(",{base}"))
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn search(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<(String, DirectoryEntry)>> {
        let base = normalize_dn(base_dn);
        Ok(self
            .entries
            .iter()
            .filter(|(dn, entry)| in_scope(dn, &base, scope) && filter.matches(entry))
            .map(|(dn, entry)| (dn.clone(), entry.project(attrs)))
            .collect())
    }
}
