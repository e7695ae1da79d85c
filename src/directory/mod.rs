//! Account metadata lookups.
//!
//! Plugins talk to an [`AccountBackend`], which answers questions such as
//! "who may post to this list" without exposing how the answer is stored.
//! Two adapters exist: [`ldap::LdapBackend`] issues filter queries against
//! any [`DirectoryStore`], [`sql::SqlBackend`] issues parameterised SQL.

pub mod filter;
pub mod ldap;
pub mod memory;
pub mod sql;

pub use filter::Filter;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute bag of one directory object or relational row.
///
/// Attribute names are case-insensitive and stored lower-cased. Values keep
/// their order; a multi-valued attribute is simply a longer list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryEntry {
    attributes: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(attr.to_lowercase())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn push(&mut self, attr: &str, value: impl Into<String>) {
        self.attributes
            .entry(attr.to_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Values of `attr`, empty when the attribute is absent.
    pub fn get(&self, attr: &str) -> &[String] {
        self.attributes
            .get(&attr.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, attr: &str) -> Option<&str> {
        self.get(attr).first().map(String::as_str)
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.contains_key(&attr.to_lowercase())
    }

    /// Case-insensitive value membership test.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.get(attr).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Values of `attr` lower-cased, for address comparisons.
    pub fn lowercase_values(&self, attr: &str) -> Vec<String> {
        self.get(attr).iter().map(|v| v.to_lowercase()).collect()
    }

    /// Copy restricted to `attrs`; an empty list keeps everything.
    pub fn project(&self, attrs: &[&str]) -> Self {
        if attrs.is_empty() {
            return self.clone();
        }
        let attributes = attrs
            .iter()
            .filter_map(|attr| {
                let key = attr.to_lowercase();
                self.attributes.get(&key).map(|v| (key, v.clone()))
            })
            .collect();
        Self { attributes }
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the entry named by the base DN.
    Base,
    /// Direct children of the base DN.
    OneLevel,
    /// The base DN and everything below it.
    Subtree,
}

/// Filter-query capability of an LDAP-like directory.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn search(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<(String, DirectoryEntry)>>;
}

/// Which relationships between a login and a different sender address are
/// acceptable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MismatchModes {
    /// Sender may be one of the login's own alias addresses.
    pub strict: bool,
    /// Sender may be a list or alias the login is a member of.
    pub list_member: bool,
}

impl MismatchModes {
    pub fn any(&self) -> bool {
        self.strict || self.list_member
    }
}

/// How a sender address relates to the authenticated login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderRelation {
    /// Alias of the login, or a list/alias the login belongs to.
    Owned,
    /// A subscribable mailing list; membership must be asked remotely.
    SubscribableList { list: String },
    Unrelated,
}

/// Account lookups needed by the plugins, one handle per request.
#[async_trait]
pub trait AccountBackend: Send + Sync {
    /// Entry of a local user, list or alias reachable at `address`, with
    /// the attributes used for list access control.
    async fn recipient_entry(&self, address: &str) -> Result<Option<DirectoryEntry>>;

    /// `domain` (or its primary domain) together with all alias domains.
    async fn primary_and_alias_domains(&self, domain: &str) -> Result<Vec<String>>;

    async fn is_local_domain(&self, domain: &str, include_backupmx: bool) -> Result<bool>;

    /// Addresses (primary and alias) of active members of `list`.
    async fn list_members(&self, list: &str) -> Result<Vec<String>>;

    /// Members of `list` plus the allowed senders recorded on the list.
    async fn list_members_and_moderators(&self, list: &str) -> Result<Vec<String>>;

    /// Primary and alias addresses of the given users of `domain`.
    async fn user_alias_addresses(&self, domain: &str, users: &[String]) -> Result<Vec<String>>;

    /// For each hosted domain matching one of `domains`, its primary name
    /// plus every alias domain name.
    async fn alias_domain_groups(&self, domains: &[String]) -> Result<Vec<Vec<String>>>;

    async fn sender_relation(
        &self,
        login: &str,
        sender: &str,
        modes: MismatchModes,
    ) -> Result<SenderRelation>;

    /// Hand the handle back to its pool.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of per-request [`AccountBackend`] handles.
#[async_trait]
pub trait BackendPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn AccountBackend>>;
}

pub(crate) fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}
