use super::{
    push_unique, AccountBackend, BackendPool, DirectoryEntry, DirectoryStore, Filter,
    MismatchModes, SearchScope, SenderRelation,
};
use crate::domain_utils::DomainUtils;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Attributes of a recipient entry needed for list access control.
pub const RECIPIENT_SEARCH_ATTRS: &[&str] = &[
    "objectClass",
    "accountStatus",
    "listAllowedUser",
    "accessPolicy",
    "enabledService",
    "listModerator",
    "listOwner",
];

/// Hands out [`LdapBackend`] handles sharing one directory store.
pub struct LdapPool {
    store: Arc<dyn DirectoryStore>,
    base_dn: String,
    timeout: Duration,
}

impl LdapPool {
    pub fn new(store: Arc<dyn DirectoryStore>, base_dn: &str, timeout: Duration) -> Self {
        Self {
            store,
            base_dn: base_dn.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl BackendPool for LdapPool {
    async fn acquire(&self) -> Result<Box<dyn AccountBackend>> {
        Ok(Box::new(LdapBackend {
            store: self.store.clone(),
            base_dn: self.base_dn.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Account lookups against the iRedMail LDAP schema: domains are
/// `domainName=<domain>,<base dn>`, users live in `ou=Users` below them.
pub struct LdapBackend {
    store: Arc<dyn DirectoryStore>,
    base_dn: String,
    timeout: Duration,
}

impl LdapBackend {
    fn domain_dn(&self, domain: &str) -> String {
        format!("domainName={},{}", domain, self.base_dn)
    }

    async fn search(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<(String, DirectoryEntry)>> {
        log::debug!("search base dn: {base_dn}");
        log::debug!("search scope: {scope:?}");
        log::debug!("search filter: {filter}");
        log::debug!("search attributes: {}", attrs.join(", "));

        let result = tokio::time::timeout(
            self.timeout,
            self.store.search(base_dn, scope, filter, attrs),
        )
        .await
        .map_err(|_| anyhow!("directory search timed out after {:?}", self.timeout))??;

        log::debug!("search result: {} entries", result.len());
        Ok(result)
    }

    /// Collect the lower-cased values of `attrs` across all entries found.
    async fn collect_values(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<String>> {
        let mut values = Vec::new();
        for (_dn, entry) in self.search(base_dn, scope, filter, attrs).await? {
            for attr in attrs {
                for value in entry.lowercase_values(attr) {
                    push_unique(&mut values, value);
                }
            }
        }
        Ok(values)
    }

    async fn exists(&self, filter: &Filter) -> Result<bool> {
        let found = self
            .search(&self.base_dn, SearchScope::Subtree, filter, &["objectClass"])
            .await?;
        Ok(!found.is_empty())
    }

    fn member_filter(list: &str) -> Filter {
        Filter::and(vec![
            Filter::eq("memberOfGroup", list),
            Filter::or(vec![
                Filter::eq("objectClass", "mailUser"),
                Filter::eq("objectClass", "mailExternalUser"),
            ]),
        ])
    }
}

#[async_trait]
impl AccountBackend for LdapBackend {
    async fn recipient_entry(&self, address: &str) -> Result<Option<DirectoryEntry>> {
        let filter = Filter::and(vec![
            Filter::not(Filter::eq("domainStatus", "disabled")),
            Filter::or(vec![
                Filter::eq("mail", address),
                Filter::eq("shadowAddress", address),
            ]),
            Filter::or(vec![
                Filter::eq("objectClass", "mailUser"),
                Filter::eq("objectClass", "mailList"),
                Filter::eq("objectClass", "mailAlias"),
            ]),
        ]);

        let found = self
            .search(
                &self.base_dn,
                SearchScope::Subtree,
                &filter,
                RECIPIENT_SEARCH_ATTRS,
            )
            .await?;
        Ok(found.into_iter().next().map(|(_dn, entry)| entry))
    }

    async fn primary_and_alias_domains(&self, domain: &str) -> Result<Vec<String>> {
        let filter = Filter::and(vec![
            Filter::eq("objectClass", "mailDomain"),
            Filter::any_of(&["domainName", "domainAliasName"], &[domain.to_string()]),
        ]);
        let mut domains = self
            .collect_values(
                &self.base_dn,
                SearchScope::OneLevel,
                &filter,
                &["domainName", "domainAliasName"],
            )
            .await?;
        push_unique(&mut domains, domain.to_lowercase());
        Ok(domains)
    }

    async fn is_local_domain(&self, domain: &str, include_backupmx: bool) -> Result<bool> {
        if !DomainUtils::is_domain(domain) {
            return Ok(false);
        }

        let mut filters = vec![
            Filter::eq("objectClass", "mailDomain"),
            Filter::eq("accountStatus", "active"),
            Filter::any_of(&["domainName", "domainAliasName"], &[domain.to_string()]),
        ];
        if !include_backupmx {
            filters.push(Filter::not(Filter::eq("domainBackupMX", "yes")));
        }

        let found = self
            .search(
                &self.base_dn,
                SearchScope::OneLevel,
                &Filter::and(filters),
                &["domainName"],
            )
            .await?;
        Ok(!found.is_empty())
    }

    async fn list_members(&self, list: &str) -> Result<Vec<String>> {
        let domain = DomainUtils::extract_domain(list).unwrap_or_default();
        let filter = Filter::and(vec![
            Filter::eq("accountStatus", "active"),
            Self::member_filter(list),
        ]);
        self.collect_values(
            &self.domain_dn(&domain),
            SearchScope::Subtree,
            &filter,
            &["mail", "shadowAddress"],
        )
        .await
    }

    async fn list_members_and_moderators(&self, list: &str) -> Result<Vec<String>> {
        let domain = DomainUtils::extract_domain(list).unwrap_or_default();
        let filter = Filter::or(vec![
            Self::member_filter(list),
            Filter::and(vec![
                Filter::eq("objectClass", "mailList"),
                Filter::eq("mail", list),
            ]),
        ]);
        self.collect_values(
            &self.domain_dn(&domain),
            SearchScope::Subtree,
            &filter,
            &["mail", "shadowAddress", "listAllowedUser"],
        )
        .await
    }

    async fn user_alias_addresses(&self, domain: &str, users: &[String]) -> Result<Vec<String>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let filter = Filter::and(vec![
            Filter::eq("objectClass", "mailUser"),
            Filter::eq("enabledService", "shadowaddress"),
            Filter::any_of(&["mail", "shadowAddress"], users),
        ]);
        self.collect_values(
            &format!("ou=Users,{}", self.domain_dn(domain)),
            SearchScope::OneLevel,
            &filter,
            &["mail", "shadowAddress"],
        )
        .await
    }

    async fn alias_domain_groups(&self, domains: &[String]) -> Result<Vec<Vec<String>>> {
        if domains.is_empty() {
            return Ok(Vec::new());
        }

        let attrs = ["domainName", "domainAliasName"];
        let filter = Filter::and(vec![
            Filter::eq("objectClass", "mailDomain"),
            Filter::eq("enabledService", "domainalias"),
            Filter::any_of(&attrs, domains),
        ]);

        let found = self
            .search(&self.base_dn, SearchScope::OneLevel, &filter, &attrs)
            .await?;
        Ok(found
            .into_iter()
            .map(|(_dn, entry)| {
                let mut names = Vec::new();
                for attr in attrs {
                    for name in entry.lowercase_values(attr) {
                        push_unique(&mut names, name);
                    }
                }
                names
            })
            .collect())
    }

    async fn sender_relation(
        &self,
        login: &str,
        sender: &str,
        modes: MismatchModes,
    ) -> Result<SenderRelation> {
        if !modes.any() {
            return Ok(SenderRelation::Unrelated);
        }

        let user_alias = Filter::and(vec![
            Filter::eq("objectClass", "mailUser"),
            Filter::eq("mail", login),
            Filter::eq("shadowAddress", sender),
        ]);
        let list_member = Filter::and(vec![
            Filter::eq("objectClass", "mailUser"),
            Filter::any_of(&["mail", "shadowAddress"], &[login.to_string()]),
            Filter::eq("memberOfGroup", sender),
        ]);
        let alias_member = Filter::and(vec![
            Filter::eq("objectClass", "mailAlias"),
            Filter::any_of(&["mail", "shadowAddress"], &[sender.to_string()]),
            Filter::eq("mailForwardingAddress", login),
        ]);

        let filter = match (modes.strict, modes.list_member) {
            (true, false) => user_alias,
            (false, true) => Filter::or(vec![list_member, alias_member]),
            _ => Filter::or(vec![user_alias, list_member, alias_member]),
        };

        if self.exists(&filter).await? {
            log::debug!("Sender {sender} is an alias of {login} or a list/alias it belongs to");
            return Ok(SenderRelation::Owned);
        }
        log::debug!("Sender is neither user alias address nor member of list/alias.");

        let mlmmj_list = Filter::and(vec![
            Filter::eq("objectClass", "mailList"),
            Filter::eq("enabledService", "mlmmj"),
            Filter::eq("accountStatus", "active"),
            Filter::any_of(&["mail", "shadowAddress"], &[sender.to_string()]),
        ]);
        if self.exists(&mlmmj_list).await? {
            return Ok(SenderRelation::SubscribableList {
                list: sender.to_string(),
            });
        }

        Ok(SenderRelation::Unrelated)
    }
}
