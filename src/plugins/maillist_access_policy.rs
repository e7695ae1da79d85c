//! Restrict who may send to a mailing list.
//!
//! The list entry's `accessPolicy` decides, after moderators, owners and
//! explicitly allowed senders (`listAllowedUser`) have been let through.

use super::{Plugin, MAILLIST_ACCESS_POLICY};
use crate::context::TransactionContext;
use crate::directory::{AccountBackend, DirectoryEntry};
use crate::domain_utils::DomainUtils;
use crate::verdict::{RejectKind, Verdict};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Anyone may send.
    Public,
    /// Senders under the list's domain or one of its alias domains.
    Domain,
    /// Like `Domain`, plus every sub-domain of those domains.
    Subdomain,
    MembersOnly,
    /// Only moderators and explicitly allowed senders.
    Moderators,
    MembersAndModeratorsOnly,
    Unknown(String),
}

impl AccessPolicy {
    /// Policy from the first `accessPolicy` value; absent means public.
    pub fn from_attribute(value: Option<&str>) -> Self {
        let value = match value {
            Some(value) => value.trim().to_lowercase(),
            None => return Self::Public,
        };

        match value.as_str() {
            "public" => Self::Public,
            "domain" => Self::Domain,
            "subdomain" => Self::Subdomain,
            "membersonly" => Self::MembersOnly,
            // name used by old releases
            "moderatorsonly" | "allowedonly" => Self::Moderators,
            "membersandmoderatorsonly" => Self::MembersAndModeratorsOnly,
            _ => Self::Unknown(value),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Public => "public",
            Self::Domain => "domain",
            Self::Subdomain => "subdomain",
            Self::MembersOnly => "membersonly",
            Self::Moderators => "moderatorsonly",
            Self::MembersAndModeratorsOnly => "membersandmoderatorsonly",
            Self::Unknown(value) => value,
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct AccessPolicyResolver;

impl AccessPolicyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Moderators and owners bypass the policy; so do senders named in
    /// `listAllowedUser` directly, by domain, by `*@domain`, or by a
    /// `.parent` suffix of their domain.
    fn explicitly_allowed(
        entry: &DirectoryEntry,
        sender: &str,
        sender_domain: &str,
    ) -> Option<Verdict> {
        if entry.lowercase_values("listModerator").iter().any(|m| m == sender) {
            log::debug!("Sender is a moderator. Bypass.");
            return Some(Verdict::dunno_because("sender is a moderator"));
        }
        if entry.lowercase_values("listOwner").iter().any(|o| o == sender) {
            log::debug!("Sender is an owner. Bypass.");
            return Some(Verdict::dunno_because("sender is an owner"));
        }

        let allowed = entry.lowercase_values("listAllowedUser");
        if allowed.iter().any(|a| a == sender) {
            return Some(Verdict::dunno_because(format!(
                "sender is allowed explicitly: {sender}"
            )));
        }

        let wildcard = format!("*@{sender_domain}");
        if allowed.iter().any(|a| a == sender_domain || *a == wildcard) {
            return Some(Verdict::dunno_because(format!(
                "sender domain is allowed explicitly: {sender_domain}"
            )));
        }

        let suffixes = DomainUtils::ancestor_suffixes(sender_domain);
        log::debug!("Sender domain and sub-domains: {}", suffixes.join(", "));
        if suffixes.iter().any(|s| allowed.contains(s)) {
            return Some(Verdict::dunno_because(
                "sender domain or its sub-domain is explicitly allowed",
            ));
        }

        None
    }

    /// Allowed senders of a moderators-only list: explicitly allowed
    /// addresses, with local users expanded to all their addresses and
    /// allowed domains expanded to all their alias domains.
    async fn moderator_senders(
        accounts: &dyn AccountBackend,
        entry: &DirectoryEntry,
        recipient_domain: &str,
    ) -> Result<Vec<String>> {
        let local_suffix = format!("@{recipient_domain}");
        let mut allowed = Vec::new();
        let mut users = Vec::new();
        let mut domains = Vec::new();

        for value in entry.lowercase_values("listAllowedUser") {
            if value.starts_with("*@") {
                continue;
            }
            if DomainUtils::is_email(&value) {
                if value.ends_with(&local_suffix) {
                    users.push(value);
                } else {
                    allowed.push(value);
                }
            } else {
                domains.push(value.trim_start_matches('.').to_string());
            }
        }

        log::debug!("Allowed users: {}", users.join(", "));
        log::debug!("Allowed domains: {}", domains.join(", "));

        if !users.is_empty() {
            log::debug!("[+] Getting per-account alias addresses of allowed senders.");
            allowed.extend(
                accounts
                    .user_alias_addresses(recipient_domain, &users)
                    .await?,
            );
        }

        if !domains.is_empty() {
            log::debug!("[+] Getting alias domains of allowed sender (sub-)domains.");
            for group in accounts.alias_domain_groups(&domains).await? {
                if group.iter().any(|d| domains.contains(d)) {
                    allowed.extend(group);
                }
            }
        }

        Ok(allowed)
    }
}

#[async_trait]
impl Plugin for AccessPolicyResolver {
    fn name(&self) -> &str {
        MAILLIST_ACCESS_POLICY
    }

    async fn evaluate(
        &self,
        ctx: &TransactionContext,
        accounts: &dyn AccountBackend,
    ) -> Result<Verdict> {
        let recipient = ctx.recipient_without_ext.as_str();
        let sender = ctx.sender_without_ext.as_str();
        let sender_domain = ctx.sender_domain.as_str();
        let recipient_domain = ctx.recipient_domain.as_str();

        if !ctx.sasl_username.is_empty() && ctx.sasl_username == recipient {
            return Ok(Verdict::dunno_because(
                "sasl_username == recipient, not a mail list account",
            ));
        }

        let entry = match accounts.recipient_entry(recipient).await? {
            Some(entry) => entry,
            None => {
                return Ok(Verdict::dunno_because(
                    "recipient is not a local account",
                ))
            }
        };

        if !entry.has_value("objectClass", "mailList") {
            return Ok(Verdict::dunno_because(
                "recipient is not a mailing list account",
            ));
        }

        let status = entry.get("accountStatus");
        if !(status.len() == 1 && status[0] == "active") {
            log::debug!("Recipient (mailing list) is disabled, message rejected.");
            return Ok(Verdict::reject(RejectKind::Generic));
        }

        let policy = AccessPolicy::from_attribute(entry.first("accessPolicy"));
        log::debug!("Access policy of mailing list ({recipient}): {policy}");

        if entry.has_value("enabledService", "mlmmj")
            && matches!(policy, AccessPolicy::MembersOnly | AccessPolicy::Moderators)
        {
            log::debug!("Recipient is a mlmmj mailing list, let mlmmj handle the ACL.");
            return Ok(Verdict::dunno_because("access control delegated to mlmmj"));
        }

        if policy == AccessPolicy::Public {
            return Ok(Verdict::dunno_because(
                "access policy: public, no restriction",
            ));
        }

        let valid_rcpt_domains = accounts.primary_and_alias_domains(recipient_domain).await?;
        log::debug!(
            "Primary and all alias domain names of recipient domain ({recipient_domain}): {}",
            valid_rcpt_domains.join(", ")
        );

        if let Some(verdict) = Self::explicitly_allowed(&entry, sender, sender_domain) {
            return Ok(verdict);
        }
        log::debug!("Sender is not explicitly allowed, perform extra query to check access.");

        let allowed = match &policy {
            AccessPolicy::Public => true,
            AccessPolicy::Domain => valid_rcpt_domains.iter().any(|d| d == sender_domain),
            AccessPolicy::Subdomain => valid_rcpt_domains
                .iter()
                .any(|d| DomainUtils::is_subdomain_of(sender_domain, d)),
            AccessPolicy::MembersOnly => accounts
                .list_members(recipient)
                .await?
                .iter()
                .any(|m| m == sender),
            AccessPolicy::MembersAndModeratorsOnly => {
                match accounts.list_members_and_moderators(recipient).await {
                    Ok(senders) => senders.iter().any(|s| s == sender),
                    Err(e) => {
                        let msg = format!(
                            "Error while querying allowed senders of mailing list (access policy: {policy}): {e:#}"
                        );
                        log::error!("{msg}");
                        return Ok(Verdict::dunno_because(msg));
                    }
                }
            }
            AccessPolicy::Moderators => {
                if ctx.sasl_username.is_empty() {
                    return Ok(Verdict::reject(RejectKind::NotAuthorized));
                }
                let senders = Self::moderator_senders(accounts, &entry, recipient_domain).await?;
                senders.iter().any(|s| s == sender || s == sender_domain)
            }
            AccessPolicy::Unknown(value) => {
                return Ok(Verdict::dunno_because(format!(
                    "unknown access policy: {value}, no restriction"
                )))
            }
        };

        if allowed {
            log::info!(
                "Sender ({sender}) is allowed by access policy of mailing list: {policy}."
            );
            Ok(Verdict::dunno())
        } else {
            Ok(Verdict::reject(RejectKind::NotAuthorized))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProtocolState;
    use crate::directory::ldap::tests::{sample_directory, BASE_DN};
    use crate::directory::ldap::LdapPool;
    use crate::directory::memory::MemoryDirectory;
    use crate::directory::sql::tests::sample_pool;
    use crate::directory::{BackendPool, DirectoryStore, Filter, SearchScope};
    use anyhow::bail;
    use std::sync::Arc;
    use std::time::Duration;

    /// Directory that fails every search whose filter contains `fail_on`.
    struct FlakyStore {
        inner: MemoryDirectory,
        fail_on: &'static str,
    }

    #[async_trait]
    impl DirectoryStore for FlakyStore {
        async fn search(
            &self,
            base_dn: &str,
            scope: SearchScope,
            filter: &Filter,
            attrs: &[&str],
        ) -> Result<Vec<(String, DirectoryEntry)>> {
            if filter.to_string().contains(self.fail_on) {
                bail!("connection reset by peer");
            }
            self.inner.search(base_dn, scope, filter, attrs).await
        }
    }

    fn list_entry(policy: Option<&str>, allowed: &[&str]) -> DirectoryEntry {
        let mut entry = DirectoryEntry::new()
            .with("objectClass", ["mailList"])
            .with("mail", ["list@example.com"])
            .with("accountStatus", ["active"])
            .with("listAllowedUser", allowed.iter().copied());
        if let Some(policy) = policy {
            entry.push("accessPolicy", policy);
        }
        entry
    }

    fn directory_with_list(entry: DirectoryEntry) -> MemoryDirectory {
        let mut directory = sample_directory();
        directory.insert(
            "mail=list@example.com,ou=Groups,domainName=example.com,o=domains,dc=example,dc=com",
            entry,
        );
        directory
    }

    async fn evaluate_with(
        store: impl DirectoryStore + 'static,
        sender: &str,
        recipient: &str,
        sasl_username: &str,
    ) -> Verdict {
        let pool = LdapPool::new(Arc::new(store), BASE_DN, Duration::from_secs(5));
        let accounts = pool.acquire().await.unwrap();
        let ctx = TransactionContext::builder(ProtocolState::Rcpt)
            .sender(sender)
            .recipient(recipient)
            .sasl_username(sasl_username)
            .client_address("198.51.100.20")
            .build();
        AccessPolicyResolver::new()
            .evaluate(&ctx, accounts.as_ref())
            .await
            .unwrap()
    }

    async fn evaluate(directory: MemoryDirectory, sender: &str, sasl_username: &str) -> Verdict {
        evaluate_with(directory, sender, "list@example.com", sasl_username).await
    }

    async fn evaluate_sql(sender: &str, recipient: &str) -> Verdict {
        let accounts = sample_pool().await.acquire().await.unwrap();
        let ctx = TransactionContext::builder(ProtocolState::Rcpt)
            .sender(sender)
            .recipient(recipient)
            .client_address("198.51.100.20")
            .build();
        let verdict = AccessPolicyResolver::new()
            .evaluate(&ctx, accounts.as_ref())
            .await
            .unwrap();
        accounts.release().await.unwrap();
        verdict
    }

    fn not_authorized() -> Verdict {
        Verdict::reject(RejectKind::NotAuthorized)
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(AccessPolicy::from_attribute(None), AccessPolicy::Public);
        assert_eq!(
            AccessPolicy::from_attribute(Some("AllowedOnly")),
            AccessPolicy::Moderators
        );
        assert_eq!(
            AccessPolicy::from_attribute(Some("membersandmoderatorsonly")),
            AccessPolicy::MembersAndModeratorsOnly
        );
        assert_eq!(
            AccessPolicy::from_attribute(Some("everyone")),
            AccessPolicy::Unknown("everyone".to_string())
        );
        assert_eq!(AccessPolicy::Moderators.to_string(), "moderatorsonly");
    }

    #[tokio::test]
    async fn test_public_list_accepts_anyone() {
        for sender in ["stranger@remote.test", "alice@example.com", ""] {
            let verdict =
                evaluate_with(sample_directory(), sender, "public@example.com", "").await;
            assert!(verdict.is_default(), "{sender}: {verdict}");
        }
    }

    #[tokio::test]
    async fn test_members_only_list() {
        let rcpt = "members@example.com";
        assert_eq!(
            evaluate_with(sample_directory(), "stranger@remote.test", rcpt, "").await,
            not_authorized()
        );
        for sender in ["alice@example.com", "ali@example.com", "ext@remote.test"] {
            assert!(evaluate_with(sample_directory(), sender, rcpt, "")
                .await
                .is_default());
        }
        // listAllowedUser
        assert!(
            evaluate_with(sample_directory(), "boss@elsewhere.test", rcpt, "")
                .await
                .is_default()
        );
    }

    #[tokio::test]
    async fn test_non_list_recipients() {
        for rcpt in ["alice@example.com", "nobody@example.com", "support@example.com"] {
            assert!(evaluate_with(sample_directory(), "x@remote.test", rcpt, "")
                .await
                .is_default());
        }
        assert!(evaluate_with(
            sample_directory(),
            "x@remote.test",
            "members@example.com",
            "members@example.com"
        )
        .await
        .is_default());
    }

    #[tokio::test]
    async fn test_disabled_list_is_rejected_whatever_the_policy() {
        for policy in [None, Some("public"), Some("membersonly")] {
            let entry = list_entry(policy, &["stranger@remote.test"]);
            let mut disabled = DirectoryEntry::new();
            for attr in entry.attribute_names() {
                if attr != "accountstatus" {
                    disabled = disabled.with(attr, entry.get(attr).to_vec());
                }
            }
            let disabled = disabled.with("accountStatus", ["disabled"]);

            assert_eq!(
                evaluate(directory_with_list(disabled), "stranger@remote.test", "").await,
                Verdict::reject(RejectKind::Generic)
            );
        }
    }

    #[tokio::test]
    async fn test_mlmmj_lists_are_delegated() {
        assert!(evaluate_with(
            sample_directory(),
            "stranger@remote.test",
            "announce@example.com",
            ""
        )
        .await
        .is_default());
    }

    #[tokio::test]
    async fn test_domain_and_subdomain_policies() {
        let cases = [
            ("domain", "bob@example.com", true),
            ("domain", "bob@example.net", true),
            ("domain", "bob@sales.example.com", false),
            ("domain", "bob@other.test", false),
            ("subdomain", "bob@example.com", true),
            ("subdomain", "bob@sales.example.com", true),
            ("subdomain", "bob@eu.alias.example.org", true),
            ("subdomain", "bob@badexample.com", false),
        ];
        for (policy, sender, accepted) in cases {
            let directory = directory_with_list(list_entry(Some(policy), &[]));
            let verdict = evaluate(directory, sender, "").await;
            if accepted {
                assert!(verdict.is_default(), "{policy}/{sender}: {verdict}");
            } else {
                assert_eq!(verdict, not_authorized(), "{policy}/{sender}");
            }
        }
    }

    #[tokio::test]
    async fn test_moderators_and_owners_bypass() {
        let entry = list_entry(Some("membersonly"), &[])
            .with("listModerator", ["Mod@Remote.test"])
            .with("listOwner", ["owner@remote.test"]);
        for sender in ["mod@remote.test", "owner@remote.test"] {
            assert!(evaluate(directory_with_list(entry.clone()), sender, "")
                .await
                .is_default());
        }
    }

    #[tokio::test]
    async fn test_explicit_allow_list_forms() {
        let cases = [
            ("someone@partner.test", true),
            ("a@wild.test", true),
            ("x@deep.sub.trusted.test", true),
            ("x@trusted.test", false),
            ("x@host.exact.test", false),
            ("x@exact.test", true),
        ];
        let allowed = [
            "someone@partner.test",
            "*@wild.test",
            ".sub.trusted.test",
            "exact.test",
        ];
        for (sender, accepted) in cases {
            let directory = directory_with_list(list_entry(Some("membersonly"), &allowed));
            let verdict = evaluate(directory, sender, "").await;
            assert_eq!(verdict.is_default(), accepted, "{sender}: {verdict}");
        }
    }

    #[tokio::test]
    async fn test_allow_list_is_order_independent_and_idempotent() {
        let variants: [&[&str]; 3] = [
            &["a@partner.test", "b@partner.test"],
            &["b@partner.test", "a@partner.test"],
            &["b@partner.test", "a@partner.test", "a@partner.test"],
        ];
        for allowed in variants {
            for (sender, accepted) in [("a@partner.test", true), ("c@partner.test", false)] {
                let directory = directory_with_list(list_entry(Some("membersonly"), allowed));
                assert_eq!(
                    evaluate(directory, sender, "").await.is_default(),
                    accepted
                );
            }
        }
    }

    #[tokio::test]
    async fn test_members_and_moderators_only() {
        let rcpt = "team@example.com";
        assert!(evaluate_with(sample_directory(), "alice@example.com", rcpt, "")
            .await
            .is_default());
        assert!(evaluate_with(sample_directory(), "mod@outside.test", rcpt, "")
            .await
            .is_default());
        assert_eq!(
            evaluate_with(sample_directory(), "bob@example.com", rcpt, "").await,
            not_authorized()
        );
    }

    #[tokio::test]
    async fn test_members_and_moderators_query_error_fails_open() {
        let store = FlakyStore {
            inner: sample_directory(),
            fail_on: "(|(&(memberOfGroup=",
        };
        let verdict = evaluate_with(store, "bob@example.com", "team@example.com", "").await;
        match verdict {
            Verdict::Default {
                reason: Some(reason),
            } => assert!(reason.contains("Error while querying allowed senders")),
            other => panic!("unexpected verdict: {other}"),
        }
    }

    #[tokio::test]
    async fn test_members_only_query_error_propagates() {
        let store = FlakyStore {
            inner: sample_directory(),
            fail_on: "(memberOfGroup=members@example.com)",
        };
        let pool = LdapPool::new(Arc::new(store), BASE_DN, Duration::from_secs(5));
        let accounts = pool.acquire().await.unwrap();
        let ctx = TransactionContext::builder(ProtocolState::Rcpt)
            .sender("bob@example.com")
            .recipient("members@example.com")
            .build();
        assert!(AccessPolicyResolver::new()
            .evaluate(&ctx, accounts.as_ref())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_moderators_policy() {
        let allowed = [
            "ali@example.com",
            "partner.org",
            "outsider@remote.test",
            "*@wild.test",
        ];
        let entry = list_entry(Some("moderatorsonly"), &allowed);

        assert_eq!(
            evaluate(directory_with_list(entry.clone()), "alice@example.com", "").await,
            not_authorized()
        );

        let cases = [
            ("alice@example.com", true),
            ("x@partner-alias.org", true),
            ("x@partner.org", true),
            ("outsider@remote.test", true),
            ("bob@example.com", false),
            ("x@unrelated.test", false),
        ];
        for (sender, accepted) in cases {
            let verdict = evaluate(
                directory_with_list(entry.clone()),
                sender,
                "alice@example.com",
            )
            .await;
            if accepted {
                assert!(verdict.is_default(), "{sender}: {verdict}");
            } else {
                assert_eq!(verdict, not_authorized(), "{sender}");
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_policy_fails_open() {
        let directory = directory_with_list(list_entry(Some("everyone"), &[]));
        match evaluate(directory, "x@remote.test", "").await {
            Verdict::Default {
                reason: Some(reason),
            } => assert!(reason.contains("unknown access policy: everyone")),
            other => panic!("unexpected verdict: {other}"),
        }
    }

    #[tokio::test]
    async fn test_relational_backend() {
        assert_eq!(
            evaluate_sql("bob@example.com", "old@example.com").await,
            Verdict::reject(RejectKind::Generic)
        );
        assert!(evaluate_sql("boss@elsewhere.test", "announce@example.com")
            .await
            .is_default());
        assert_eq!(
            evaluate_sql("stranger@remote.test", "announce@example.com").await,
            not_authorized()
        );
        assert!(evaluate_sql("stranger@remote.test", "alice@example.com")
            .await
            .is_default());
    }
}
