//! Reject senders whose address does not belong to the authenticated login,
//! and unauthenticated senders forging a locally hosted domain.

use super::{Plugin, REJECT_SENDER_LOGIN_MISMATCH};
use crate::config::Config;
use crate::context::TransactionContext;
use crate::directory::{AccountBackend, MismatchModes, SenderRelation};
use crate::domain_utils::DomainUtils;
use crate::mlmmj::ListMembership;
use crate::spf::SpfChecker;
use crate::trusted::TrustedNetworks;
use crate::verdict::{RejectKind, Verdict};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct LoginMismatchSettings {
    pub check_forged_sender: bool,
    /// Addresses, domains or `name@*` allowed to send unauthenticated
    /// from a local domain.
    pub allowed_forged_senders: Vec<String>,
    /// Logins (or login domains, `@domain`, `@.`) allowed to send as
    /// another address.
    pub allowed_senders: Vec<String>,
    pub modes: MismatchModes,
    pub check_spf: bool,
    pub trusted_networks: TrustedNetworks,
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.trim().to_lowercase()).collect()
}

impl LoginMismatchSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            check_forged_sender: config.check_forged_sender,
            allowed_forged_senders: lowercase_all(&config.allowed_forged_senders),
            allowed_senders: lowercase_all(&config.allowed_login_mismatch_senders),
            modes: MismatchModes {
                strict: config.allowed_login_mismatch_strictly,
                list_member: config.allowed_login_mismatch_list_member,
            },
            check_spf: config.check_spf_if_login_mismatch,
            trusted_networks: config.trusted_networks()?,
        })
    }
}

pub struct LoginMismatchResolver {
    settings: LoginMismatchSettings,
    spf: Arc<dyn SpfChecker>,
    membership: Option<Arc<dyn ListMembership>>,
}

impl LoginMismatchResolver {
    pub fn new(
        settings: LoginMismatchSettings,
        spf: Arc<dyn SpfChecker>,
        membership: Option<Arc<dyn ListMembership>>,
    ) -> Self {
        Self {
            settings,
            spf,
            membership,
        }
    }

    /// Unauthenticated mail claiming to come from a local domain.
    async fn check_forged_sender(
        &self,
        ctx: &TransactionContext,
        accounts: &dyn AccountBackend,
    ) -> Result<Verdict> {
        log::debug!("Not an authenticated sender (no sasl_username).");

        if self.settings.trusted_networks.contains(&ctx.client_address) {
            log::debug!("Bypass trusted client.");
            return Ok(Verdict::dunno_because("trusted client"));
        }

        if !self.settings.check_forged_sender {
            log::debug!("Skip forged sender checks.");
            return Ok(Verdict::dunno());
        }

        let sender = ctx.sender_without_ext.as_str();
        let sender_domain = ctx.sender_domain.as_str();
        let name_wildcard = format!("{}@*", DomainUtils::local_part(sender));
        let allowed = &self.settings.allowed_forged_senders;
        if allowed
            .iter()
            .any(|a| a == sender || a == sender_domain || *a == name_wildcard)
        {
            log::debug!("Bypass allowed forged sender.");
            return Ok(Verdict::dunno_because("allowed forged sender"));
        }

        let is_local = if !sender_domain.is_empty() && sender_domain == ctx.recipient_domain {
            log::debug!("Sender domain is same as recipient domain.");
            true
        } else {
            accounts.is_local_domain(sender_domain, false).await?
        };

        if !is_local {
            log::debug!("Sender domain is NOT hosted locally.");
            return Ok(Verdict::dunno());
        }
        log::debug!("Sender domain is hosted locally, smtp authentication is required.");

        if self.settings.check_spf {
            log::debug!("Check whether client is allowed smtp server against DNS SPF record.");
            if self
                .spf
                .is_authorized_sender(sender_domain, &ctx.client_address)
                .await
            {
                log::debug!("Sender server is listed in DNS SPF record, bypassed.");
                return Ok(Verdict::dunno_because("client listed in SPF record"));
            }
            log::debug!("Sender server is NOT listed in DNS SPF record.");
        }

        log::debug!("Sender is considered as forged, rejecting");
        Ok(Verdict::reject(RejectKind::ForgedSender))
    }

    /// Explicit allow-list: the login or its domain may send as anyone;
    /// `@login-domain` and `@.` only as addresses of the login's domain.
    fn explicitly_allowed(&self, ctx: &TransactionContext) -> bool {
        let allowed = &self.settings.allowed_senders;
        if allowed.is_empty() {
            return false;
        }
        log::debug!("Allowed SASL senders: {}", allowed.join(", "));

        let login_domain = ctx.sasl_username_domain.as_str();
        if allowed.iter().any(|a| *a == ctx.sasl_username) {
            log::debug!("Sender SASL username is explicitly allowed.");
            return true;
        }
        if allowed.iter().any(|a| a == login_domain) {
            log::debug!("Sender domain name is explicitly allowed.");
            return true;
        }

        let same_domain_entry = format!("@{login_domain}");
        if allowed.iter().any(|a| *a == same_domain_entry || a == "@.")
            && login_domain == ctx.sender_domain
        {
            log::debug!("Login may send as other users of the same domain.");
            return true;
        }

        log::debug!(
            "Sender is not allowed to send email as other user (allowed_login_mismatch_senders)."
        );
        false
    }
}

#[async_trait]
impl Plugin for LoginMismatchResolver {
    fn name(&self) -> &str {
        REJECT_SENDER_LOGIN_MISMATCH
    }

    async fn evaluate(
        &self,
        ctx: &TransactionContext,
        accounts: &dyn AccountBackend,
    ) -> Result<Verdict> {
        let login = ctx.sasl_username.as_str();
        let sender = ctx.sender_without_ext.as_str();

        if login.is_empty() {
            return self.check_forged_sender(ctx, accounts).await;
        }

        // null sender is left to other checks
        if sender.is_empty() {
            return Ok(Verdict::dunno());
        }

        log::debug!("Sender: {sender}, SASL username: {login}");
        if sender == login {
            log::debug!("SKIP: sender == sasl username.");
            return Ok(Verdict::dunno());
        }

        let modes = self.settings.modes;
        if self.settings.allowed_senders.is_empty() && !modes.any() {
            log::debug!("No allowed senders in config file.");
            return Ok(Verdict::reject(RejectKind::SenderLoginMismatch));
        }

        if self.explicitly_allowed(ctx) {
            return Ok(Verdict::dunno_because("login explicitly allowed"));
        }

        if modes.strict {
            log::debug!("Apply strict restriction (allowed_login_mismatch_strictly).");
        }
        if modes.list_member {
            log::debug!("Apply list/alias member restriction (allowed_login_mismatch_list_member).");
        }

        match accounts.sender_relation(login, sender, modes).await? {
            SenderRelation::Owned => {
                return Ok(Verdict::dunno_because(
                    "sender is an alias of the login or a list/alias it belongs to",
                ))
            }
            SenderRelation::SubscribableList { list } => match &self.membership {
                Some(membership) => {
                    if membership.has_subscriber(&list, login).await {
                        log::debug!("SASL username ({login}) is a member of mailing list ({sender}).");
                        return Ok(Verdict::dunno_because("login subscribed to mailing list"));
                    }
                }
                None => log::debug!("No mlmmjadmin api configured, skip subscriber check."),
            },
            SenderRelation::Unrelated => {}
        }

        Ok(Verdict::reject(RejectKind::SenderLoginMismatch))
    }
}
