pub mod maillist_access_policy;
pub mod sender_login_mismatch;

pub use maillist_access_policy::{AccessPolicy, AccessPolicyResolver};
pub use sender_login_mismatch::{LoginMismatchResolver, LoginMismatchSettings};

use crate::config::Config;
use crate::context::{ProtocolState, TransactionContext};
use crate::directory::AccountBackend;
use crate::mlmmj::ListMembership;
use crate::spf::SpfChecker;
use crate::verdict::Verdict;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub const MAILLIST_ACCESS_POLICY: &str = "maillist_access_policy";
pub const REJECT_SENDER_LOGIN_MISMATCH: &str = "reject_sender_login_mismatch";

const KNOWN_PLUGINS: &[&str] = &[MAILLIST_ACCESS_POLICY, REJECT_SENDER_LOGIN_MISMATCH];

pub fn is_known_plugin(name: &str) -> bool {
    KNOWN_PLUGINS.contains(&name)
}

/// A decision unit in the policy chain.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Protocol states this plugin is consulted in.
    fn protocol_states(&self) -> &[ProtocolState] {
        &[ProtocolState::Rcpt]
    }

    async fn evaluate(
        &self,
        ctx: &TransactionContext,
        accounts: &dyn AccountBackend,
    ) -> Result<Verdict>;
}

/// Instantiate the configured plugins in configuration order.
pub fn build_plugins(
    config: &Config,
    spf: Arc<dyn SpfChecker>,
    membership: Option<Arc<dyn ListMembership>>,
) -> Result<Vec<Box<dyn Plugin>>> {
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::with_capacity(config.plugins.len());

    for name in &config.plugins {
        match name.as_str() {
            MAILLIST_ACCESS_POLICY => plugins.push(Box::new(AccessPolicyResolver::new())),
            REJECT_SENDER_LOGIN_MISMATCH => {
                plugins.push(Box::new(LoginMismatchResolver::new(
                    LoginMismatchSettings::from_config(config)?,
                    spf.clone(),
                    membership.clone(),
                )));
            }
            other => bail!("unknown plugin: {other}"),
        }
        log::info!("Loaded plugin: {name}");
    }

    Ok(plugins)
}
