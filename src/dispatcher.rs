use crate::config::{BackendKind, Config};
use crate::context::TransactionContext;
use crate::directory::ldap::LdapPool;
use crate::directory::memory::MemoryDirectory;
use crate::directory::sql::SqlPool;
use crate::directory::{AccountBackend, BackendPool};
use crate::mlmmj::{ListMembership, MlmmjAdminClient};
use crate::plugins::{self, Plugin};
use crate::spf::{DnsSpfChecker, SpfChecker};
use crate::verdict::Verdict;
use anyhow::Context;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Runs the plugin chain for one transaction.
///
/// Plugins run in configuration order; the first verdict other than
/// DUNNO ends the chain. A plugin that fails or panics is logged and
/// skipped.
pub struct Dispatcher {
    plugins: Vec<Box<dyn Plugin>>,
    backends: Arc<dyn BackendPool>,
    default_verdict: Verdict,
}

impl Dispatcher {
    pub fn new(
        plugins: Vec<Box<dyn Plugin>>,
        backends: Arc<dyn BackendPool>,
        default_verdict: Verdict,
    ) -> Self {
        Self {
            plugins,
            backends,
            default_verdict,
        }
    }

    /// Wire up the backend, external checkers and plugins named in `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let timeout = Duration::from_secs(config.backend_timeout_seconds);

        let backends: Arc<dyn BackendPool> = match config.backend {
            BackendKind::Ldap => {
                let directory = MemoryDirectory::from_file(&config.ldap.entries_file)?;
                log::info!(
                    "Loaded {} directory entries from {}",
                    directory.len(),
                    config.ldap.entries_file
                );
                Arc::new(LdapPool::new(
                    Arc::new(directory),
                    &config.ldap.base_dn,
                    timeout,
                ))
            }
            BackendKind::Sql => Arc::new(
                SqlPool::connect(
                    &config.sql.database_url,
                    config.sql.max_connections,
                    timeout,
                )
                .await?,
            ),
        };

        let spf: Arc<dyn SpfChecker> = Arc::new(
            DnsSpfChecker::from_system_conf(Duration::from_secs(config.spf_timeout_seconds))
                .context("Failed to set up SPF checks")?,
        );
        let membership = MlmmjAdminClient::from_config(&config.mlmmjadmin)?
            .map(|client| Arc::new(client) as Arc<dyn ListMembership>);

        let plugins = plugins::build_plugins(config, spf, membership)?;
        Ok(Self::new(plugins, backends, config.default_verdict()?))
    }

    pub fn default_verdict(&self) -> Verdict {
        self.default_verdict.clone()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub async fn evaluate(&self, ctx: &TransactionContext) -> Verdict {
        if self.plugins.is_empty() {
            return Verdict::dunno_because("no enabled plugins");
        }

        let accounts = match self.backends.acquire().await {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Backend unavailable: {e:#}");
                return self.default_verdict.clone();
            }
        };

        let verdict = self.run_chain(ctx, accounts.as_ref()).await;

        if let Err(e) = accounts.release().await {
            log::warn!("Failed to release backend handle: {e:#}");
        }

        verdict
    }

    async fn run_chain(&self, ctx: &TransactionContext, accounts: &dyn AccountBackend) -> Verdict {
        for plugin in &self.plugins {
            if !plugin.protocol_states().contains(&ctx.protocol_state) {
                log::debug!(
                    "Skip plugin: {} (protocol_state != {})",
                    plugin.name(),
                    ctx.protocol_state
                );
                continue;
            }

            log::debug!("--> Apply plugin: {}", plugin.name());
            let outcome = AssertUnwindSafe(plugin.evaluate(ctx, accounts))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    log::error!("Plugin {} panicked, skipping it", plugin.name());
                    continue;
                }
            };

            match result {
                Ok(verdict) if verdict.is_default() => {
                    log::debug!("<-- Result: {verdict}");
                }
                Ok(verdict) => {
                    log::info!(
                        "[{}] {}, {} -> {}, {} [{}]",
                        ctx.client_address,
                        ctx.protocol_state,
                        ctx.sender,
                        ctx.recipient,
                        verdict,
                        plugin.name()
                    );
                    return verdict;
                }
                Err(e) => {
                    log::error!("Error while applying plugin {}: {e:#}", plugin.name());
                }
            }
        }

        self.default_verdict.clone()
    }
}
