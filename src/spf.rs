//! Check whether a client may send for a domain according to its SPF record.
//!
//! Records are evaluated by `viaspf` (RFC 7208); only a `pass` result
//! authorizes the client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;
use viaspf::lookup::Lookup;
use viaspf::{Config, QueryResult, Sender, SpfResult};

#[async_trait]
pub trait SpfChecker: Send + Sync {
    /// `true` only when the SPF record of `domain` passes `ip`.
    /// Lookup failures and timeouts answer `false`.
    async fn is_authorized_sender(&self, domain: &str, ip: &str) -> bool;
}

pub struct DnsSpfChecker<L> {
    lookup: L,
    config: Config,
    timeout: Duration,
}

impl<L: Lookup> DnsSpfChecker<L> {
    pub fn new(lookup: L, timeout: Duration) -> Self {
        Self {
            lookup,
            config: Config::default(),
            timeout,
        }
    }

    async fn query(&self, sender: &Sender, ip: IpAddr) -> QueryResult {
        viaspf::evaluate_sender(&self.lookup, &self.config, ip, sender, None).await
    }
}

impl DnsSpfChecker<TokioAsyncResolver> {
    pub fn from_system_conf(timeout: Duration) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .context("Failed to create DNS resolver")?;
        Ok(Self::new(resolver, timeout))
    }
}

#[async_trait]
impl<L: Lookup> SpfChecker for DnsSpfChecker<L> {
    async fn is_authorized_sender(&self, domain: &str, ip: &str) -> bool {
        let ip = match ip.trim().parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                log::debug!("Client address is not an IP address: {ip}");
                return false;
            }
        };

        let sender = match Sender::from_domain(domain) {
            Ok(sender) => sender,
            Err(e) => {
                log::debug!("Cannot check SPF for {domain}: {e}");
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, self.query(&sender, ip)).await {
            Ok(result) => {
                log::debug!("SPF result of {domain} for {ip}: {}", result.spf_result);
                matches!(result.spf_result, SpfResult::Pass)
            }
            Err(_) => {
                log::warn!("SPF check timed out for {domain}");
                false
            }
        }
    }
}
