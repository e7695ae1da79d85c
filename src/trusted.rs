use anyhow::Context;
use cidr::IpCidr;
use std::net::IpAddr;
use std::str::FromStr;

/// Client networks whose unauthenticated mail is never treated as forged.
/// Loopback addresses are always trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedNetworks {
    networks: Vec<IpCidr>,
}

impl TrustedNetworks {
    pub fn from_strings(entries: &[String]) -> anyhow::Result<Self> {
        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                match entry.parse::<IpAddr>() {
                    Ok(host) => Ok(IpCidr::new_host(host)),
                    Err(_) => IpCidr::from_str(entry)
                        .with_context(|| format!("invalid trusted network: {entry}")),
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    pub fn contains(&self, client_address: &str) -> bool {
        let ip = match client_address.trim().parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                log::debug!("Client address is not an IP address: {client_address}");
                return false;
            }
        };

        ip.is_loopback() || self.networks.iter().any(|net| net.contains(&ip))
    }
}
