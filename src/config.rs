use crate::plugins;
use crate::trusted::TrustedNetworks;
use crate::verdict::Verdict;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` the policy service listens on.
    pub listen_address: String,
    pub backend: BackendKind,
    pub ldap: LdapConfig,
    pub sql: SqlConfig,
    /// Enabled plugins, applied in this order.
    pub plugins: Vec<String>,
    /// Action returned when every plugin answers DUNNO.
    pub default_action: String,
    pub backend_timeout_seconds: u64,
    /// Trusted client networks (addresses or CIDR blocks).
    pub mynetworks: Vec<String>,
    pub check_forged_sender: bool,
    pub allowed_forged_senders: Vec<String>,
    pub allowed_login_mismatch_senders: Vec<String>,
    pub allowed_login_mismatch_strictly: bool,
    pub allowed_login_mismatch_list_member: bool,
    pub check_spf_if_login_mismatch: bool,
    pub spf_timeout_seconds: u64,
    pub mlmmjadmin: MlmmjAdminConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ldap,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub base_dn: String,
    /// YAML file with the directory entries served by the built-in store.
    pub entries_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlmmjAdminConfig {
    pub api_endpoint: Option<String>,
    pub api_auth_token: Option<String>,
    pub auth_token_header: String,
    pub timeout_seconds: u64,
    pub verify_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: "127.0.0.1:7777".to_string(),
            backend: BackendKind::Ldap,
            ldap: LdapConfig::default(),
            sql: SqlConfig::default(),
            plugins: vec![
                plugins::REJECT_SENDER_LOGIN_MISMATCH.to_string(),
                plugins::MAILLIST_ACCESS_POLICY.to_string(),
            ],
            default_action: "DUNNO".to_string(),
            backend_timeout_seconds: 10,
            mynetworks: Vec::new(),
            check_forged_sender: true,
            allowed_forged_senders: Vec::new(),
            allowed_login_mismatch_senders: Vec::new(),
            allowed_login_mismatch_strictly: true,
            allowed_login_mismatch_list_member: false,
            check_spf_if_login_mismatch: false,
            spf_timeout_seconds: 5,
            mlmmjadmin: MlmmjAdminConfig::default(),
        }
    }
}

impl Default for LdapConfig {
    fn default() -> Self {
        LdapConfig {
            base_dn: "o=domains,dc=example,dc=com".to_string(),
            entries_file: "/etc/mta-policyd/directory.yaml".to_string(),
        }
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        SqlConfig {
            database_url: "sqlite:/var/lib/mta-policyd/vmail.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for MlmmjAdminConfig {
    fn default() -> Self {
        MlmmjAdminConfig {
            api_endpoint: None,
            api_auth_token: None,
            auth_token_header: "X-MLMMJADMIN-API-AUTH-TOKEN".to_string(),
            timeout_seconds: 10,
            verify_tls: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_verdict(&self) -> anyhow::Result<Verdict> {
        self.default_action
            .parse()
            .with_context(|| format!("invalid default_action: {}", self.default_action))
    }

    pub fn trusted_networks(&self) -> anyhow::Result<TrustedNetworks> {
        TrustedNetworks::from_strings(&self.mynetworks)
    }

    /// Catch configuration mistakes before the listener starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        for name in &self.plugins {
            if !plugins::is_known_plugin(name) {
                bail!("unknown plugin: {name}");
            }
        }

        let verdict = self.default_verdict()?;
        if verdict.reject_kind().is_some() {
            log::warn!("default_action rejects every message that no plugin accepts");
        }

        self.trusted_networks()?;

        if self.mlmmjadmin.api_endpoint.is_some() && self.mlmmjadmin.api_auth_token.is_none() {
            bail!("mlmmjadmin.api_endpoint is set but mlmmjadmin.api_auth_token is missing");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.default_verdict().unwrap(), Verdict::dunno());
        assert!(config.allowed_login_mismatch_strictly);
        assert!(!config.allowed_login_mismatch_list_member);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
backend: sql
sql:
  database_url: "sqlite::memory:"
allowed_login_mismatch_senders:
  - example.com
mynetworks:
  - 192.168.0.0/24
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend, BackendKind::Sql);
        assert_eq!(config.sql.database_url, "sqlite::memory:");
        assert_eq!(config.sql.max_connections, 10);
        assert_eq!(config.allowed_login_mismatch_senders, vec!["example.com"]);
        assert_eq!(config.listen_address, "127.0.0.1:7777");
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_plugin_fails_validation() {
        let config = Config {
            plugins: vec!["greylisting".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_network_fails_validation() {
        let config = Config {
            mynetworks: vec!["not-a-network".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_without_token_fails_validation() {
        let mut config = Config::default();
        config.mlmmjadmin.api_endpoint = Some("http://127.0.0.1:7790/api".to_string());
        assert!(config.validate().is_err());
    }
}
