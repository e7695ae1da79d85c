use crate::domain_utils::DomainUtils;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// SMTP protocol state a policy request was issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Connect,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    EndOfMessage,
}

impl FromStr for ProtocolState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "CONNECT" => Ok(Self::Connect),
            "EHLO" | "HELO" => Ok(Self::Ehlo),
            "MAIL" => Ok(Self::Mail),
            "RCPT" => Ok(Self::Rcpt),
            "DATA" => Ok(Self::Data),
            "END-OF-MESSAGE" => Ok(Self::EndOfMessage),
            other => Err(anyhow!("unknown protocol state: {other}")),
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Ehlo => "EHLO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::EndOfMessage => "END-OF-MESSAGE",
        };
        f.write_str(name)
    }
}

/// Snapshot of one SMTP transaction as seen by the plugins.
///
/// Addresses are lower-cased; the `*_without_ext` forms have any `+tag`
/// subaddress extension removed. Domains are empty when the matching
/// address is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionContext {
    pub protocol_state: ProtocolState,
    pub sender: String,
    pub sender_without_ext: String,
    pub sender_domain: String,
    pub recipient: String,
    pub recipient_without_ext: String,
    pub recipient_domain: String,
    pub client_address: String,
    pub sasl_username: String,
    pub sasl_username_domain: String,
}

impl TransactionContext {
    pub fn builder(protocol_state: ProtocolState) -> TransactionContextBuilder {
        TransactionContextBuilder {
            protocol_state: Some(protocol_state),
            ..Default::default()
        }
    }

    /// Build a context from the attribute map of a policy delegation request.
    pub fn from_attributes(attrs: &HashMap<String, String>) -> Result<Self> {
        let state = attrs
            .get("protocol_state")
            .ok_or_else(|| anyhow!("request has no protocol_state attribute"))?
            .parse::<ProtocolState>()?;

        let get = |name: &str| attrs.get(name).map(String::as_str).unwrap_or("");

        Ok(Self::builder(state)
            .sender(get("sender"))
            .recipient(get("recipient"))
            .client_address(get("client_address"))
            .sasl_username(get("sasl_username"))
            .build())
    }
}

#[derive(Debug, Default)]
pub struct TransactionContextBuilder {
    protocol_state: Option<ProtocolState>,
    sender: String,
    recipient: String,
    client_address: String,
    sasl_username: String,
}

impl TransactionContextBuilder {
    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = sender.trim().to_lowercase();
        self
    }

    pub fn recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.trim().to_lowercase();
        self
    }

    pub fn client_address(mut self, address: &str) -> Self {
        self.client_address = address.trim().to_string();
        self
    }

    pub fn sasl_username(mut self, username: &str) -> Self {
        self.sasl_username = username.trim().to_lowercase();
        self
    }

    pub fn build(self) -> TransactionContext {
        let sender_without_ext = DomainUtils::strip_extension(&self.sender);
        let recipient_without_ext = DomainUtils::strip_extension(&self.recipient);
        let domain_of = |addr: &str| DomainUtils::extract_domain(addr).unwrap_or_default();

        TransactionContext {
            protocol_state: self.protocol_state.unwrap_or(ProtocolState::Rcpt),
            sender_domain: domain_of(&self.sender),
            recipient_domain: domain_of(&self.recipient),
            sasl_username_domain: domain_of(&self.sasl_username),
            sender: self.sender,
            sender_without_ext,
            recipient: self.recipient,
            recipient_without_ext,
            client_address: self.client_address,
            sasl_username: self.sasl_username,
        }
    }
}
