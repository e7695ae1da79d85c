use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

/// Why a transaction was rejected. Each kind carries a fixed reason that is
/// safe to hand back to the SMTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectKind {
    Generic,
    NotAuthorized,
    SenderLoginMismatch,
    ForgedSender,
    /// Reject text supplied verbatim, e.g. from the configured default action.
    Custom,
}

impl RejectKind {
    pub fn text(&self) -> &'static str {
        match self {
            Self::Generic | Self::Custom => "Permission denied",
            Self::NotAuthorized => "Not authorized",
            Self::SenderLoginMismatch => "Sender is not same as SMTP authenticate username",
            Self::ForgedSender => {
                "Beware! Recipient domain is hosted locally, smtp authentication is required"
            }
        }
    }
}

/// Outcome of a plugin or of the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No opinion (`DUNNO`). The reason is diagnostic only and never sent.
    Default { reason: Option<String> },
    Reject { kind: RejectKind, reason: String },
    Defer { reason: String },
    /// Terminal action other than reject/defer, e.g. `OK` or `HOLD text`.
    Accept { action: String, text: Option<String> },
}

impl Verdict {
    pub fn dunno() -> Self {
        Self::Default { reason: None }
    }

    pub fn dunno_because(reason: impl Into<String>) -> Self {
        Self::Default {
            reason: Some(reason.into()),
        }
    }

    pub fn reject(kind: RejectKind) -> Self {
        Self::Reject {
            reason: kind.text().to_string(),
            kind,
        }
    }

    pub fn reject_with(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Self::reject(RejectKind::Generic);
        }
        Self::Reject {
            kind: RejectKind::Custom,
            reason,
        }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::Defer {
            reason: if reason.trim().is_empty() {
                "Service temporarily unavailable".to_string()
            } else {
                reason
            },
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default { .. })
    }

    pub fn reject_kind(&self) -> Option<&RejectKind> {
        match self {
            Self::Reject { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Action line for the policy protocol, without the `action=` prefix.
    pub fn action_line(&self) -> String {
        match self {
            Self::Default { .. } => "DUNNO".to_string(),
            Self::Reject { reason, .. } => format!("REJECT {reason}"),
            Self::Defer { reason } => format!("DEFER {reason}"),
            Self::Accept { action, text: None } => action.clone(),
            Self::Accept {
                action,
                text: Some(text),
            } => format!("{action} {text}"),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default {
                reason: Some(reason),
            } => write!(f, "DUNNO ({reason})"),
            other => f.write_str(&other.action_line()),
        }
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (word, text) = match s.split_once(char::is_whitespace) {
            Some((word, text)) => (word, text.trim()),
            None => (s, ""),
        };

        match word.to_uppercase().as_str() {
            "" => Err(anyhow!("empty action")),
            "DUNNO" => Ok(Self::dunno()),
            "REJECT" => Ok(Self::reject_with(text)),
            "DEFER" | "DEFER_IF_PERMIT" | "DEFER_IF_REJECT" => Ok(Self::defer(text)),
            action if action.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                Ok(Self::Accept {
                    action: action.to_string(),
                    text: (!text.is_empty()).then(|| text.to_string()),
                })
            }
            _ => Err(anyhow!("invalid action: {s}")),
        }
    }
}
