use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical model identity, mapped to a concrete provider+model via
/// configuration (see `vesper_core::config::ProvidersConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Default,
    Quick,
    Router,
    Deep,
    Browser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Default => "default",
            Role::Quick => "quick",
            Role::Router => "router",
            Role::Deep => "deep",
            Role::Browser => "browser",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Role::Default),
            "quick" => Ok(Role::Quick),
            "router" => Ok(Role::Router),
            "deep" => Ok(Role::Deep),
            "browser" => Ok(Role::Browser),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Opaque, time-sortable ID used for sessions and cron jobs alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VesperId(pub String);

impl VesperId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VesperId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VesperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outbound message to deliver on a named channel — produced by the
/// notifier collaborator or by a session that wants to reach the user
/// proactively (e.g. an ESCALATE-tier heartbeat outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutbound {
    pub recipient: String,
    pub message: String,
}
