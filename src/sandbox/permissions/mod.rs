pub mod audit;
pub mod rules;

pub use audit::*;
pub use rules::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// A named class of side effect the isolated context can ask the host for.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    #[serde(alias = "fetch")]
    Network,
    #[serde(alias = "storage")]
    KeyValueStorage,
    Clipboard,
    #[serde(alias = "cookie")]
    Cookies,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Network,
        Capability::KeyValueStorage,
        Capability::Clipboard,
        Capability::Cookies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Network => "network",
            Capability::KeyValueStorage => "keyValueStorage",
            Capability::Clipboard => "clipboard",
            Capability::Cookies => "cookies",
        }
    }

    /// Parses a wire or CLI name, including the legacy aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "network" | "fetch" => Some(Capability::Network),
            "keyValueStorage" | "storage" => Some(Capability::KeyValueStorage),
            "clipboard" => Some(Capability::Clipboard),
            "cookies" | "cookie" => Some(Capability::Cookies),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDetails {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl NetworkDetails {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageOperation {
    Get,
    Set,
    Remove,
    Clear,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Set => "set",
            StorageOperation::Remove => "remove",
            StorageOperation::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDetails {
    pub operation: StorageOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOperation {
    Read,
    Write,
}

impl AccessOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOperation::Read => "read",
            AccessOperation::Write => "write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardDetails {
    pub operation: AccessOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieDetails {
    pub operation: AccessOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Capability-specific payload of a request. The variant determines the capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityDetails {
    Network(NetworkDetails),
    KeyValueStorage(StorageDetails),
    Clipboard(ClipboardDetails),
    Cookies(CookieDetails),
}

impl CapabilityDetails {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityDetails::Network(_) => Capability::Network,
            CapabilityDetails::KeyValueStorage(_) => Capability::KeyValueStorage,
            CapabilityDetails::Clipboard(_) => Capability::Clipboard,
            CapabilityDetails::Cookies(_) => Capability::Cookies,
        }
    }

    pub fn from_value(
        capability: Capability,
        details: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match capability {
            Capability::Network => CapabilityDetails::Network(serde_json::from_value(details)?),
            Capability::KeyValueStorage => {
                CapabilityDetails::KeyValueStorage(serde_json::from_value(details)?)
            }
            Capability::Clipboard => CapabilityDetails::Clipboard(serde_json::from_value(details)?),
            Capability::Cookies => CapabilityDetails::Cookies(serde_json::from_value(details)?),
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            CapabilityDetails::Network(d) => serde_json::to_value(d),
            CapabilityDetails::KeyValueStorage(d) => serde_json::to_value(d),
            CapabilityDetails::Clipboard(d) => serde_json::to_value(d),
            CapabilityDetails::Cookies(d) => serde_json::to_value(d),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Human-readable line shown in a permission prompt.
    pub fn summary(&self) -> String {
        match self {
            CapabilityDetails::Network(d) => format!("{} {}", d.method(), d.url),
            CapabilityDetails::KeyValueStorage(d) => match d.operation {
                StorageOperation::Clear => "Clear all storage".to_string(),
                op => format!(
                    "{} storage key \"{}\"",
                    op.as_str(),
                    d.key.as_deref().unwrap_or("")
                ),
            },
            CapabilityDetails::Clipboard(d) => match d.operation {
                AccessOperation::Read => "Read clipboard".to_string(),
                AccessOperation::Write => "Write to clipboard".to_string(),
            },
            CapabilityDetails::Cookies(d) => match d.operation {
                AccessOperation::Read => "Read cookies".to_string(),
                AccessOperation::Write => "Write cookie".to_string(),
            },
        }
    }

    /// The string rules are matched against.
    pub fn pattern(&self) -> String {
        match self {
            CapabilityDetails::Network(d) => match Url::parse(&d.url) {
                Ok(url) => match url.host_str() {
                    Some(host) => {
                        let mut pattern = host.to_string();
                        if let Some(port) = url.port() {
                            pattern.push(':');
                            pattern.push_str(&port.to_string());
                        }
                        pattern.push_str(url.path());
                        pattern
                    }
                    None => d.url.clone(),
                },
                Err(_) => d.url.clone(),
            },
            CapabilityDetails::KeyValueStorage(d) => {
                d.key.clone().unwrap_or_else(|| "*".to_string())
            }
            CapabilityDetails::Clipboard(d) => d.operation.as_str().to_string(),
            CapabilityDetails::Cookies(d) => match d.operation {
                AccessOperation::Read => "read".to_string(),
                AccessOperation::Write => d
                    .value
                    .as_deref()
                    .and_then(cookie_name)
                    .unwrap_or_else(|| "*".to_string()),
            },
        }
    }
}

/// Name part of a `name=value; attr=...` cookie assignment.
pub fn cookie_name(assignment: &str) -> Option<String> {
    let first = assignment.split(';').next()?;
    let name = first.split('=').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// One in-flight ask from the isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub id: String,
    pub details: CapabilityDetails,
}

impl CapabilityRequest {
    pub fn new(details: CapabilityDetails) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            details,
        }
    }

    pub fn with_id(id: impl Into<String>, details: CapabilityDetails) -> Self {
        Self {
            id: id.into(),
            details,
        }
    }

    pub fn capability(&self) -> Capability {
        self.details.capability()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDecision {
    Allow,
    Deny,
}

/// What the user chose in a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    AllowOnce,
    AllowAlways,
    DenyOnce,
    DenyAlways,
}

impl PermissionDecision {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "allow-once" => Some(PermissionDecision::AllowOnce),
            "allow-always" => Some(PermissionDecision::AllowAlways),
            "deny-once" => Some(PermissionDecision::DenyOnce),
            "deny-always" => Some(PermissionDecision::DenyAlways),
            _ => None,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(
            self,
            PermissionDecision::AllowOnce | PermissionDecision::AllowAlways
        )
    }

    /// The rule an "always" decision persists, if any.
    pub fn persisted(&self) -> Option<RuleDecision> {
        match self {
            PermissionDecision::AllowAlways => Some(RuleDecision::Allow),
            PermissionDecision::DenyAlways => Some(RuleDecision::Deny),
            PermissionDecision::AllowOnce | PermissionDecision::DenyOnce => None,
        }
    }
}

impl fmt::Display for PermissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionDecision::AllowOnce => "allow-once",
            PermissionDecision::AllowAlways => "allow-always",
            PermissionDecision::DenyOnce => "deny-once",
            PermissionDecision::DenyAlways => "deny-always",
        })
    }
}
