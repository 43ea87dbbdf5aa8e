use serde::{Deserialize, Serialize};

/// Top-level configuration document as delivered over the side channel.
///
/// Fields other than the two rule lists are ignored so that newer
/// producers can add to the document without breaking older proxies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "dbus-gateway-config-session", default)]
    pub session: Option<Vec<RuleRecord>>,
    #[serde(rename = "dbus-gateway-config-system", default)]
    pub system: Option<Vec<RuleRecord>>,
}

/// A single rule as written in the configuration. Absent (or `null`)
/// fields mean `*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(rename = "object-path", default)]
    pub object_path: Option<String>,
    #[serde(default)]
    pub method: Option<MethodField>,
}

/// The `method` field accepts a single name or a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodField {
    One(String),
    Many(Vec<String>),
}
