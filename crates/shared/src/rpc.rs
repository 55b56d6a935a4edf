use std::collections::HashMap;

use serde_json::Value;

/// Command envelope sent from the gateway to a plugin runtime.
///
/// Additional command arguments are flattened next to `cid` and `action`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PluginCommand {
    pub cid: u32,
    pub action: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl PluginCommand {
    pub fn new(cid: u32, action: &str) -> Self {
        Self {
            cid,
            action: action.to_string(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }
}

/// Response envelope sent from a plugin runtime to the gateway.
///
/// `cid` 0 is reserved for asynchronous messages originating from the
/// runtime itself (for example `action = "logs"`).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PluginResponse {
    pub cid: u32,
    pub action: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl PluginResponse {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Payload of the `start` handshake response.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StartResponse {
    pub name: String,
    pub version: String,
    pub interfaces: Vec<Interface>,
    pub receivers: Vec<String>,
    pub exposes: Vec<ExposedCall>,
    pub metric_collectors: Vec<MetricCollector>,
    pub metric_receivers: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Interface {
    pub name: String,
    pub version: String,
}

/// A call the plugin exposes for proxying through the `request` action.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ExposedCall {
    pub name: String,
    pub auth: bool,
    pub content_type: String,
    /// Declared parameter types, used to validate arguments up front.
    #[serde(default)]
    pub check: Option<HashMap<String, ParamType>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
    Json,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Str => value.is_string(),
            ParamType::Json => true,
        }
    }
}

/// A named metric collector the plugin wants to be polled for.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct MetricCollector {
    pub name: String,
    /// Desired polling interval in seconds.
    pub interval: u64,
}

/// A single metric sample flowing through the pipeline.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Metric {
    pub source: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    #[serde(flatten)]
    pub tags: serde_json::Map<String, Value>,
}

/// Declarative description of a metric, validated on registration.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct MetricDefinition {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub name: String,
    pub description: String,
    pub mtype: MetricKind,
    pub unit: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_fields_are_flattened() {
        let command = PluginCommand::new(7, "input_status").with_field("status", json!([4, 2]));
        let encoded = serde_json::to_value(&command).unwrap();
        assert_eq!(encoded["cid"], json!(7));
        assert_eq!(encoded["action"], json!("input_status"));
        assert_eq!(encoded["status"], json!([4, 2]));
    }

    #[test]
    fn start_response_decodes() {
        let raw = json!({
            "name": "energy-dash",
            "version": "1.0.2",
            "interfaces": [{"name": "webui", "version": "1.0"}],
            "receivers": ["output_status"],
            "exposes": [{"name": "get_dashboard", "auth": true, "content_type": "application/json",
                         "check": {"floor": "int"}}],
            "metric_collectors": [{"name": "consumption", "interval": 30}],
            "metric_receivers": ["energy"],
        });
        let start: StartResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(start.name, "energy-dash");
        assert_eq!(start.exposes[0].check.as_ref().unwrap()["floor"], ParamType::Int);
    }

    #[test]
    fn param_types_validate_values() {
        assert!(ParamType::Int.matches(&json!(3)));
        assert!(!ParamType::Int.matches(&json!(3.5)));
        assert!(ParamType::Float.matches(&json!(3)));
        assert!(ParamType::Str.matches(&json!("x")));
        assert!(ParamType::Json.matches(&json!({"nested": []})));
    }
}
