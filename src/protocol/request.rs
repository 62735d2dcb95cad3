use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

/// JSON-RPC 2.0 ID: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(Number),
    Str(String),
}

impl RpcId {
    /// A fresh string id for server-originated error bodies.
    pub fn fresh() -> Self {
        Self::Str(uuid::Uuid::new_v4().to_string())
    }
}

/// JSON-RPC 2.0 request envelope. A missing `id` marks a notification; an
/// explicit `null` id is rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "present_id")]
    pub id: Option<RpcId>,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

// Only runs when the field is present, so `null` fails instead of reading as absent.
fn present_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RpcId>, D::Error> {
    RpcId::deserialize(deserializer).map(Some)
}

/// MCP `initialize` params.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// Client information sent during `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: Option<String>,
    pub arguments: Option<Value>,
}

/// Parameters for `logging/setLevel`.
#[derive(Debug, Clone, Deserialize)]
pub struct SetLevelParams {
    pub level: LogLevel,
}

/// Syslog-style severity used by MCP logging notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Returns true when `body` is a well-formed MCP `initialize` request.
///
/// Batches never count as initiation messages.
pub fn is_initialize_request(body: &Value) -> bool {
    let Ok(req) = serde_json::from_value::<JsonRpcRequest>(body.clone()) else {
        return false;
    };
    if req.jsonrpc != "2.0" || req.method != "initialize" || req.id.is_none() {
        return false;
    }
    req.params
        .map(|p| serde_json::from_value::<InitializeParams>(p).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }
        })
    }

    #[test]
    fn recognizes_initialize_request() {
        assert!(is_initialize_request(&init_body()));
    }

    #[test]
    fn rejects_initialize_without_client_info() {
        let mut body = init_body();
        body["params"].as_object_mut().unwrap().remove("clientInfo");
        assert!(!is_initialize_request(&body));
    }

    #[test]
    fn rejects_initialize_notification() {
        let mut body = init_body();
        body.as_object_mut().unwrap().remove("id");
        assert!(!is_initialize_request(&body));
    }

    #[test]
    fn rejects_other_methods_and_batches() {
        let list = json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" });
        assert!(!is_initialize_request(&list));
        assert!(!is_initialize_request(&json!([init_body()])));
    }

    #[test]
    fn null_id_is_not_a_notification() {
        let absent = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        let req: JsonRpcRequest = serde_json::from_value(absent).unwrap();
        assert!(req.is_notification());

        let null = json!({ "jsonrpc": "2.0", "id": null, "method": "tools/list" });
        assert!(serde_json::from_value::<JsonRpcRequest>(null).is_err());

        let mut body = init_body();
        body["id"] = Value::Null;
        assert!(!is_initialize_request(&body));
    }

    #[test]
    fn numeric_ids_keep_full_range() {
        let body = json!({ "jsonrpc": "2.0", "id": u64::MAX, "method": "ping" });
        let req: JsonRpcRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.id, Some(RpcId::Number(u64::MAX.into())));
        assert_eq!(serde_json::to_value(&req.id).unwrap(), json!(u64::MAX));
    }

    #[test]
    fn log_levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Error);
        let level: LogLevel = serde_json::from_value(json!("warning")).unwrap();
        assert_eq!(level, LogLevel::Warning);
    }
}
