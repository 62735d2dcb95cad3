//! Protocol engine: answers MCP requests for every connected session.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::protocol::{
    InitializeParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    LogLevel, SetLevelParams, ToolCallParams, ToolResult,
};
use crate::registry::{ToolError, ToolRegistry};

pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION_LATEST, "2025-03-26", "2024-11-05"];

/// Buffered server-to-client messages per session before slow readers lag.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol engine is closed")]
    Closed,
}

pub struct ProtocolEngine {
    info: ServerInfo,
    registry: Arc<ToolRegistry>,
    closed: AtomicBool,
    connections: AtomicUsize,
}

impl ProtocolEngine {
    pub fn new(info: ServerInfo, registry: Arc<ToolRegistry>) -> Self {
        Self {
            info,
            registry,
            closed: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Bind a new session to the engine.
    pub fn connect(self: &Arc<Self>) -> Result<Connection, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.connections.fetch_add(1, Ordering::SeqCst);

        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Ok(Connection {
            engine: Arc::clone(self),
            log_level: Mutex::new(LogLevel::Info),
            outbound: Mutex::new(Some(outbound)),
        })
    }

    /// Number of connections that have not been closed yet.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(
                open_connections = self.connection_count(),
                "protocol engine closed"
            );
        }
    }

    fn negotiate_protocol(requested: &str) -> &str {
        SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|v| **v == requested)
            .copied()
            .unwrap_or(PROTOCOL_VERSION_LATEST)
    }
}

/// One session's binding to the engine: per-session log level and the
/// outbound channel feeding the session's GET stream.
pub struct Connection {
    engine: Arc<ProtocolEngine>,
    log_level: Mutex<LogLevel>,
    outbound: Mutex<Option<broadcast::Sender<String>>>,
}

impl Connection {
    /// Dispatch a JSON-RPC message.
    ///
    /// Returns `None` for notifications (no response required).
    pub async fn handle(&self, req: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        if req.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                req.id.clone(),
                JsonRpcError::invalid_request(),
            ));
        }

        if req.is_notification() {
            tracing::debug!(method = %req.method, "notification received");
            return None;
        }

        let response = match req.method.as_str() {
            "initialize" => self.initialize(req),
            "ping" => JsonRpcResponse::success(req.id.clone(), json!({})),
            "tools/list" => self.list_tools(req),
            "tools/call" => self.call_tool(req).await,
            "logging/setLevel" => self.set_level(req),
            _ => JsonRpcResponse::error(
                req.id.clone(),
                JsonRpcError::method_not_found(&req.method),
            ),
        };
        Some(response)
    }

    fn initialize(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let params: InitializeParams = match parse_params(req) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(req.id.clone(), e),
        };

        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %params.protocol_version,
            "initialize"
        );

        let info = self.engine.info();
        JsonRpcResponse::success(
            req.id.clone(),
            json!({
                "protocolVersion": ProtocolEngine::negotiate_protocol(&params.protocol_version),
                "capabilities": {
                    "tools": {},
                    "logging": {}
                },
                "serverInfo": {
                    "name": info.name,
                    "version": info.version
                }
            }),
        )
    }

    fn list_tools(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let tools = self.engine.registry.list();
        tracing::info!(
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "tools/list"
        );
        JsonRpcResponse::success(req.id.clone(), json!({ "tools": tools }))
    }

    async fn call_tool(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let params: ToolCallParams = match parse_params(req) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(req.id.clone(), e),
        };

        let Some(name) = params.name.filter(|n| !n.is_empty()) else {
            return JsonRpcResponse::error(
                req.id.clone(),
                JsonRpcError::invalid_params("tool name is required"),
            );
        };
        let Some(arguments) = params.arguments else {
            return JsonRpcResponse::error(
                req.id.clone(),
                JsonRpcError::invalid_params(format!("tool call \"{name}\" args is required")),
            );
        };

        let result = match self.engine.registry.call(&name, arguments).await {
            Ok(result) => {
                tracing::info!(tool = %name, "tool call succeeded");
                self.log(LogLevel::Info, json!({ "tool": name, "status": "ok" }));
                result
            }
            Err(ToolError::NotFound(_)) => {
                tracing::warn!(tool = %name, "tool not found");
                return JsonRpcResponse::error(
                    req.id.clone(),
                    JsonRpcError::invalid_params(format!("tool \"{name}\" not found")),
                );
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool call failed");
                self.log(
                    LogLevel::Error,
                    json!({ "tool": name, "status": "error", "message": e.to_string() }),
                );
                ToolResult::error(e.to_string())
            }
        };

        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(req.id.clone(), value),
            Err(e) => JsonRpcResponse::error(
                req.id.clone(),
                JsonRpcError::internal_error(format!("Failed to serialize tool result: {e}")),
            ),
        }
    }

    fn set_level(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let params: SetLevelParams = match parse_params(req) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(req.id.clone(), e),
        };
        *self.log_level.lock().unwrap_or_else(PoisonError::into_inner) = params.level;
        JsonRpcResponse::success(req.id.clone(), json!({}))
    }

    pub fn log_level(&self) -> LogLevel {
        *self.log_level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit a `notifications/message` record if `level` passes the
    /// session's threshold.
    fn log(&self, level: LogLevel, data: Value) {
        if level >= self.log_level() {
            self.notify(&JsonRpcNotification::log_message(level, "tools", data));
        }
    }

    /// Queue a server-to-client message on the session's stream. Dropped
    /// silently when nobody is listening.
    pub fn notify(&self, notification: &JsonRpcNotification) {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match serde_json::to_string(notification) {
            Ok(msg) => {
                let _ = tx.send(msg);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize notification"),
        }
    }

    /// Receiver for server-to-client messages, or `None` once closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Detach from the engine and end every open stream. Idempotent.
    pub fn close(&self) {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            self.engine.connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(req: &JsonRpcRequest) -> Result<T, JsonRpcError> {
    let Some(params) = &req.params else {
        return Err(JsonRpcError::invalid_params(format!(
            "Missing params for {}",
            req.method
        )));
    };
    serde_json::from_value(params.clone())
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid {} params: {e}", req.method)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcId;
    use crate::tools;

    fn engine() -> Arc<ProtocolEngine> {
        let registry = Arc::new(ToolRegistry::default());
        tools::register_builtin(&registry).unwrap();
        Arc::new(ProtocolEngine::new(
            ServerInfo {
                name: "test-server".into(),
                version: "1.2.3".into(),
            },
            registry,
        ))
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(RpcId::Number(id.into())),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol_version() {
        let conn = engine().connect().unwrap();
        let params = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "c", "version": "1" }
        });
        let resp = conn.handle(&request(1, "initialize", Some(params))).await.unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["serverInfo"]["version"], "1.2.3");

        let params = json!({
            "protocolVersion": "1999-01-01",
            "capabilities": {},
            "clientInfo": { "name": "c", "version": "1" }
        });
        let resp = conn.handle(&request(2, "initialize", Some(params))).await.unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], PROTOCOL_VERSION_LATEST);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let conn = engine().connect().unwrap();
        let note = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: None,
            method: "notifications/initialized".into(),
            params: None,
        };
        assert!(conn.handle(&note).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let conn = engine().connect().unwrap();
        let resp = conn.handle(&request(1, "resources/list", None)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_call_requires_name_and_arguments() {
        let conn = engine().connect().unwrap();

        let resp = conn
            .handle(&request(1, "tools/call", Some(json!({ "arguments": {} }))))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().message, "tool name is required");

        let resp = conn
            .handle(&request(2, "tools/call", Some(json!({ "name": "calculator" }))))
            .await
            .unwrap();
        assert_eq!(
            resp.error.unwrap().message,
            "tool call \"calculator\" args is required"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_protocol_error() {
        let conn = engine().connect().unwrap();
        let resp = conn
            .handle(&request(
                1,
                "tools/call",
                Some(json!({ "name": "nope", "arguments": {} })),
            ))
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, JsonRpcError::INVALID_PARAMS);
        assert_eq!(err.message, "tool \"nope\" not found");
    }

    #[tokio::test]
    async fn tool_failures_are_tool_level_errors() {
        let conn = engine().connect().unwrap();
        let resp = conn
            .handle(&request(
                1,
                "tools/call",
                Some(json!({
                    "name": "calculator",
                    "arguments": { "operation": "divide", "a": 10, "b": 0 }
                })),
            ))
            .await
            .unwrap();
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Division by zero is not allowed");
    }

    #[tokio::test]
    async fn tool_outcomes_are_logged_to_subscribers() {
        let conn = engine().connect().unwrap();
        let mut rx = conn.subscribe().unwrap();

        conn.handle(&request(
            1,
            "tools/call",
            Some(json!({
                "name": "calculator",
                "arguments": { "operation": "add", "a": 1, "b": 1 }
            })),
        ))
        .await
        .unwrap();

        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["method"], "notifications/message");
        assert_eq!(msg["params"]["level"], "info");
        assert_eq!(msg["params"]["data"]["tool"], "calculator");
    }

    #[tokio::test]
    async fn set_level_filters_log_notifications() {
        let conn = engine().connect().unwrap();
        let mut rx = conn.subscribe().unwrap();

        let resp = conn
            .handle(&request(1, "logging/setLevel", Some(json!({ "level": "error" }))))
            .await
            .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(conn.log_level(), LogLevel::Error);

        conn.handle(&request(
            2,
            "tools/call",
            Some(json!({
                "name": "calculator",
                "arguments": { "operation": "add", "a": 1, "b": 1 }
            })),
        ))
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_connection_ends_streams_and_engine_refuses_new_ones() {
        let engine = engine();
        let conn = engine.connect().unwrap();
        let mut rx = conn.subscribe().unwrap();
        assert_eq!(engine.connection_count(), 1);

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.subscribe().is_none());
        assert!(rx.recv().await.is_err());
        assert_eq!(engine.connection_count(), 0);

        engine.close();
        assert!(matches!(engine.connect(), Err(EngineError::Closed)));
    }
}
