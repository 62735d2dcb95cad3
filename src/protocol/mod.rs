pub mod request;
pub mod response;

pub use request::{
    is_initialize_request, ClientInfo, InitializeParams, JsonRpcRequest, LogLevel, RpcId,
    SetLevelParams, ToolCallParams,
};
pub use response::{
    JsonRpcError, JsonRpcNotification, JsonRpcResponse, ToolResult, ToolResultContent,
};
