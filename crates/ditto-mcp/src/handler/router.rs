use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{info, warn};

use super::{ToolContext, ToolDispatcher, ToolError, Toolset};
use crate::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData, Implementation,
    InitializeRequestParam, InitializeResult, JsonRpcRequest, LATEST_PROTOCOL_VERSION,
    ListToolsResult, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, ToolsCapability,
};

/// [`ToolDispatcher`] answering the MCP method set from a [`Toolset`].
pub struct ToolRouter {
    toolset: Arc<Toolset>,
    server_info: Implementation,
    instructions: Option<String>,
}

impl ToolRouter {
    pub fn new(server_info: Implementation, toolset: Toolset) -> Self {
        Self {
            toolset: Arc::new(toolset),
            server_info,
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn toolset(&self) -> &Toolset {
        &self.toolset
    }

    fn initialize(&self, param: InitializeRequestParam) -> InitializeResult {
        let protocol_version = param
            .protocol_version
            .filter(|requested| SUPPORTED_PROTOCOL_VERSIONS.contains(&requested.as_str()))
            .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string());
        InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        }
    }

    async fn call_tool(
        &self,
        param: CallToolRequestParam,
        context: ToolContext,
    ) -> Result<CallToolResult, ErrorData> {
        if self.toolset.get_tool(&param.name).is_none() {
            return Err(ErrorData::invalid_params(format!(
                "unknown tool: {}",
                param.name
            )));
        }
        let session_id = context.session_id.clone();
        match self
            .toolset
            .call_tool(&param.name, param.arguments.unwrap_or_default(), context)
            .await
        {
            Ok(content) => Ok(CallToolResult::success(content)),
            Err(ToolError::InvalidParameters(message)) => Err(ErrorData::invalid_params(message)),
            Err(e) => {
                warn!(%session_id, tool = %param.name, error = %e, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

#[async_trait]
impl ToolDispatcher for ToolRouter {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: ToolContext,
    ) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            "initialize" => {
                let param = optional_params::<InitializeRequestParam>(request.params)?;
                let result = self.initialize(param);
                info!(
                    session_id = %context.session_id,
                    protocol_version = %result.protocol_version,
                    "session initialized"
                );
                to_result(&result)
            }
            "ping" => Ok(Value::Object(Default::default())),
            "tools/list" => to_result(&ListToolsResult {
                tools: self.toolset.list_tools(),
            }),
            "tools/call" => {
                let param = required_params::<CallToolRequestParam>(request.params)?;
                to_result(&self.call_tool(param, context).await?)
            }
            method => Err(ErrorData::method_not_found(method)),
        }
    }
}

fn required_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorData> {
    let params = params.ok_or_else(|| ErrorData::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(|e| ErrorData::invalid_params(e.to_string()))
}

fn optional_params<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, ErrorData> {
    match params {
        None => Ok(T::default()),
        Some(params) => {
            serde_json::from_value(params).map_err(|e| ErrorData::invalid_params(e.to_string()))
        }
    }
}

fn to_result<T: Serialize>(result: &T) -> Result<Value, ErrorData> {
    serde_json::to_value(result).map_err(|e| ErrorData::internal_error(e.to_string()))
}
