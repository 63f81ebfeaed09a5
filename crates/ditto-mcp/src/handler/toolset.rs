use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;

use super::ToolContext;
use crate::{
    auth::CredentialError,
    model::{Content, JsonObject, Tool},
};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Execution failed: {0}")]
    ExecutionError(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

pub type ToolHandlerFn = Box<
    dyn Fn(JsonObject, ToolContext) -> BoxFuture<'static, Result<Vec<Content>, ToolError>>
        + Send
        + Sync,
>;

pub struct Toolset {
    tool_list: BTreeMap<String, Tool>,
    tool_handlers: HashMap<String, ToolHandlerFn>,
}

#[derive(Default)]
pub struct ToolsetBuilder {
    tool_list: BTreeMap<String, Tool>,
    tool_handlers: HashMap<String, ToolHandlerFn>,
}

impl ToolsetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`; a later registration under the same name replaces it.
    pub fn add_tool<F, Fut>(mut self, tool: Tool, handler: F) -> Self
    where
        F: Fn(JsonObject, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Content>, ToolError>> + Send + 'static,
    {
        let name = tool.name.to_string();
        self.tool_list.insert(name.clone(), tool);
        self.tool_handlers.insert(
            name,
            Box::new(move |arguments, context| Box::pin(handler(arguments, context))),
        );
        self
    }

    pub fn build(self) -> Toolset {
        Toolset {
            tool_list: self.tool_list,
            tool_handlers: self.tool_handlers,
        }
    }
}

impl Toolset {
    pub fn builder() -> ToolsetBuilder {
        ToolsetBuilder::new()
    }

    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tool_list.get(name)
    }

    /// Tools ordered by name.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tool_list.values().cloned().collect()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: JsonObject,
        context: ToolContext,
    ) -> Result<Vec<Content>, ToolError> {
        let handler = self
            .tool_handlers
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler(arguments, context).await
    }

    pub fn len(&self) -> usize {
        self.tool_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tool_list.is_empty()
    }
}
