use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::config::ExternalToolConfig;
use super::executor::{ToolCallRequest, ToolCallResult};
use super::tool::{DynamicTool, Tool};
use crate::error::{RelayError, Result};

/// Function definition announced to the upstream service in `session.update`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: Vec<ExternalToolConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            let tool_name = config.name.clone();
            registry.register(Arc::new(DynamicTool::new(config)));
            log::info!("Registered tool: {}", tool_name);
        }
        registry
    }

    /// Read a JSON array of [`ExternalToolConfig`] from disk.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let configs: Vec<ExternalToolConfig> = serde_json::from_str(&text)?;
        Ok(Self::from_configs(configs))
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name))
            .map(|t| ToolDefinition {
                kind: "function",
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect()
    }

    /// Run one request. Every failure is folded into the result.
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolCallResult {
        match self.try_invoke(request).await {
            Ok(output) => ToolCallResult::output(&request.call_id, output),
            Err(message) => {
                log::warn!("Tool call {} ({}) failed: {}", request.call_id, request.name, message);
                ToolCallResult::failed(&request.call_id, message)
            }
        }
    }

    async fn try_invoke(&self, request: &ToolCallRequest) -> std::result::Result<String, String> {
        let tool = self.tools.get(&request.name).ok_or_else(|| {
            RelayError::UnknownTool {
                name: request.name.clone(),
                available: self.names(),
            }
            .to_string()
        })?;

        let params: Value = serde_json::from_str(&request.arguments).map_err(|e| {
            RelayError::InvalidArguments {
                arguments: request.arguments.clone(),
                reason: e.to_string(),
            }
            .to_string()
        })?;

        let value = tool.call(params).await?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
