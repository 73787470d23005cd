//! External collaborators nodes call out to: model, tools, code sandbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Usage,
}

/// A chat-completion backend. Implementations call `on_chunk` for each
/// streamed delta before returning the full response.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(
        &self,
        request: &ModelRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<ModelResponse, NodeError>;
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn invoke(&self, tool_name: &str, parameters: &Map<String, Value>) -> Result<Value, NodeError>;
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        language: &str,
        code: &str,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, NodeError>;
}

/// Collaborators available to nodes for one run.
#[derive(Clone)]
pub struct NodeServices {
    pub model: Arc<dyn ModelClient>,
    /// Tool providers keyed by provider id.
    pub tools: HashMap<String, Arc<dyn ToolProvider>>,
    pub code: Option<Arc<dyn CodeExecutor>>,
}

impl NodeServices {
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = model;
        self
    }

    pub fn with_tool(mut self, provider_id: impl Into<String>, tool: Arc<dyn ToolProvider>) -> Self {
        self.tools.insert(provider_id.into(), tool);
        self
    }

    pub fn with_code_executor(mut self, code: Arc<dyn CodeExecutor>) -> Self {
        self.code = Some(code);
        self
    }
}

impl Default for NodeServices {
    fn default() -> Self {
        Self { model: Arc::new(EchoModel), tools: HashMap::new(), code: None }
    }
}

impl fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeServices")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("code", &self.code.is_some())
            .finish_non_exhaustive()
    }
}

/// Offline model that answers with the last user message, streamed word by word.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn invoke(
        &self,
        request: &ModelRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<ModelResponse, NodeError> {
        let prompt_tokens: usize = request.messages.iter().map(|m| m.text.split_whitespace().count()).sum();
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.text.clone())
            .unwrap_or_default();

        let words: Vec<&str> = text.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            if i == 0 {
                on_chunk(word);
            } else {
                on_chunk(&format!(" {word}"));
            }
        }

        let usage = Usage {
            prompt_tokens: prompt_tokens as u64,
            completion_tokens: words.len() as u64,
            total_tokens: (prompt_tokens + words.len()) as u64,
        };
        Ok(ModelResponse { text: words.join(" "), usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn echo_model_streams_words_of_last_user_message() {
        let request = ModelRequest {
            provider: "echo".into(),
            model: "echo".into(),
            messages: vec![
                PromptMessage { role: PromptRole::System, text: "be brief".into() },
                PromptMessage { role: PromptRole::User, text: "hello   there world".into() },
            ],
            parameters: Map::new(),
        };
        let chunks = Mutex::new(Vec::new());
        let response = EchoModel
            .invoke(&request, &|c: &str| chunks.lock().unwrap().push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(response.text, "hello there world");
        assert_eq!(chunks.into_inner().unwrap(), vec!["hello", " there", " world"]);
        assert_eq!(response.usage.total_tokens, 2 + 3 + 3);
    }
}
