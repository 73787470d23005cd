//! Test doubles for the collaborators nodes call out to.
//!
//! Each double records every call it receives and returns a
//! programmer-specified result.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::services::{CodeExecutor, ModelClient, ModelRequest, ModelResponse, ToolProvider, Usage};
use crate::NodeError;

/// Behaviour injected into a double at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour<T> {
    Return(T),
    /// Fail with a `Retryable` error for the first `n` calls, then return.
    FailRetryableTimes(usize, T),
    FailRetryable(String),
    FailFatal(String),
}

impl<T: Clone> MockBehaviour<T> {
    fn resolve(&self, call_index: usize) -> Result<T, NodeError> {
        match self {
            Self::Return(v) => Ok(v.clone()),
            Self::FailRetryableTimes(n, _) if call_index < *n => {
                Err(NodeError::Retryable(format!("transient failure #{}", call_index + 1)))
            }
            Self::FailRetryableTimes(_, v) => Ok(v.clone()),
            Self::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            Self::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

/// Model client that streams a fixed reply word by word.
pub struct ScriptedModel {
    pub behaviour: MockBehaviour<String>,
    /// Pause before each streamed chunk.
    pub chunk_delay: Option<Duration>,
    /// All requests seen (in call order).
    pub calls: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedModel {
    fn with(behaviour: MockBehaviour<String>) -> Self {
        Self { behaviour, chunk_delay: None, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Return(text.into()))
    }

    pub fn failing_retryable_times(n: usize, text: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailRetryableTimes(n, text.into()))
    }

    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailFatal(msg.into()))
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(
        &self,
        request: &ModelRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<ModelResponse, NodeError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };
        let text = self.behaviour.resolve(call_index)?;

        let words: Vec<&str> = text.split(' ').collect();
        for (i, word) in words.iter().enumerate() {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            if i == 0 {
                on_chunk(word);
            } else {
                on_chunk(&format!(" {word}"));
            }
        }

        let completion = words.len() as u64;
        Ok(ModelResponse {
            text,
            usage: Usage { prompt_tokens: 10, completion_tokens: completion, total_tokens: 10 + completion },
        })
    }
}

// ---------------------------------------------------------------------------
// MockTool
// ---------------------------------------------------------------------------

pub struct MockTool {
    pub behaviour: MockBehaviour<Value>,
    /// `(tool_name, parameters)` per call.
    pub calls: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
}

impl MockTool {
    pub fn returning(value: Value) -> Self {
        Self { behaviour: MockBehaviour::Return(value), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self { behaviour: MockBehaviour::FailFatal(msg.into()), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn failing_retryable_times(n: usize, value: Value) -> Self {
        Self {
            behaviour: MockBehaviour::FailRetryableTimes(n, value),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolProvider for MockTool {
    async fn invoke(&self, tool_name: &str, parameters: &Map<String, Value>) -> Result<Value, NodeError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((tool_name.to_string(), parameters.clone()));
            calls.len() - 1
        };
        self.behaviour.resolve(call_index)
    }
}

// ---------------------------------------------------------------------------
// MockCodeExecutor
// ---------------------------------------------------------------------------

pub struct MockCodeExecutor {
    pub behaviour: MockBehaviour<Map<String, Value>>,
    pub calls: AtomicUsize,
    /// Arguments of the most recent call.
    pub last_inputs: Mutex<Option<Map<String, Value>>>,
}

impl MockCodeExecutor {
    pub fn returning(outputs: Value) -> Self {
        let outputs = match outputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { behaviour: MockBehaviour::Return(outputs), calls: AtomicUsize::new(0), last_inputs: Mutex::new(None) }
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self {
            behaviour: MockBehaviour::FailFatal(msg.into()),
            calls: AtomicUsize::new(0),
            last_inputs: Mutex::new(None),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeExecutor for MockCodeExecutor {
    async fn execute(
        &self,
        _language: &str,
        _code: &str,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, NodeError> {
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_inputs.lock().unwrap() = Some(inputs.clone());
        self.behaviour.resolve(call_index)
    }
}
