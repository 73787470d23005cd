//! Mapping external user inputs into the variable pool.

use std::collections::HashMap;

use nodes::config::{InputVariableType, StartNodeData, StartVariable};
use nodes::variables::{File, FileTransferMethod, FileType};
use nodes::{Segment, Selector};
use serde_json::{Map, Value};
use tracing::debug;

use crate::pool::VariablePool;
use crate::EngineError;

/// Resolves stored file references (`local_file`, `tool_file`) to files.
pub trait FileResolver: Send + Sync {
    fn resolve(&self, method: FileTransferMethod, reference: &str) -> Option<File>;
}

/// In-memory resolver keyed by storage id.
#[derive(Debug, Clone, Default)]
pub struct StaticFileResolver {
    files: HashMap<String, File>,
}

impl StaticFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, id: impl Into<String>, file: File) -> Self {
        self.files.insert(id.into(), file);
        self
    }
}

impl FileResolver for StaticFileResolver {
    fn resolve(&self, method: FileTransferMethod, reference: &str) -> Option<File> {
        self.files
            .get(reference)
            .filter(|f| f.transfer_method == method)
            .cloned()
    }
}

/// One external key → pool selector binding.
#[derive(Debug, Clone)]
pub struct InputMapping {
    /// External key in `node.variable` form.
    pub key: String,
    pub selector: Selector,
    /// Declaration driving optionality and type coercion.
    pub variable: Option<StartVariable>,
}

/// Bindings for every variable a start node declares.
pub fn start_mappings(start_id: &str, data: &StartNodeData) -> Vec<InputMapping> {
    data.variables
        .iter()
        .map(|v| InputMapping {
            key: format!("{start_id}.{}", v.variable),
            selector: Selector::new(start_id, v.variable.clone()),
            variable: Some(v.clone()),
        })
        .collect()
}

pub struct InputMapper<'a> {
    resolver: &'a dyn FileResolver,
}

impl<'a> InputMapper<'a> {
    pub fn new(resolver: &'a dyn FileResolver) -> Self {
        Self { resolver }
    }

    /// Translate `user_inputs` into pool entries.
    ///
    /// Keys are tried as `node.variable`, then the bare `variable`, then any
    /// deeper dotted key whose first two parts name the selector. Selectors
    /// that already hold a value are left alone, so seeded environment
    /// values survive any mapping that targets them.
    ///
    /// # Errors
    /// - [`EngineError::MissingVariable`] if a required entry is absent.
    /// - [`EngineError::InvalidInput`] if a value fails type coercion.
    pub fn map_into(
        &self,
        mappings: &[InputMapping],
        user_inputs: &Map<String, Value>,
        pool: &mut VariablePool,
    ) -> Result<(), EngineError> {
        for mapping in mappings {
            let value = lookup(mapping, user_inputs);

            if pool.contains(&mapping.selector) {
                debug!(selector = %mapping.selector, "Selector already seeded, skipping input");
                continue;
            }

            let Some(value) = value else {
                let optional = mapping.variable.as_ref().is_some_and(|v| !v.required);
                if optional {
                    continue;
                }
                return Err(EngineError::MissingVariable(mapping.key.clone()));
            };

            let segment = match &mapping.variable {
                Some(declared) => self.coerce(declared, value)?,
                None => Segment::from_json(value.clone()),
            };
            if segment.is_none() && mapping.variable.as_ref().is_some_and(|v| !v.required) {
                continue;
            }
            if !pool.add(&mapping.selector, segment) {
                debug!(selector = %mapping.selector, "Input redirected away from environment scope");
            }
        }
        Ok(())
    }

    fn coerce(&self, declared: &StartVariable, value: &Value) -> Result<Segment, EngineError> {
        let invalid = |message: String| EngineError::InvalidInput { variable: declared.variable.clone(), message };

        if value.is_null() {
            return Ok(Segment::None);
        }
        match declared.var_type {
            InputVariableType::TextInput | InputVariableType::Paragraph => match value {
                Value::String(s) => Ok(Segment::String(s.clone())),
                Value::Number(n) => Ok(Segment::String(n.to_string())),
                other => Err(invalid(format!("expected text, got {other}"))),
            },
            InputVariableType::Select => {
                let Value::String(choice) = value else {
                    return Err(invalid("expected one of the options".into()));
                };
                if !declared.options.is_empty() && !declared.options.contains(choice) {
                    return Err(invalid(format!("'{choice}' is not an allowed option")));
                }
                Ok(Segment::String(choice.clone()))
            }
            InputVariableType::Number => match value {
                Value::Number(_) => Ok(Segment::from_json(value.clone())),
                Value::String(s) => {
                    let trimmed = s.trim();
                    if let Ok(i) = trimmed.parse::<i64>() {
                        Ok(Segment::Integer(i))
                    } else {
                        trimmed
                            .parse::<f64>()
                            .map(Segment::Float)
                            .map_err(|_| invalid(format!("'{s}' is not a number")))
                    }
                }
                other => Err(invalid(format!("expected a number, got {other}"))),
            },
            InputVariableType::Checkbox => match value {
                Value::Bool(b) => Ok(Segment::Boolean(*b)),
                other => Err(invalid(format!("expected a boolean, got {other}"))),
            },
            InputVariableType::Json => Ok(Segment::from_json(value.clone())),
            InputVariableType::File => self.build_file(declared, value).map(Segment::File),
            InputVariableType::FileList => {
                let Value::Array(items) = value else {
                    return Err(invalid("expected a list of files".into()));
                };
                items
                    .iter()
                    .map(|item| self.build_file(declared, item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Segment::ArrayFile)
            }
        }
    }

    fn build_file(&self, declared: &StartVariable, value: &Value) -> Result<File, EngineError> {
        let invalid = |message: String| EngineError::InvalidInput { variable: declared.variable.clone(), message };

        let Value::Object(mapping) = value else {
            return Err(invalid("expected a file mapping".into()));
        };
        let method: FileTransferMethod = mapping
            .get("transfer_method")
            .cloned()
            .ok_or_else(|| invalid("file mapping needs a transfer_method".into()))
            .and_then(|m| serde_json::from_value(m).map_err(|e| invalid(e.to_string())))?;

        if !declared.allowed_file_upload_methods.is_empty() && !declared.allowed_file_upload_methods.contains(&method)
        {
            return Err(invalid(format!("transfer method {method} is not allowed")));
        }

        let text = |key: &str| mapping.get(key).and_then(Value::as_str).map(str::to_string);
        let file = match method {
            FileTransferMethod::LocalFile | FileTransferMethod::ToolFile => {
                let reference = text("upload_file_id")
                    .or_else(|| text("tool_file_id"))
                    .or_else(|| text("related_id"))
                    .ok_or_else(|| invalid("file mapping needs a storage reference".into()))?;
                self.resolver
                    .resolve(method, &reference)
                    .ok_or_else(|| invalid(format!("file '{reference}' not found")))?
            }
            FileTransferMethod::RemoteUrl => {
                let url = text("url")
                    .or_else(|| text("remote_url"))
                    .ok_or_else(|| invalid("remote file needs a url".into()))?;
                let filename = url
                    .split(['?', '#'])
                    .next()
                    .and_then(|path| path.rsplit('/').next())
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                let extension = filename
                    .as_deref()
                    .and_then(|name| name.rsplit_once('.'))
                    .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()));
                let file_type = extension.as_deref().map(FileType::from_extension).unwrap_or_default();
                File {
                    transfer_method: method,
                    related_id: None,
                    remote_url: Some(url),
                    filename,
                    extension,
                    mime_type: text("mime_type"),
                    size: mapping.get("size").and_then(Value::as_i64),
                    file_type,
                }
            }
        };

        if !declared.allowed_file_types.is_empty()
            && !declared.allowed_file_types.contains(&file.file_type)
            && !declared.allowed_file_types.contains(&FileType::Custom)
        {
            return Err(invalid(format!("file type {:?} is not allowed", file.file_type)));
        }
        Ok(file)
    }
}

/// Find the raw value for a mapping among the accepted key forms.
fn lookup<'v>(mapping: &InputMapping, user_inputs: &'v Map<String, Value>) -> Option<&'v Value> {
    if let Some(v) = user_inputs.get(&mapping.key) {
        return Some(v);
    }
    if let Some(v) = user_inputs.get(mapping.selector.name()) {
        return Some(v);
    }
    user_inputs.iter().find_map(|(key, value)| {
        let collapsed = Selector::parse(key)?;
        (!collapsed.path().is_empty() && collapsed.key() == mapping.selector).then_some(value)
    })
}
