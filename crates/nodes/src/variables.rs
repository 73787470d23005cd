//! Value model shared by the engine and every node implementation.
//!
//! A [`Selector`] addresses a value in the variable pool, a [`Segment`]
//! is the typed value stored there.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scope holding run-level system values (`sys.query`, `sys.user_id`, …).
pub const SYSTEM_VARIABLE_NODE_ID: &str = "sys";
/// Read-only scope seeded from operator-configured environment variables.
pub const ENVIRONMENT_VARIABLE_NODE_ID: &str = "env";
/// Scope persisting across runs of the same conversation.
pub const CONVERSATION_VARIABLE_NODE_ID: &str = "conversation";

/// Whether `scope` is one of the pool's reserved scopes rather than a node's.
pub fn is_reserved_scope(scope: &str) -> bool {
    matches!(scope, SYSTEM_VARIABLE_NODE_ID | ENVIRONMENT_VARIABLE_NODE_ID | CONVERSATION_VARIABLE_NODE_ID)
}

/// Snapshot of the values a node declared as inputs.
pub type NodeInputs = BTreeMap<Selector, Segment>;

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// `(scope, name, path…)` lookup key into the variable pool.
///
/// The first two parts identify a stored variable; any further parts
/// descend into object keys or file attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Selector(Vec<String>);

impl Selector {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self(vec![scope.into(), name.into()])
    }

    /// Build a selector from raw parts; `None` when fewer than two parts.
    pub fn from_parts<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self(parts))
    }

    /// Parse the dotted form `scope.name[.path…]`.
    pub fn parse(dotted: &str) -> Option<Self> {
        Self::from_parts(dotted.split('.'))
    }

    pub fn scope(&self) -> &str {
        &self.0[0]
    }

    pub fn name(&self) -> &str {
        &self.0[1]
    }

    /// Attribute path below the stored variable.
    pub fn path(&self) -> &[String] {
        &self.0[2..]
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// The two-element selector of the stored variable.
    pub fn key(&self) -> Selector {
        Self(self.0[..2].to_vec())
    }

    /// Same selector with the scope replaced.
    pub fn with_scope(&self, scope: impl Into<String>) -> Selector {
        let mut parts = self.0.clone();
        parts[0] = scope.into();
        Self(parts)
    }

    pub fn is_environment(&self) -> bool {
        self.scope() == ENVIRONMENT_VARIABLE_NODE_ID
    }

    pub fn is_system(&self) -> bool {
        self.scope() == SYSTEM_VARIABLE_NODE_ID
    }
}

impl TryFrom<Vec<String>> for Selector {
    type Error = String;

    fn try_from(parts: Vec<String>) -> Result<Self, Self::Error> {
        let joined = parts.join(".");
        Self::from_parts(parts).ok_or_else(|| format!("invalid selector '{joined}': need at least two non-empty parts"))
    }
}

impl From<Selector> for Vec<String> {
    fn from(selector: Selector) -> Self {
        selector.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// How a file reached the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferMethod {
    LocalFile,
    RemoteUrl,
    ToolFile,
}

impl fmt::Display for FileTransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalFile => write!(f, "local_file"),
            Self::RemoteUrl => write!(f, "remote_url"),
            Self::ToolFile => write!(f, "tool_file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Document,
    Audio,
    Video,
    #[default]
    Custom,
}

impl FileType {
    pub fn from_extension(extension: &str) -> Self {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" => Self::Image,
            "txt" | "md" | "markdown" | "pdf" | "html" | "htm" | "csv" | "xlsx" | "xls" | "docx" | "doc"
            | "pptx" | "ppt" | "xml" | "json" | "epub" => Self::Document,
            "mp3" | "m4a" | "wav" | "webm" | "amr" | "mpga" => Self::Audio,
            "mp4" | "mov" | "mpeg" => Self::Video,
            _ => Self::Custom,
        }
    }
}

/// A file reference carried through the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub transfer_method: FileTransferMethod,
    /// Storage id of an uploaded or tool-generated file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default)]
    pub file_type: FileType,
}

impl File {
    /// Attribute lookup used by selectors such as `start.doc.extension`.
    pub fn attribute(&self, name: &str) -> Option<Segment> {
        let text = |v: &Option<String>| v.clone().map(Segment::String);
        match name {
            "name" | "filename" => text(&self.filename),
            "extension" => text(&self.extension),
            "mime_type" => text(&self.mime_type),
            "url" | "remote_url" => text(&self.remote_url),
            "related_id" => text(&self.related_id),
            "size" => self.size.map(Segment::Integer),
            "type" => serde_json::to_value(self.file_type).ok().map(Segment::from_json),
            "transfer_method" => Some(Segment::String(self.transfer_method.to_string())),
            _ => None,
        }
    }

    fn display_text(&self) -> String {
        match (&self.remote_url, &self.filename) {
            (Some(url), _) => url.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => self.related_id.clone().unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// Declared type of a variable, used to validate inputs and code outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "array[string]")]
    ArrayString,
    #[serde(rename = "array[number]")]
    ArrayNumber,
    #[serde(rename = "array[object]")]
    ArrayObject,
    #[serde(rename = "array[any]")]
    ArrayAny,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "array[file]")]
    ArrayFile,
    #[serde(rename = "none")]
    None,
}

impl SegmentType {
    /// Whether `value` is acceptable for a variable of this type.
    /// `None` is accepted everywhere (an unset value).
    pub fn accepts(&self, value: &Segment) -> bool {
        let is_number = |s: &Segment| matches!(s, Segment::Integer(_) | Segment::Float(_));
        match (self, value) {
            (_, Segment::None) => true,
            (Self::String, Segment::String(_)) => true,
            (Self::Number, v) => is_number(v),
            (Self::Integer, Segment::Integer(_)) => true,
            (Self::Float, v) => is_number(v),
            (Self::Boolean, Segment::Boolean(_)) => true,
            (Self::Object, Segment::Object(_)) => true,
            (Self::ArrayString, Segment::Array(items)) => items.iter().all(|i| matches!(i, Segment::String(_))),
            (Self::ArrayNumber, Segment::Array(items)) => items.iter().all(is_number),
            (Self::ArrayObject, Segment::Array(items)) => items.iter().all(|i| matches!(i, Segment::Object(_))),
            (Self::ArrayAny, Segment::Array(_)) => true,
            (Self::File, Segment::File(_)) => true,
            (Self::ArrayFile, Segment::ArrayFile(_)) => true,
            (Self::ArrayFile, Segment::Array(items)) => items.is_empty(),
            _ => false,
        }
    }
}

/// A typed value stored in the variable pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "value_type", content = "value", rename_all = "kebab-case")]
pub enum Segment {
    #[default]
    None,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Object(Map<String, Value>),
    Array(Vec<Segment>),
    File(File),
    ArrayFile(Vec<File>),
}

impl Segment {
    /// Convert a plain JSON value. Files are never inferred from JSON; they
    /// only enter the pool through typed input coercion or node outputs.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Object(map),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Object(map) => Value::Object(map.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Segment::to_json).collect()),
            Self::File(file) => serde_json::to_value(file).unwrap_or(Value::Null),
            Self::ArrayFile(files) => serde_json::to_value(files).unwrap_or(Value::Null),
        }
    }

    /// Text rendering used when a value is substituted into a template.
    pub fn text(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Object(_) | Self::Array(_) => self.to_json().to_string(),
            Self::File(file) => file.display_text(),
            Self::ArrayFile(files) => files.iter().map(File::display_text).collect::<Vec<_>>().join("\n"),
        }
    }

    pub fn segment_type(&self) -> SegmentType {
        match self {
            Self::None => SegmentType::None,
            Self::String(_) => SegmentType::String,
            Self::Integer(_) => SegmentType::Integer,
            Self::Float(_) => SegmentType::Float,
            Self::Boolean(_) => SegmentType::Boolean,
            Self::Object(_) => SegmentType::Object,
            Self::Array(_) => SegmentType::ArrayAny,
            Self::File(_) => SegmentType::File,
            Self::ArrayFile(_) => SegmentType::ArrayFile,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// `true` for none, empty strings and empty collections.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::String(s) => s.is_empty(),
            Self::Object(map) => map.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::ArrayFile(files) => files.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Descend into an attribute path (object keys, array indexes, file attributes).
    pub fn get_path(&self, path: &[String]) -> Option<Segment> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        let next = match self {
            Self::Object(map) => map.get(head).cloned().map(Segment::from_json),
            Self::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            Self::File(file) => file.attribute(head),
            Self::ArrayFile(files) => head.parse::<usize>().ok().and_then(|i| files.get(i).cloned()).map(Segment::File),
            _ => None,
        }?;
        next.get_path(rest)
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Segment {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Segment {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Segment {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_requires_two_parts() {
        assert!(Selector::parse("start").is_none());
        assert!(Selector::parse("start.").is_none());
        let sel = Selector::parse("start.doc.extension").expect("valid");
        assert_eq!(sel.scope(), "start");
        assert_eq!(sel.name(), "doc");
        assert_eq!(sel.path(), ["extension".to_string()]);
        assert_eq!(sel.key(), Selector::new("start", "doc"));
    }

    #[test]
    fn selector_deserializes_from_array() {
        let sel: Selector = serde_json::from_value(json!(["llm", "text"])).unwrap();
        assert_eq!(sel.to_string(), "llm.text");
        assert!(serde_json::from_value::<Selector>(json!(["only"])).is_err());
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        assert_eq!(Segment::from_json(json!(5)), Segment::Integer(5));
        assert_eq!(Segment::from_json(json!(2.5)), Segment::Float(2.5));
        assert_eq!(Segment::from_json(json!(null)), Segment::None);
    }

    #[test]
    fn path_lookup_descends_objects_and_files() {
        let obj = Segment::from_json(json!({"a": {"b": [10, 20]}}));
        let path = vec!["a".to_string(), "b".to_string(), "1".to_string()];
        assert_eq!(obj.get_path(&path), Some(Segment::Integer(20)));

        let file = Segment::File(File {
            transfer_method: FileTransferMethod::RemoteUrl,
            related_id: None,
            remote_url: Some("https://example.com/a.png".into()),
            filename: Some("a.png".into()),
            extension: Some(".png".into()),
            mime_type: None,
            size: None,
            file_type: FileType::Image,
        });
        assert_eq!(file.get_path(&["extension".to_string()]), Some(Segment::from(".png")));
        assert_eq!(file.get_path(&["type".to_string()]), Some(Segment::from("image")));
    }

    #[test]
    fn segment_serde_is_tagged() {
        let value = serde_json::to_value(Segment::Integer(3)).unwrap();
        assert_eq!(value, json!({"value_type": "integer", "value": 3}));
        let back: Segment = serde_json::from_value(value).unwrap();
        assert_eq!(back, Segment::Integer(3));
    }

    #[test]
    fn declared_types_accept_matching_values() {
        assert!(SegmentType::Number.accepts(&Segment::Integer(1)));
        assert!(SegmentType::ArrayString.accepts(&Segment::from_json(json!(["a", "b"]))));
        assert!(!SegmentType::ArrayString.accepts(&Segment::from_json(json!(["a", 1]))));
        assert!(!SegmentType::Boolean.accepts(&Segment::from("true")));
    }
}
