//! Placeholder templates.
//!
//! Two syntaxes are supported: `{{#scope.name#}}` selector placeholders
//! (answer and llm nodes) and `{{ name }}` local placeholders bound through
//! a node's `variables` list (template-transform nodes).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::variables::{NodeInputs, Selector};

fn selector_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{#([a-zA-Z0-9_\-]{1,64}(?:\.[a-zA-Z_][a-zA-Z0-9_]{0,63}){1,10})#\}\}")
            .unwrap_or_else(|e| unreachable!("selector pattern is valid: {e}"))
    })
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}")
            .unwrap_or_else(|e| unreachable!("name pattern is valid: {e}"))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Variable(Selector),
}

/// A parsed `{{#selector#}}` template.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut cursor = 0;
        for captures in selector_pattern().captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let Some(selector) = Selector::parse(inner.as_str()) else {
                continue;
            };
            if whole.start() > cursor {
                parts.push(TemplatePart::Text(source[cursor..whole.start()].to_string()));
            }
            parts.push(TemplatePart::Variable(selector));
            cursor = whole.end();
        }
        if cursor < source.len() {
            parts.push(TemplatePart::Text(source[cursor..].to_string()));
        }
        Self { parts }
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// Selectors referenced by the template, in order, deduplicated.
    pub fn selectors(&self) -> Vec<Selector> {
        let mut out: Vec<Selector> = Vec::new();
        for part in &self.parts {
            if let TemplatePart::Variable(sel) = part {
                if !out.contains(sel) {
                    out.push(sel.clone());
                }
            }
        }
        out
    }

    /// Substitute values; unresolved placeholders render empty.
    pub fn render(&self, inputs: &NodeInputs) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Variable(sel) => {
                    if let Some(value) = inputs.get(sel) {
                        out.push_str(&value.text());
                    }
                }
            }
        }
        out
    }
}

/// Render `{{ name }}` placeholders from a name → text map. Unknown names
/// render empty.
pub fn render_named(template: &str, values: &BTreeMap<String, String>) -> String {
    name_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .and_then(|m| values.get(m.as_str()))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::Segment;

    #[test]
    fn parses_text_and_selectors() {
        let tpl = Template::parse("Hi {{#start.name#}}, you said {{#llm_1.text#}}!");
        assert_eq!(
            tpl.selectors(),
            vec![Selector::new("start", "name"), Selector::new("llm_1", "text")]
        );
        assert_eq!(tpl.parts().len(), 5);
    }

    #[test]
    fn renders_missing_values_as_empty() {
        let tpl = Template::parse("[{{#start.name#}}|{{#start.other#}}]");
        let mut inputs = NodeInputs::new();
        inputs.insert(Selector::new("start", "name"), Segment::from("ada"));
        assert_eq!(tpl.render(&inputs), "[ada|]");
    }

    #[test]
    fn leaves_malformed_placeholders_as_text() {
        let tpl = Template::parse("{{#start#}} {{ name }}");
        assert!(tpl.selectors().is_empty());
        assert_eq!(tpl.render(&NodeInputs::new()), "{{#start#}} {{ name }}");
    }

    #[test]
    fn named_placeholders_tolerate_whitespace() {
        let values = BTreeMap::from([("name".to_string(), "ada".to_string())]);
        assert_eq!(render_named("hi {{name}} / {{  name }} / {{ x }}", &values), "hi ada / ada / ");
    }
}
