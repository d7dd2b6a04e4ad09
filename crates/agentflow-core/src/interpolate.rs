// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter interpolation.
//!
//! Resolves `${global.<name>}` and `${steps.<id>.output(.<field>)*}`
//! references inside a JSON parameter template. A string leaf that is
//! exactly one reference token takes the referenced value with its type;
//! references embedded in longer strings are spliced in as text. Unknown
//! references are left literal so callers can tell missing from resolved.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Resolves `${...}` references against an execution context.
pub struct Interpolator {
    token: Regex,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator {
    pub fn new() -> Self {
        Self {
            // No whitespace inside the braces; the body is parsed separately.
            token: Regex::new(r"\$\{([^}\s]+)\}").expect("interpolation token pattern"),
        }
    }

    /// Walks the template and resolves every reference it can.
    pub fn resolve(
        &self,
        template: &Value,
        globals: &HashMap<String, Value>,
        step_outputs: &HashMap<String, Value>,
    ) -> Value {
        match template {
            Value::String(text) => self.resolve_string(text, globals, step_outputs),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item, globals, step_outputs))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), self.resolve(value, globals, step_outputs)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(
        &self,
        text: &str,
        globals: &HashMap<String, Value>,
        step_outputs: &HashMap<String, Value>,
    ) -> Value {
        // A leaf that is exactly one token keeps the resolved value's type.
        if let Some(caps) = self.token.captures(text) {
            if caps.get(0).map(|m| m.as_str()) == Some(text) {
                return match lookup(&caps[1], globals, step_outputs) {
                    Some(value) => value,
                    None => Value::String(text.to_string()),
                };
            }
        }

        let replaced = self.token.replace_all(text, |caps: &regex::Captures<'_>| {
            match lookup(&caps[1], globals, step_outputs) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        });
        Value::String(replaced.into_owned())
    }
}

/// Resolves one reference body (the text between the braces).
fn lookup(
    reference: &str,
    globals: &HashMap<String, Value>,
    step_outputs: &HashMap<String, Value>,
) -> Option<Value> {
    let mut segments = reference.split('.');
    match segments.next()? {
        "global" => {
            let name = segments.next()?;
            if segments.next().is_some() {
                return None;
            }
            globals.get(name).cloned()
        }
        "steps" => {
            let step_id = segments.next()?;
            if segments.next()? != "output" {
                return None;
            }
            let mut value = step_outputs.get(step_id)?.clone();
            for field in segments {
                value = value.get(field)?.clone();
            }
            Some(value)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> (HashMap<String, Value>, HashMap<String, Value>) {
        let mut globals = HashMap::new();
        globals.insert("topic".to_string(), json!("rust"));
        globals.insert("depth".to_string(), json!(3));

        let mut outputs = HashMap::new();
        outputs.insert(
            "s1".to_string(),
            json!({"value": 42, "label": "ok", "nested": {"inner": [1, 2]}}),
        );
        (globals, outputs)
    }

    #[test]
    fn test_single_token_keeps_type() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let resolved = interp.resolve(&json!("${steps.s1.output.value}"), &globals, &outputs);
        assert_eq!(resolved, json!(42));

        let resolved = interp.resolve(&json!("${global.depth}"), &globals, &outputs);
        assert_eq!(resolved, json!(3));

        let resolved = interp.resolve(&json!("${steps.s1.output}"), &globals, &outputs);
        assert_eq!(resolved["label"], json!("ok"));
    }

    #[test]
    fn test_embedded_token_is_spliced_as_text() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let resolved = interp.resolve(
            &json!("searching ${global.topic} at depth ${global.depth}"),
            &globals,
            &outputs,
        );
        assert_eq!(resolved, json!("searching rust at depth 3"));
    }

    #[test]
    fn test_unknown_reference_left_literal() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let resolved = interp.resolve(&json!("${global.absent}"), &globals, &outputs);
        assert_eq!(resolved, json!("${global.absent}"));

        let resolved = interp.resolve(&json!("x=${steps.s2.output}"), &globals, &outputs);
        assert_eq!(resolved, json!("x=${steps.s2.output}"));
    }

    #[test]
    fn test_missing_nested_field_left_literal() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let resolved = interp.resolve(&json!("${steps.s1.output.value.deeper}"), &globals, &outputs);
        assert_eq!(resolved, json!("${steps.s1.output.value.deeper}"));
    }

    #[test]
    fn test_nested_field_path() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let resolved = interp.resolve(&json!("${steps.s1.output.nested.inner}"), &globals, &outputs);
        assert_eq!(resolved, json!([1, 2]));
    }

    #[test]
    fn test_structure_walk() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let template = json!({
            "query": "${global.topic}",
            "count": 7,
            "refs": ["${steps.s1.output.value}", {"deep": "${steps.s1.output.label}"}]
        });
        let resolved = interp.resolve(&template, &globals, &outputs);
        assert_eq!(
            resolved,
            json!({
                "query": "rust",
                "count": 7,
                "refs": [42, {"deep": "ok"}]
            })
        );
    }

    #[test]
    fn test_non_string_leaves_pass_through() {
        let (globals, outputs) = context();
        let interp = Interpolator::new();

        let template = json!({"flag": true, "n": 1.5, "none": null});
        assert_eq!(interp.resolve(&template, &globals, &outputs), template);
    }
}
