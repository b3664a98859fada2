//! `{{name}}` substitution over structured data.
//!
//! Rules: a reference to an unknown name is left verbatim; a reference to a
//! stored result tagged failed collapses the whole resolution into an
//! explicit skip outcome (never inferred from serialized text); a string
//! that is exactly one reference substitutes the stored value itself,
//! preserving its type, while embedded references interpolate as text.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::StoredResult;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("variable pattern"))
}

/// Outcome of a resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Value(T),
    /// A referenced variable carries a failure marker; the step must be
    /// skipped, not executed with a hole in it.
    FailedRef(String),
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve references inside one string against stored step results.
pub fn resolve_str(
    input: &str,
    vars: &HashMap<String, StoredResult>,
) -> Resolution<String> {
    // Whole-string reference: hand back the value as text (type-preserving
    // substitution is only meaningful inside a JSON tree).
    for caps in var_pattern().captures_iter(input) {
        let name = &caps[1];
        if let Some(StoredResult::Failed { .. }) = vars.get(name) {
            return Resolution::FailedRef(name.to_string());
        }
    }
    let out = var_pattern().replace_all(input, |caps: &regex::Captures<'_>| {
        match vars.get(&caps[1]) {
            Some(StoredResult::Ok { value }) => stringify(value),
            // Failed handled above; unknown stays verbatim.
            _ => caps[0].to_string(),
        }
    });
    Resolution::Value(out.into_owned())
}

/// Resolve references across a JSON tree. Strings that are exactly one
/// reference substitute the stored value with its type intact.
pub fn resolve_json(
    input: &Value,
    vars: &HashMap<String, StoredResult>,
) -> Resolution<Value> {
    match input {
        Value::String(s) => {
            if let Some(caps) = var_pattern().captures(s) {
                if caps.get(0).map(|m| m.as_str()) == Some(s.as_str()) {
                    return match vars.get(&caps[1]) {
                        Some(StoredResult::Ok { value }) => Resolution::Value(value.clone()),
                        Some(StoredResult::Failed { .. }) => {
                            Resolution::FailedRef(caps[1].to_string())
                        }
                        None => Resolution::Value(input.clone()),
                    };
                }
            }
            match resolve_str(s, vars) {
                Resolution::Value(out) => Resolution::Value(Value::String(out)),
                Resolution::FailedRef(name) => Resolution::FailedRef(name),
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match resolve_json(item, vars) {
                    Resolution::Value(v) => out.push(v),
                    failed @ Resolution::FailedRef(_) => return failed,
                }
            }
            Resolution::Value(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                match resolve_json(item, vars) {
                    Resolution::Value(v) => {
                        out.insert(key.clone(), v);
                    }
                    failed @ Resolution::FailedRef(_) => return failed,
                }
            }
            Resolution::Value(Value::Object(out))
        }
        other => Resolution::Value(other.clone()),
    }
}

/// Fill a prompt template from plain string variables. References to names
/// outside the map are left verbatim.
pub fn render_prompt(template: &str, vars: &HashMap<String, String>) -> String {
    var_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, StoredResult> {
        let mut vars = HashMap::new();
        vars.insert(
            "balance".to_string(),
            StoredResult::Ok {
                value: json!(41.5),
            },
        );
        vars.insert(
            "greeting".to_string(),
            StoredResult::Ok {
                value: json!("hello"),
            },
        );
        vars.insert(
            "nothing".to_string(),
            StoredResult::Ok { value: Value::Null },
        );
        vars.insert(
            "broken".to_string(),
            StoredResult::Failed {
                error: "boom".to_string(),
            },
        );
        vars
    }

    #[test]
    fn whole_string_reference_preserves_type() {
        let resolved = resolve_json(&json!({"amount": "{{balance}}"}), &vars());
        assert_eq!(resolved, Resolution::Value(json!({"amount": 41.5})));
    }

    #[test]
    fn embedded_reference_interpolates_text() {
        let resolved = resolve_json(&json!("say {{greeting}} ({{balance}})"), &vars());
        assert_eq!(resolved, Resolution::Value(json!("say hello (41.5)")));
    }

    #[test]
    fn unknown_reference_left_verbatim() {
        let resolved = resolve_json(&json!("{{mystery}}"), &vars());
        assert_eq!(resolved, Resolution::Value(json!("{{mystery}}")));
    }

    #[test]
    fn failed_reference_skips() {
        assert_eq!(
            resolve_json(&json!({"deep": ["{{broken}}"]}), &vars()),
            Resolution::FailedRef("broken".to_string())
        );
        assert_eq!(
            resolve_str("use {{broken}} here", &vars()),
            Resolution::FailedRef("broken".to_string())
        );
    }

    #[test]
    fn successful_null_is_not_a_skip() {
        // A legitimately null result substitutes as null; only the explicit
        // failure tag skips.
        let resolved = resolve_json(&json!({"x": "{{nothing}}"}), &vars());
        assert_eq!(resolved, Resolution::Value(json!({"x": null})));
    }

    #[test]
    fn render_prompt_fills_known_names() {
        let mut vars = HashMap::new();
        vars.insert("identity".to_string(), "I am.".to_string());
        assert_eq!(
            render_prompt("{{identity}} / {{unknown}}", &vars),
            "I am. / {{unknown}}"
        );
    }
}
