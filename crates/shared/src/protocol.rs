use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EXTRACT_ROUTE: &str = "/extract";

pub const FIELD_PDF: &str = "pdf";
pub const FIELD_LABEL: &str = "label";
pub const FIELD_SCHEMA_JSON: &str = "schema_json";

/// Field name → free-form description, in the order the caller wrote it.
pub type ExtractionSchema = Map<String, Value>;

/// Field name → extracted value (`null` when nothing was found).
pub type ExtractionResult = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub runtime_seconds: f64,
    pub result: ExtractionResult,
}

impl ExtractResponse {
    pub fn new(runtime_seconds: f64, result: ExtractionResult) -> Self {
        Self {
            success: true,
            runtime_seconds: (runtime_seconds * 100.0).round() / 100.0,
            result,
        }
    }
}

/// A field the layout memory could not answer, as handed to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackField {
    pub description: Value,
    pub extract_regex: bool,
}

/// One field of the LLM's JSON answer. `block` is 1-based and arrives as
/// either a number or a numeric string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmFieldAnswer {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub block: Value,
}

impl LlmFieldAnswer {
    pub fn block_index(&self) -> Option<usize> {
        match &self.block {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|index| *index > 0)
    }

    pub fn learned_regex(&self) -> Option<&str> {
        self.regex.as_deref().filter(|r| !r.trim().is_empty())
    }
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_is_rounded_to_two_decimals() {
        let response = ExtractResponse::new(1.23456, Map::new());
        assert_eq!(response.runtime_seconds, 1.23);
        assert!(response.success);
    }

    #[test]
    fn block_index_accepts_numbers_and_strings() {
        let answer: LlmFieldAnswer =
            serde_json::from_value(serde_json::json!({ "value": "x", "block": "3" }))
                .expect("answer");
        assert_eq!(answer.block_index(), Some(3));

        let answer: LlmFieldAnswer =
            serde_json::from_value(serde_json::json!({ "value": "x", "block": 2 }))
                .expect("answer");
        assert_eq!(answer.block_index(), Some(2));

        let answer: LlmFieldAnswer =
            serde_json::from_value(serde_json::json!({ "value": "x", "block": "0" }))
                .expect("answer");
        assert_eq!(answer.block_index(), None);
    }

    #[test]
    fn blank_regex_is_not_learned() {
        let answer = LlmFieldAnswer {
            regex: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(answer.learned_regex(), None);
    }

    #[test]
    fn truthiness_follows_javascript() {
        use serde_json::json;
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}
