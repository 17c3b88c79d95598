use regex::RegexBuilder;
use serde_json::{Map, Value};
use shared::{
    domain::{Significance, TextBlock, DEFAULT_CONFIDENCE_Z},
    protocol::{ExtractionResult, ExtractionSchema, FallbackField},
};
use storage::Storage;
use tracing::{debug, warn};

use crate::error::ExtractError;

#[derive(Debug, Clone, Default)]
pub struct LayoutSearchOutcome {
    /// Fields answered from learned positions and regexes.
    pub resolved: ExtractionResult,
    /// Fields left for the LLM, in schema order.
    pub fallback: Vec<(String, FallbackField)>,
    /// Blocks not consumed by a resolved field, in reading order.
    pub remaining_blocks: Vec<TextBlock>,
}

impl LayoutSearchOutcome {
    pub fn fallback_schema(&self) -> Map<String, Value> {
        self.fallback
            .iter()
            .map(|(field, fallback)| {
                (
                    field.clone(),
                    serde_json::json!({
                        "description": fallback.description,
                        "extract_regex": fallback.extract_regex,
                    }),
                )
            })
            .collect()
    }
}

/// Tries to answer every schema field from layout memory. A field resolves
/// when a remaining block sits inside its non-low confidence interval and the
/// learned regex matches that block; the block then leaves the pool.
pub async fn search(
    storage: &Storage,
    label: &str,
    schema: &ExtractionSchema,
    blocks: Vec<TextBlock>,
) -> Result<LayoutSearchOutcome, ExtractError> {
    let mut outcome = LayoutSearchOutcome {
        remaining_blocks: blocks,
        ..Default::default()
    };

    for (field, description) in schema {
        let regex = storage.field_regex(label, field).await?;
        let candidate = match storage
            .field_confidence(label, field, DEFAULT_CONFIDENCE_Z)
            .await?
        {
            Some(ci) if ci.significance != Significance::Low => outcome
                .remaining_blocks
                .iter()
                .position(|block| ci.contains(block.px, block.py)),
            _ => None,
        };

        if let (Some(index), Some(pattern)) = (candidate, regex.as_deref()) {
            if let Some(value) = apply_regex(pattern, &outcome.remaining_blocks[index].text, field) {
                debug!(label, field = field.as_str(), "layout memory: field resolved without LLM");
                outcome.resolved.insert(field.clone(), Value::String(value));
                outcome.remaining_blocks.remove(index);
                continue;
            }
        }

        outcome.fallback.push((
            field.clone(),
            FallbackField {
                description: description.clone(),
                extract_regex: regex.is_none(),
            },
        ));
    }

    Ok(outcome)
}

fn apply_regex(pattern: &str, text: &str, field: &str) -> Option<String> {
    match RegexBuilder::new(pattern).multi_line(true).build() {
        Ok(regex) => regex.find(text).map(|m| m.as_str().trim().to_string()),
        Err(error) => {
            warn!(%pattern, field, %error, "layout memory: invalid learned regex");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/layout_search_tests.rs"]
mod tests;
