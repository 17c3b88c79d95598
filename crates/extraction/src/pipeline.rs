use std::sync::Arc;

use serde_json::Value;
use shared::protocol::{ExtractionResult, ExtractionSchema, LlmFieldAnswer};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::{
    error::ExtractError,
    layout_search,
    llm::{build_prompt, LlmClient},
    pdf_parser::PdfParser,
    preprocessor::Preprocessor,
};

#[derive(Clone)]
pub struct Pipeline {
    storage: Storage,
    llm: Arc<dyn LlmClient>,
}

impl Pipeline {
    pub fn new(storage: Storage, llm: Arc<dyn LlmClient>) -> Self {
        Self { storage, llm }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Extracts every schema field from the first page of `pdf_bytes`.
    ///
    /// Order of resolution: whole-document cache, then layout memory, then
    /// the LLM for whatever is left. LLM answers that point at a block are
    /// fed back into layout memory, and the merged result is cached.
    pub async fn run(
        &self,
        pdf_bytes: &[u8],
        label: &str,
        schema: &ExtractionSchema,
    ) -> Result<ExtractionResult, ExtractError> {
        let page = PdfParser::parse(pdf_bytes)?;
        let doc_text = page.plain_text();

        let schema_key = canonical_json(&Value::Object(schema.clone()));
        if let Some(cached) = self.storage.cached_result(&doc_text, &schema_key).await? {
            info!(label, "pipeline: document cache hit");
            return Ok(cached);
        }

        let blocks = Preprocessor::preprocess_blocks(&page.text_blocks());
        let search = layout_search::search(&self.storage, label, schema, blocks).await?;
        if search.fallback.is_empty() {
            info!(label, fields = search.resolved.len(), "pipeline: all fields resolved from layout memory");
            return Ok(search.resolved);
        }

        let prompt = build_prompt(&search.remaining_blocks, label, &search.fallback_schema());
        info!(
            label,
            resolved = search.resolved.len(),
            fallback = search.fallback.len(),
            "pipeline: falling back to LLM"
        );
        let answer = self.llm.complete_json(&prompt).await?;

        let mut output = search.resolved;
        for (field, _) in &search.fallback {
            let parsed = answer
                .get(field)
                .cloned()
                .map(serde_json::from_value::<LlmFieldAnswer>)
                .transpose()
                .unwrap_or_else(|error| {
                    warn!(field = field.as_str(), %error, "pipeline: malformed field in LLM answer");
                    None
                })
                .unwrap_or_default();

            if is_empty_answer(&parsed.value) {
                output.insert(field.clone(), Value::Null);
                continue;
            }
            output.insert(field.clone(), parsed.value.clone());

            let Some(index) = parsed.block_index() else {
                continue;
            };
            let Some(block) = search.remaining_blocks.get(index - 1) else {
                warn!(field = field.as_str(), index, "pipeline: LLM referenced a block out of range");
                continue;
            };
            self.storage
                .update_field(label, field, block.px, block.py, parsed.learned_regex())
                .await?;
        }

        for extra in answer.keys().filter(|key| !output.contains_key(*key)) {
            debug!(field = extra.as_str(), "pipeline: ignoring field not requested from LLM");
        }

        self.storage
            .store_cached_result(&doc_text, &schema_key, &output, Some(label))
            .await?;
        Ok(output)
    }
}

/// Answers that carry nothing: null, `false`, zero, and empty strings,
/// arrays or objects. Such fields are reported as null and never learned.
fn is_empty_answer(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Compact JSON with object keys sorted at every level, so equal schemas
/// produce equal cache keys regardless of field order.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
