use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::error::SubmitError;

/// A file picked in the `#pdf` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Values of the upload form at the moment it was submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionForm {
    pub pdf: Option<PdfUpload>,
    pub label: String,
    pub schema_json: String,
}

/// The `#pdf`, `#label` and `#schema` inputs.
pub trait FormSource: Send + Sync {
    fn read(&self) -> Result<SubmissionForm, SubmitError>;
}

/// The `#output` element.
pub trait OutputSink: Send + Sync {
    fn set_text(&self, text: &str);
}

/// In-memory output element. Clones share the same text.
#[derive(Debug, Clone, Default)]
pub struct TextElement {
    text: Arc<Mutex<String>>,
}

impl TextElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        match self.text.lock() {
            Ok(text) => text.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl OutputSink for TextElement {
    fn set_text(&self, text: &str) {
        let mut guard = match self.text.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
        guard.push_str(text);
    }
}

/// Form values held in memory, handy for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticForm(pub SubmissionForm);

impl FormSource for StaticForm {
    fn read(&self) -> Result<SubmissionForm, SubmitError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default)]
pub struct SubmitEvent {
    default_prevented: AtomicBool,
}

impl SubmitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prevent_default(&self) {
        self.default_prevented.store(true, Ordering::SeqCst);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::SeqCst)
    }
}
