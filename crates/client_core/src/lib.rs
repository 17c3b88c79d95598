use reqwest::{
    multipart::{Form, Part},
    Client,
};
use serde_json::Value;
use shared::protocol::{is_truthy, EXTRACT_ROUTE, FIELD_LABEL, FIELD_PDF, FIELD_SCHEMA_JSON};
use tracing::{debug, info, warn};
use url::Url;

pub mod error;
pub mod form;

pub use error::SubmitError;
pub use form::{
    FormSource, OutputSink, PdfUpload, StaticForm, SubmissionForm, SubmitEvent, TextElement,
};

pub const PROCESSING_MESSAGE: &str = "Processing...";

/// What a browser `FormData` sends for a file input with nothing selected
/// once it has been read as `files[0]`.
const MISSING_FILE_VALUE: &str = "undefined";

/// Drives one upload form: posts its values to the extraction service and
/// writes the outcome into the output element.
pub struct SubmissionHandler<F, O> {
    http: Client,
    extract_url: Url,
    form: F,
    output: O,
}

impl<F, O> SubmissionHandler<F, O>
where
    F: FormSource,
    O: OutputSink,
{
    pub fn new(server_url: &str, form: F, output: O) -> Result<Self, SubmitError> {
        Self::with_client(Client::new(), server_url, form, output)
    }

    pub fn with_client(
        http: Client,
        server_url: &str,
        form: F,
        output: O,
    ) -> Result<Self, SubmitError> {
        let extract_url = Url::parse(server_url)?.join(EXTRACT_ROUTE)?;
        Ok(Self {
            http,
            extract_url,
            form,
            output,
        })
    }

    pub fn extract_url(&self) -> &Url {
        &self.extract_url
    }

    /// Handles one submit event and returns the parsed response body.
    ///
    /// A response whose `success` is falsy is still `Ok`; the output then
    /// carries the `Error: ` line. On `Err` the output is left showing
    /// [`PROCESSING_MESSAGE`] if the request had already started.
    pub async fn on_submit(&self, event: &SubmitEvent) -> Result<Value, SubmitError> {
        event.prevent_default();

        let values = self.form.read()?;
        self.output.set_text(PROCESSING_MESSAGE);

        let has_file = values.pdf.is_some();
        debug!(
            url = %self.extract_url,
            has_file,
            label = %values.label,
            "submit: posting form"
        );
        let response = self
            .http
            .post(self.extract_url.clone())
            .multipart(multipart_form(values))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "submit: request failed");
                SubmitError::Network(e)
            })?;

        let status = response.status();
        let bytes = response.bytes().await?;
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| {
            warn!(%status, error = %e, "submit: response body is not JSON");
            SubmitError::Parse(e)
        })?;

        info!(%status, success = is_success(&data), "submit: response received");
        self.output.set_text(&render_response(&data));
        Ok(data)
    }
}

fn multipart_form(values: SubmissionForm) -> Form {
    let pdf = match values.pdf {
        Some(upload) => Part::bytes(upload.bytes).file_name(upload.filename),
        None => Part::text(MISSING_FILE_VALUE),
    };
    Form::new()
        .part(FIELD_PDF, pdf)
        .text(FIELD_LABEL, values.label)
        .text(FIELD_SCHEMA_JSON, values.schema_json)
}

pub fn is_success(data: &Value) -> bool {
    is_truthy(&data["success"])
}

/// Text shown in `#output` for a parsed response.
pub fn render_response(data: &Value) -> String {
    if is_success(data) {
        serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
    } else {
        format!("Error: {}", js_string(data.get("error")))
    }
}

/// String conversion as in `"" + value`; `None` stands for `undefined`.
pub fn js_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".into(),
        Some(Value::Null) => "null".into(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => js_number(n),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".into(),
    }
}

fn js_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if f == 0.0 => "0".into(),
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
        _ => n.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
