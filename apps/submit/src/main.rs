use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use client_core::{
    FormSource, OutputSink, PdfUpload, SubmissionForm, SubmissionHandler, SubmitError,
    SubmitEvent,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Submit a PDF to the extraction service the way the upload page does.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server_url: String,
    /// PDF to upload; omitted means no file selected.
    #[arg(long)]
    pdf: Option<PathBuf>,
    #[arg(long, default_value = "")]
    label: String,
    /// Schema JSON, sent as-is.
    #[arg(long, conflicts_with = "schema_file")]
    schema: Option<String>,
    #[arg(long)]
    schema_file: Option<PathBuf>,
}

/// Reads the form inputs from disk when the form is submitted.
struct FileForm {
    pdf: Option<PathBuf>,
    label: String,
    schema: Option<String>,
    schema_file: Option<PathBuf>,
}

impl FormSource for FileForm {
    fn read(&self) -> Result<SubmissionForm, SubmitError> {
        let pdf = match &self.pdf {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    SubmitError::Form(format!("failed to read {}: {e}", path.display()))
                })?;
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "document.pdf".into());
                Some(PdfUpload { filename, bytes })
            }
            None => None,
        };

        let schema_json = match (&self.schema, &self.schema_file) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => fs::read_to_string(path).map_err(|e| {
                SubmitError::Form(format!("failed to read {}: {e}", path.display()))
            })?,
            (None, None) => String::new(),
        };

        Ok(SubmissionForm {
            pdf,
            label: self.label.clone(),
            schema_json,
        })
    }
}

struct Stdout;

impl OutputSink for Stdout {
    fn set_text(&self, text: &str) {
        println!("{text}");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let form = FileForm {
        pdf: args.pdf,
        label: args.label,
        schema: args.schema,
        schema_file: args.schema_file,
    };
    let handler = SubmissionHandler::new(&args.server_url, form, Stdout)?;

    match handler.on_submit(&SubmitEvent::new()).await {
        Ok(data) if client_core::is_success(&data) => Ok(ExitCode::SUCCESS),
        Ok(_) => Ok(ExitCode::FAILURE),
        Err(e) => {
            error!(error = %e, "submission failed");
            Ok(ExitCode::FAILURE)
        }
    }
}
