use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use shared::domain::DEFAULT_CONFIDENCE_Z;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/layout_memory.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Learned positions and regexes for every field of a label.
    FieldStats { label: String },
    /// Cached whole-document results, newest first.
    CacheEntries {
        #[arg(long)]
        label: Option<String>,
    },
    /// Drop cached results so the next upload is extracted again.
    PurgeCache {
        #[arg(long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::FieldStats { label } => {
            for entry in storage.list_field_stats(&label).await? {
                let line = json!({
                    "field": entry.field,
                    "stats": entry.stats,
                    "confidence": entry.stats.confidence(DEFAULT_CONFIDENCE_Z),
                    "regex": entry.regex,
                });
                println!("{line}");
            }
        }
        Command::CacheEntries { label } => {
            for doc in storage.list_cached_documents(label.as_deref()).await? {
                println!(
                    "{} label={} created_at={}",
                    doc.fingerprint,
                    doc.label.as_deref().unwrap_or("-"),
                    doc.created_at.to_rfc3339()
                );
            }
        }
        Command::PurgeCache { label } => {
            let removed = storage.purge_doc_cache(label.as_deref()).await?;
            println!("removed {removed} cached document(s)");
        }
    }

    Ok(())
}
