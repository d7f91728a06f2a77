use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print filed reports as JSON lines, newest first.
    ListReports {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Print archived images of a bucket as JSON lines, newest first.
    ListImages {
        #[arg(long)]
        bucket: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    ExportImage {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::ListReports { limit } => {
            for report in storage.list_reports(limit).await? {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::ListImages { bucket, limit } => {
            for object in storage.list_objects(&bucket, limit).await? {
                println!("{}", serde_json::to_string(&object)?);
            }
        }
        Command::ExportImage { bucket, key, out } => {
            let Some(object) = storage.load_object(&bucket, &key).await? else {
                bail!("no object '{key}' in bucket '{bucket}'");
            };
            tokio::fs::write(&out, &object.bytes)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "wrote {} bytes to {}",
                object.bytes.len(),
                out.display()
            );
        }
    }

    Ok(())
}
