use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{DetectorClient, ImageUpload, PageController, UiEvent};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::broadcast::{error::TryRecvError, Receiver},
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Check images against the prediction gateway")]
struct Args {
    #[arg(long, env = "DETECTOR_SERVER_URL", default_value = "http://127.0.0.1:5000")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify the image at a URL.
    Url {
        image_url: String,
        /// File the result as a wrong prediction afterwards.
        #[arg(long)]
        report: bool,
    },
    /// Classify a local image file.
    File {
        path: PathBuf,
        #[arg(long)]
        report: bool,
    },
    /// Interactive session.
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let page = PageController::new(DetectorClient::new(args.server_url));
    let mut events = page.subscribe_events();

    match args.command {
        Command::Url { image_url, report } => {
            page.set_url_input(image_url).await;
            let outcome = page.predict_url().await;
            render(&mut events);
            if outcome?.is_some() && report {
                page.report_prediction().await?;
                render(&mut events);
            }
        }
        Command::File { path, report } => {
            let upload = ImageUpload::from_path(&path).await?;
            page.select_file(Some(upload)).await;
            let outcome = page.predict_upload().await;
            render(&mut events);
            if outcome?.is_some() && report {
                page.report_prediction().await?;
                render(&mut events);
            }
        }
        Command::Shell => shell(&page, &mut events).await?,
    }

    Ok(())
}

const SHELL_HELP: &str =
    "commands: url <image-url> | file <path> | predict | upload | report | view | help | quit";

async fn shell(page: &PageController, events: &mut Receiver<UiEvent>) -> Result<()> {
    println!("{SHELL_HELP}");
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "" => continue,
            "quit" | "exit" => break,
            "help" => println!("{SHELL_HELP}"),
            "url" => page.set_url_input(rest).await,
            "file" => match ImageUpload::from_path(rest).await {
                Ok(upload) => page.select_file(Some(upload)).await,
                Err(err) => eprintln!("{err}"),
            },
            "predict" => {
                if let Err(err) = page.predict_url().await {
                    debug!(%err, "url prediction failed");
                }
            }
            "upload" => {
                if let Err(err) = page.predict_upload().await {
                    debug!(%err, "upload prediction failed");
                }
            }
            "report" => {
                if let Err(err) = page.report_prediction().await {
                    debug!(%err, "report failed");
                }
            }
            "view" => {
                let view = page.view().await;
                println!("url: {}", view.url_input);
                println!("file: {}", view.selected_file.as_deref().unwrap_or("-"));
                println!("result: {}", view.result);
                println!("report available: {}", view.report_button_visible);
            }
            other => println!("unknown command '{other}'; {SHELL_HELP}"),
        }
        render(events);
    }
    Ok(())
}

/// Prints whatever the controller published since the last call.
fn render(events: &mut Receiver<UiEvent>) {
    loop {
        match events.try_recv() {
            Ok(UiEvent::Alert(text)) => println!("! {text}"),
            Ok(UiEvent::ResultChanged(result)) => println!("{result}"),
            Ok(UiEvent::ReportButtonChanged(true)) => {
                println!("(wrong? run `report` to flag this prediction)")
            }
            Ok(UiEvent::ReportButtonChanged(false)) => {}
            Ok(UiEvent::PreviewChanged(Some(filename))) => println!("selected {filename}"),
            Ok(UiEvent::PreviewChanged(None)) => {}
            Err(TryRecvError::Lagged(skipped)) => debug!(skipped, "dropped ui events"),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}
