use anyhow::{bail, Context, Result};
use chunked_uploader::config::{get_config_file_path, get_logs_dir, load_config_from, UploaderConfig};
use chunked_uploader::events::{EventPayload, UploadEvent};
use chunked_uploader::logging::{init_logging, log_info};
use chunked_uploader::upload::{
    CompletedUploadResult, Priority, QueueItem, SessionStatus, UploadCategory, UploadFile,
    UploadOptions,
};
use chunked_uploader::validation::format_size;
use chunked_uploader::{UploadEngine, UploadError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "chunked-uploader")]
#[command(about = "Resumable chunked file uploads", version)]
struct Cli {
    /// Config file (defaults to ~/.chunked-uploader/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the upload server URL
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload {
        #[arg(required = true, help = "Files to upload")]
        files: Vec<PathBuf>,

        #[arg(long, default_value = "document")]
        category: UploadCategory,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Chunk size in bytes, overriding the size heuristic
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Resume a paused, failed or interrupted session
    Resume { session_id: String },

    /// Cancel a session and ask the server to discard it
    Cancel {
        session_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// List stored sessions
    Sessions,
}

fn load_settings(cli: &Cli) -> Result<UploaderConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => get_config_file_path()?,
    };
    let mut config = load_config_from(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_event(event: &UploadEvent) {
    match &event.payload {
        EventPayload::SessionCreated {
            session_id,
            file_name,
            file_size,
            total_chunks,
        } => println!(
            "{} {} ({}, {} chunks) -> session {}",
            event.kind(),
            file_name,
            format_size(*file_size),
            total_chunks,
            session_id
        ),
        EventPayload::SessionProgress {
            session_id,
            uploaded_chunks,
            total_chunks,
            percent,
            ..
        } => println!(
            "{} {} {}/{} ({:.1}%)",
            event.kind(),
            session_id,
            uploaded_chunks,
            total_chunks,
            percent
        ),
        EventPayload::ChunkUploadRetry {
            session_id,
            chunk_index,
            attempt,
            delay_ms,
            reason,
        } => println!(
            "{} {} chunk {} retry {} in {}ms: {}",
            event.kind(),
            session_id,
            chunk_index,
            attempt,
            delay_ms,
            reason
        ),
        EventPayload::SessionFailed { session_id, error } => {
            println!("{} {}: {}", event.kind(), session_id, error)
        }
        EventPayload::SessionCompleted { session_id, url, .. } => {
            println!("{} {} -> {}", event.kind(), session_id, url)
        }
        // Per-attempt chunk events are too chatty for the terminal
        EventPayload::ChunkUploadStart { .. }
        | EventPayload::ChunkUploadComplete { .. }
        | EventPayload::QueueStats { .. } => {}
        other => {
            if let Some(session_id) = other.session_id() {
                println!("{} {}", event.kind(), session_id);
            } else {
                println!("{}", event.kind());
            }
        }
    }
}

/// Pause everything still uploading so it can be resumed later
fn pause_active(engine: &UploadEngine) {
    for session in engine.sessions() {
        if session.status == SessionStatus::Uploading {
            if let Err(e) = engine.pause_upload(&session.session_id) {
                eprintln!("Failed to pause {}: {}", session.session_id, e);
            }
        }
    }
}

fn print_result(result: &CompletedUploadResult) {
    println!(
        "Uploaded {} ({}) as {}\n  {}",
        result.filename,
        format_size(result.size),
        result.key,
        result.url
    );
}

async fn run_upload(
    engine: &UploadEngine,
    files: Vec<PathBuf>,
    category: UploadCategory,
    priority: Priority,
    chunk_size: Option<u64>,
) -> Result<()> {
    let options = UploadOptions {
        chunk_size,
        ..UploadOptions::default()
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Result<CompletedUploadResult, UploadError>>();
    let mut expected = 0;

    for path in files {
        let file = UploadFile::from_path(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;

        let on_done = tx.clone();
        let on_fail = tx.clone();
        let item = QueueItem::new(file, category)
            .options(options.clone())
            .priority(priority)
            .on_complete(move |result| {
                let _ = on_done.send(Ok(result.clone()));
            })
            .on_error(move |error| {
                let _ = on_fail.send(Err(error.clone()));
            });
        engine.enqueue(item);
        expected += 1;
    }
    drop(tx);

    let mut failures = 0;
    for _ in 0..expected {
        let outcome = tokio::select! {
            outcome = rx.recv() => outcome,
            _ = tokio::signal::ctrl_c() => {
                pause_active(engine);
                bail!("Interrupted; paused sessions can be continued with `resume`");
            }
        };

        match outcome {
            Some(Ok(result)) => print_result(&result),
            Some(Err(error)) => {
                failures += 1;
                eprintln!("Upload failed: {}", error);
            }
            None => break,
        }
    }

    if failures > 0 {
        bail!("{} of {} upload(s) failed", failures, expected);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match get_logs_dir() {
        Ok(dir) => {
            if let Err(e) = init_logging(&dir) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to initialize logging: {}", e),
    }

    let config = load_settings(&cli)?;
    let engine = UploadEngine::from_config(config)?;
    engine.on_any(print_event);
    engine.start()?;

    log_info("cli", "chunked-uploader started");

    let result = match cli.command {
        Commands::Upload {
            files,
            category,
            priority,
            chunk_size,
        } => run_upload(&engine, files, category, priority, chunk_size).await,

        Commands::Resume { session_id } => {
            tokio::select! {
                result = engine.resume_upload(&session_id) => {
                    result.map(|r| print_result(&r)).map_err(anyhow::Error::from)
                }
                _ = tokio::signal::ctrl_c() => {
                    pause_active(&engine);
                    Err(anyhow::anyhow!("Interrupted; session {} paused", session_id))
                }
            }
        }

        Commands::Cancel { session_id, reason } => engine
            .cancel_upload(&session_id, reason.as_deref())
            .await
            .map(|_| println!("Cancelled {}", session_id))
            .map_err(anyhow::Error::from),

        Commands::Sessions => {
            let sessions = engine.sessions();
            if sessions.is_empty() {
                println!("No stored sessions");
            }
            for session in sessions {
                println!(
                    "{}  {:<10} {:>6.1}%  {}  (expires {})",
                    session.session_id,
                    session.status.to_string(),
                    session.progress_percent(),
                    session.file_name,
                    session.expires_at.format("%Y-%m-%d %H:%M UTC")
                );
            }
            Ok(())
        }
    };

    engine.stop();
    result
}
