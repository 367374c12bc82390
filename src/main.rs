use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::warn;

use transcription_orchestrator::cli::{Cli, Command};
use transcription_orchestrator::config::AppConfig;
use transcription_orchestrator::events::RequestContext;
use transcription_orchestrator::logging::init_logging;
use transcription_orchestrator::orchestrator::{JobOptions, JobOrchestrator, UploadMeta};
use transcription_orchestrator::resilience::{CircuitBreaker, ResilientInvoker};
use transcription_orchestrator::router::{AudioMetadata, ModelSelectionPolicy};
use transcription_orchestrator::storage::{LocalStorage, Storage};
use transcription_orchestrator::store::Ledger;
use transcription_orchestrator::worker::{HttpWorker, WorkerResult};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;
    init_logging(&config.logging, cli.verbose);

    // Pure policy query, no ledger or worker needed.
    let command = match cli.command {
        Command::Select {
            size_bytes,
            duration_seconds,
            language,
            quality,
        } => {
            let policy = ModelSelectionPolicy::new(&config.model_selection);
            let meta = AudioMetadata::new(size_bytes, duration_seconds, language.as_deref());
            println!("{}", policy.select(&meta, quality.into()));
            return Ok(());
        }
        other => other,
    };

    let ledger = match &config.orchestrator.journal_path {
        Some(path) => Ledger::open(path)
            .await
            .with_context(|| format!("failed to open journal {}", path.display()))?,
        None => {
            warn!("no orchestrator.journal_path configured, state will not outlive this process");
            Ledger::in_memory()
        }
    };
    let ledger = Arc::new(ledger);

    let worker = HttpWorker::new(&config.worker, &config.timeouts)
        .context("failed to build worker client")?;
    let breaker = Arc::new(CircuitBreaker::new(
        config.worker.name.clone(),
        &config.circuit_breaker,
    ));
    let invoker = ResilientInvoker::new(worker, breaker, &config.timeouts);
    let orchestrator = Arc::new(JobOrchestrator::new(&config, ledger.clone(), invoker));
    let audit = orchestrator.spawn_breaker_audit();

    match command {
        Command::Submit {
            file,
            sync,
            async_mode,
            quality,
            language,
            model,
            correlation_id,
            diarize,
            duration,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let storage = LocalStorage::new(&config.storage.root);
            let storage_ref = storage.upload(&bytes, &name).await?;

            let upload = UploadMeta {
                original_name: name,
                storage_ref,
                file_size_bytes: bytes.len() as u64,
                mime_type: mime_for(&file).map(str::to_string),
                duration_seconds: duration,
            };
            let options = JobOptions {
                language,
                quality: quality.into(),
                model: model.map(Into::into),
                diarization: diarize,
                mode: Command::requested_mode(sync, async_mode),
            };
            let mut ctx = RequestContext::new("cli");
            if let Some(id) = correlation_id {
                ctx = ctx.with_correlation_id(id);
            }
            let job = orchestrator.create_job(upload, options, &ctx).await?;
            print_json(&job)?;
        }
        Command::Callback { job_id, result } => {
            let body = tokio::fs::read_to_string(&result)
                .await
                .with_context(|| format!("failed to read {}", result.display()))?;
            let result: WorkerResult =
                serde_json::from_str(&body).context("invalid worker result")?;
            let ctx = RequestContext::new(config.worker.name.clone());
            let job = orchestrator.handle_callback(&job_id, result, &ctx).await?;
            print_json(&job)?;
        }
        Command::Events { job_id, after } => {
            let job = orchestrator.get_job(&job_id).await?;
            print_json(&job)?;
            print_json(&ledger.query_after(&job_id, after).await)?;
        }
        Command::Trace { correlation_id } => {
            print_json(&ledger.query_by_correlation(&correlation_id).await)?;
        }
        Command::Recent { limit } => {
            print_json(&ledger.query_recent(limit).await)?;
        }
        Command::Sweep { watch: false } => {
            let swept = orchestrator.sweep_stale().await?;
            println!("{swept} stale job(s) failed");
        }
        Command::Sweep { watch: true } => {
            let sweeper = orchestrator.clone().spawn_stale_sweeper();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            sweeper.abort();
        }
        Command::Select { .. } => {}
    }

    audit.abort();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "wav" => Some("audio/wav"),
        "mp3" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}
