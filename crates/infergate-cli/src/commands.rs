use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use infergate_kernel::{WorkUnitRecord, WorkUnitStatus};
use infergate_runtime::batch::{AdmissionController, StatusEvent, StatusReconciler};
use infergate_runtime::{
    run_schedule, BatchJobService, ChunkedDispatcher, Dispatch, FanOutDispatcher,
    InfergateConfig, Invoker, RateLimiter, Registry,
};

use crate::jsonl;

/// Non-empty, non-comment lines of a URI list.
pub fn read_uris(reader: impl BufRead) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        uris.push(line.to_string());
    }
    Ok(uris)
}

#[cfg(feature = "bedrock")]
async fn batch_service(config: &InfergateConfig) -> Result<Arc<dyn BatchJobService>> {
    let service =
        infergate_runtime::bedrock::BedrockBatchService::from_env(config.model_id.clone()).await;
    Ok(Arc::new(service))
}

#[cfg(not(feature = "bedrock"))]
async fn batch_service(_config: &InfergateConfig) -> Result<Arc<dyn BatchJobService>> {
    bail!("this command talks to the batch job service; rebuild with --features bedrock")
}

#[cfg(feature = "bedrock")]
async fn invoker(config: &InfergateConfig) -> Result<Arc<dyn Invoker>> {
    let invoker =
        infergate_runtime::bedrock::BedrockInvoker::from_env(config.model_id.clone()).await;
    Ok(Arc::new(invoker))
}

#[cfg(not(feature = "bedrock"))]
async fn invoker(_config: &InfergateConfig) -> Result<Arc<dyn Invoker>> {
    bail!("this command talks to the invocation endpoint; rebuild with --features bedrock")
}

async fn controller(
    config: &InfergateConfig,
) -> Result<AdmissionController<Arc<dyn Registry>, Arc<dyn BatchJobService>>> {
    let admission = config.batch.admission()?;
    let registry = config.registry.open()?;
    let service = batch_service(config).await?;
    Ok(AdmissionController::new(registry, service, admission))
}

fn reconciler(config: &InfergateConfig) -> Result<StatusReconciler<Arc<dyn Registry>>> {
    let output_root = config
        .batch
        .output_root_uri
        .clone()
        .context("INFERGATE_OUTPUT_ROOT_URI is required to resolve output locations")?;
    Ok(StatusReconciler::new(config.registry.open()?, output_root))
}

pub async fn enqueue(
    config: &InfergateConfig,
    mut data_uris: Vec<String>,
    from_file: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = from_file {
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        data_uris.extend(read_uris(BufReader::new(file))?);
    }
    if data_uris.is_empty() {
        bail!("nothing to enqueue: pass data URIs or --from-file");
    }

    let registry = config.registry.open()?;
    for uri in data_uris {
        let id = Uuid::new_v4().to_string();
        registry
            .insert(WorkUnitRecord::pending(id.clone(), uri.clone(), Utc::now()))
            .await?;
        println!("{id}\t{uri}");
    }
    Ok(())
}

pub async fn status(config: &InfergateConfig) -> Result<()> {
    let registry = config.registry.open()?;
    let counts = registry.status_counts().await?;
    for status in WorkUnitStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        println!("{:<20}{}", status.as_str(), count);
    }
    Ok(())
}

pub async fn tick(config: &InfergateConfig) -> Result<()> {
    let report = controller(config).await?.tick().await?;
    println!(
        "active={} capacity={} started={} submit_failures={} conflicts={} record_failures={}",
        report.active_jobs,
        report.capacity,
        report.started,
        report.submit_failures,
        report.conflicts,
        report.record_failures
    );
    Ok(())
}

pub async fn serve(config: &InfergateConfig) -> Result<()> {
    let controller = controller(config).await?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "listening for Ctrl-C failed; stopping");
        }
    };
    let summary = run_schedule(&controller, config.batch.tick_interval, shutdown).await;
    info!(
        ticks = summary.ticks,
        failed_ticks = summary.failed_ticks,
        started = summary.started,
        "schedule stopped"
    );
    Ok(())
}

pub async fn reconcile(config: &InfergateConfig, event_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(event_path)
        .with_context(|| format!("reading {}", event_path.display()))?;
    let event = StatusEvent::from_notification(&raw)?;
    let outcome = reconciler(config)?.on_status_event(&event).await?;
    println!("{outcome:?}");
    Ok(())
}

pub async fn sync(config: &InfergateConfig) -> Result<()> {
    let reconciler = reconciler(config)?;
    let service = batch_service(config).await?;
    let report = reconciler
        .sync_in_flight(&service, config.batch.sync_limit)
        .await?;
    println!(
        "examined={} applied={} unchanged={} stale={} service_errors={} record_errors={}",
        report.examined,
        report.applied,
        report.unchanged,
        report.stale,
        report.service_errors,
        report.record_errors
    );
    Ok(())
}

pub async fn dispatch(
    config: &InfergateConfig,
    input: &Path,
    output: Option<&Path>,
    chunked: bool,
) -> Result<()> {
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let batch = jsonl::read_rows(BufReader::new(file), config.dispatch.embedding_dimensions)?;
    let invoker = invoker(config).await?;
    let limiter = RateLimiter::new(config.dispatch.rate_limit.clone());

    let dispatcher: Box<dyn Dispatch> = if chunked {
        Box::new(ChunkedDispatcher::new(
            invoker,
            limiter,
            config.dispatch.chunk_size,
            config.dispatch.workers,
        ))
    } else {
        Box::new(FanOutDispatcher::new(invoker, limiter))
    };
    let report = dispatcher.dispatch(batch.units).await?;

    let written = match output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            jsonl::write_results(io::BufWriter::new(file), &report, &batch.input_text)?
        }
        None => jsonl::write_results(io::stdout().lock(), &report, &batch.input_text)?,
    };
    eprintln!(
        "completed={} errors={} written={} elapsed={:.1}s items/second={:.2}",
        report.succeeded(),
        report.failed(),
        written,
        report.elapsed.as_secs_f64(),
        report.throughput()
    );
    Ok(())
}
