use chat_sync::config::SyncConfig;
use chat_sync::constants::ENV_AUTH_TOKEN;
use chat_sync::logging::{init_tracing, setup_panic_hook};
use chat_sync::metrics::SyncMetrics;
use chat_sync::registry::{JobRegistry, JobSnapshot};
use chat_sync::tracker::{IssueKind, JobKind, JobState};
use chat_sync::transport::HttpTransport;
use chat_sync::{JobId, Result, SyncError, TraceId};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Follows one job's event stream and logs its state until it resolves.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overrides CHAT_SYNC_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    job_id: String,
    #[arg(long, default_value = "upload")]
    kind: JobKind,
    #[arg(long)]
    trace_id: Option<String>,
    /// Also write a daily-rolling log file here.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    log_json: bool,
    #[arg(long)]
    max_reconnects: Option<u32>,
    #[arg(long, default_value_t = false)]
    no_reconnect: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = init_tracing("chat_sync=info,chat_sync_watch=info", args.log_dir.as_deref(), args.log_json);
    setup_panic_hook();

    if let Err(e) = run(args).await {
        tracing::error!("{}", e.inner);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = SyncConfig::from_env()?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(max) = args.max_reconnects {
        config.max_reconnect_attempts = max;
    }
    if args.no_reconnect {
        config.reconnect = false;
    }
    config.validate()?;

    let mut transport = HttpTransport::new(config.http_client()?);
    if let Ok(token) = std::env::var(ENV_AUTH_TOKEN) {
        if !token.is_empty() {
            transport = transport.with_bearer(&token)?;
        }
    }

    let metrics = Arc::new(SyncMetrics::new());
    let mut registry = JobRegistry::new(config, Arc::new(transport), metrics.clone());
    let job_id = JobId::from(args.job_id);
    let trace_id = match args.trace_id {
        Some(t) => TraceId::from(t),
        None => TraceId::new(),
    };
    tracing::info!("Watching {} job {} (trace {})", args.kind, job_id, trace_id);
    let mut rx = registry.watch_traced(job_id.clone(), args.kind, trace_id)?;

    let mut last: Option<JobSnapshot> = None;
    let outcome = loop {
        let snapshot = rx.borrow_and_update().clone();
        log_transition(last.as_ref(), &snapshot);

        if snapshot.state.is_terminal() {
            break snapshot.state.clone();
        }
        if let Some(issue) = &snapshot.issue {
            if issue.kind == IssueKind::Lost {
                registry.clear(&job_id);
                metrics.log_summary();
                return Err(SyncError::ConnectionLost(issue.message.clone()).into());
            }
        }
        last = Some(snapshot);

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break rx.borrow().state.clone();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing stream");
                break rx.borrow().state.clone();
            }
        }
    };

    registry.clear(&job_id);
    metrics.log_summary();

    match outcome {
        JobState::Ready(result) => {
            let body = serde_json::to_string_pretty(&result)?;
            println!("{}", body);
            Ok(())
        }
        JobState::Failed { code, message } => Err(SyncError::JobFailed { code, message }.into()),
        _ => Ok(()),
    }
}

fn log_transition(previous: Option<&JobSnapshot>, current: &JobSnapshot) {
    let changed = |f: fn(&JobSnapshot) -> String| previous.map(f) != Some(f(current));

    if changed(|s| format!("{:?}", s.connection)) {
        tracing::info!(job_id = %current.job_id.short(), "Connection: {:?}", current.connection);
    }
    if changed(|s| format!("{:?}/{:.0}", std::mem::discriminant(&s.state), s.pct)) {
        match &current.state {
            JobState::Uploading => tracing::info!(job_id = %current.job_id.short(), "Uploading"),
            JobState::Processing { pct } => {
                tracing::info!(job_id = %current.job_id.short(), "Processing {:.0}%", pct)
            }
            JobState::Ready(_) => tracing::info!(job_id = %current.job_id.short(), "Ready"),
            JobState::Failed { code, message } => {
                tracing::warn!(job_id = %current.job_id.short(), "Failed [{}]: {}", code, message)
            }
        }
    }
    if changed(|s| format!("{:?}", s.issue.as_ref().map(|i| (i.kind, i.message.clone())))) {
        match &current.issue {
            Some(issue) => tracing::warn!(job_id = %current.job_id.short(), "{:?}: {}", issue.kind, issue.message),
            None => tracing::info!(job_id = %current.job_id.short(), "Connection healthy"),
        }
    }
}
