use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use agentbus_agents::{
    AgentRegistry, DefaultClassifier, HttpLlmClient, HttpLlmConfig, NoopMemory, NoopSkills,
};
use agentbus_core::{EngineConfig, Orchestrator, WorkerClients, WorkerPool};
use agentbus_events::{EventBus, EventBusConfig, EventFilter};
use agentbus_queue::TaskQueue;
use agentbus_server::{app_router, AppState};
use agentbus_store::JobStore;
use agentbus_types::{ArtifactType, EventType};

#[derive(Parser, Debug)]
#[command(name = "agentbus-engine")]
#[command(about = "Headless Agent Bus pipeline service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API, orchestrator, and worker pool
    Serve {
        /// Override the configured bind address (host:port)
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Drive one requirement through the whole pipeline, auto-approving
    /// the PRD gate, and print the delivery summary
    Run {
        requirements: String,
        #[arg(long, default_value = "cli")]
        project_id: String,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            bind,
            state_dir,
            config,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (state, _pool) = build_state(&state_dir, config.as_deref()).await?;
            let addr: SocketAddr = bind
                .unwrap_or_else(|| state.orchestrator.config().http.bind_addr.clone())
                .parse()
                .context("invalid bind address")?;
            log_startup(&state_dir, &addr);

            let router = app_router(state)
                .layer(CorsLayer::permissive())
                .layer(TraceLayer::new_for_http());
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
        }
        Command::Run {
            requirements,
            project_id,
            state_dir,
            config,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (state, pool) = build_state(&state_dir, config.as_deref()).await?;
            let delivery = run_oneshot(&state, &project_id, &requirements).await?;
            println!("{delivery}");
            pool.shutdown().await;
        }
    }
    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("AGENTBUS_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".agentbus")
}

fn log_startup(state_dir: &PathBuf, addr: &SocketAddr) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting agentbus-engine on http://{addr}");
    info!(
        "startup paths: cwd={} state_dir={}",
        cwd.display(),
        state_dir.display()
    );
}

async fn build_state(
    state_dir: &PathBuf,
    config_path: Option<&str>,
) -> anyhow::Result<(AppState, WorkerPool)> {
    std::fs::create_dir_all(state_dir).context("failed to create state dir")?;
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"));
    let config = EngineConfig::load(Some(config_path.as_path()))
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let store = Arc::new(
        JobStore::open(&state_dir.join("agentbus.db"))
            .await
            .context("opening job store")?,
    );
    let queue = Arc::new(TaskQueue::new(Duration::from_millis(
        config.queue.visibility_timeout_ms,
    )));
    let events = EventBus::new(EventBusConfig {
        per_job: config.events.ring_buffer.per_job,
        global: config.events.ring_buffer.global,
        subscriber_buffer: config.events.ring_buffer.subscriber_buffer,
    });

    let llm_config = config.llm.clone().unwrap_or_else(HttpLlmConfig::default);
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        queue.clone(),
        events,
        config.clone(),
        Arc::new(DefaultClassifier),
    ));
    let pool = WorkerPool::spawn(
        orchestrator.clone(),
        AgentRegistry::default_pipeline(),
        WorkerClients {
            llm: Arc::new(HttpLlmClient::new(llm_config)),
            memory: Arc::new(NoopMemory),
            skills: Arc::new(NoopSkills),
        },
    );

    // Redelivery sweep so expired visibility windows and delayed nacks do
    // not wait for the next dequeue
    let sweep_queue = queue.clone();
    let sweep_every = Duration::from_millis((config.queue.visibility_timeout_ms / 4).max(1_000));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            sweep_queue.redeliver_expired();
        }
    });

    Ok((AppState { orchestrator }, pool))
}

/// Create a job, auto-approve the PRD gate, and wait for delivery.
async fn run_oneshot(
    state: &AppState,
    project_id: &str,
    requirements: &str,
) -> anyhow::Result<String> {
    let orchestrator = &state.orchestrator;
    let job = orchestrator
        .create_job(project_id, requirements, serde_json::json!({}))
        .await
        .map_err(|e| anyhow::anyhow!("create failed: {e}"))?;
    let mut subscription = orchestrator
        .events()
        .subscribe(EventFilter::for_job(&job.job_id));
    orchestrator
        .start_job(&job.job_id)
        .await
        .map_err(|e| anyhow::anyhow!("start failed: {e}"))?;
    info!(job_id = %job.job_id, "pipeline started");

    loop {
        let Some(event) = subscription.next().await else {
            anyhow::bail!("event stream closed before the job finished");
        };
        match event.event_type {
            EventType::HitlRequested => {
                info!(job_id = %job.job_id, "auto-approving PRD gate");
                orchestrator
                    .approve(&job.job_id, Some("auto-approved by agentbus-engine run"))
                    .await
                    .map_err(|e| anyhow::anyhow!("approve failed: {e}"))?;
            }
            EventType::JobCompleted => break,
            EventType::JobFailed => {
                let job = orchestrator
                    .store()
                    .get_job(&job.job_id)
                    .await
                    .map_err(|e| anyhow::anyhow!("job lookup failed: {e}"))?;
                anyhow::bail!(
                    "job failed: {}",
                    job.failure_reason.unwrap_or_else(|| "unknown".to_string())
                );
            }
            _ => {}
        }
    }

    let delivery = orchestrator
        .store()
        .get_latest_artifact(&job.job_id, ArtifactType::Delivery)
        .await
        .map_err(|e| anyhow::anyhow!("artifact fetch failed: {e}"))?
        .context("job completed without a delivery artifact")?;
    Ok(delivery.content)
}
