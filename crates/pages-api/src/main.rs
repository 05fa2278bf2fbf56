//! Pages build server: status callbacks plus dispatch workers.

use anyhow::Context;
use clap::Parser;
use pages_api::services::{CloudFoundryCredentials, GitHubClient, S3BucketProbe};
use pages_api::{AppState, routes};
use pages_config::{BackendKind, SystemConfig, load_system_config};
use pages_core::backend::TaskBackend;
use pages_core::source_control::SourceControl;
use pages_db::{PgBuildRepo, PgSiteRepo, create_pool, run_migrations};
use pages_executor::{DockerTaskBackend, KubernetesTaskBackend};
use pages_scheduler::{
    BuildLedger, DispatchEngine, EnvironmentAssembler, EnvironmentSettings, JobContext, JobRunner,
    PgJobQueue, ReporterSettings, StatusReporter, Worker,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pages-server")]
#[command(about = "Pages build dispatch workers and status callback server", long_about = None)]
struct Cli {
    /// Path to the KDL configuration file
    #[arg(long, env = "PAGES_CONFIG", default_value = "pages.kdl")]
    config: PathBuf,

    /// Worker loops to run; overrides the configured concurrency
    #[arg(long)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Run workers only, without the callback server
    #[arg(long)]
    no_http: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn task_backend(config: &SystemConfig) -> anyhow::Result<Arc<dyn TaskBackend>> {
    let backend: Arc<dyn TaskBackend> = match &config.backend.kind {
        BackendKind::Docker => Arc::new(DockerTaskBackend::new(config.backend.clone())?),
        BackendKind::Kubernetes { namespace } => Arc::new(
            KubernetesTaskBackend::new(namespace.clone(), config.backend.clone()).await?,
        ),
    };
    info!(backend = backend.name(), "Task backend ready");
    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_system_config(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.apply_env_overrides();

    let database_url = config
        .database_url
        .clone()
        .context("database-url is not configured and DATABASE_URL is not set")?;

    info!("Connecting to database...");
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let builds = Arc::new(PgBuildRepo::new(pool.clone()));
    let sites = Arc::new(PgSiteRepo::new(pool.clone()));
    let github: Arc<dyn SourceControl> = Arc::new(GitHubClient::new(&config.github.api_url));

    let credentials_url = config
        .storage
        .credentials_url
        .clone()
        .context("storage credentials-url is not configured")?;
    let credentials = Arc::new(CloudFoundryCredentials::new(
        credentials_url,
        config.storage.credentials_token.clone().unwrap_or_default(),
    ));
    let storage = Arc::new(S3BucketProbe::new(config.storage.endpoint.clone()));

    let reporter = StatusReporter::new(
        github.clone(),
        ReporterSettings {
            app_url: config.app_url.clone(),
            proxy_domain: config.proxy_domain.clone(),
            context: config.github.status_context.clone(),
        },
    );
    let ledger = Arc::new(
        BuildLedger::new(builds.clone(), sites.clone()).with_reporter(Arc::new(reporter)),
    );
    let assembler = EnvironmentAssembler::new(
        builds.clone(),
        credentials,
        storage,
        EnvironmentSettings {
            app_url: config.app_url.clone(),
            provisioning_timeout: config.worker.provisioning_timeout,
        },
    );

    let context = JobContext {
        builds: builds.clone(),
        sites,
        source_control: github,
        assembler: Arc::new(assembler),
        ledger: ledger.clone(),
        site_build_policy: config.worker.site_build,
        build_task_policy: config.worker.build_task,
    };
    let runner = Arc::new(JobRunner::new(
        DispatchEngine::new(task_backend(&config).await?),
        context,
    ));
    let queue = Arc::new(PgJobQueue::new(pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let concurrency = cli.workers.unwrap_or(config.worker.concurrency).max(1);
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "pages".to_string());
    let workers: Vec<_> = (0..concurrency)
        .map(|i| {
            let worker = Worker::new(
                format!("{}-{}", hostname, i),
                queue.clone(),
                runner.clone(),
                config.worker.idle_delay,
            );
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect();
    info!(workers = concurrency, "Workers started");

    if cli.no_http {
        tokio::signal::ctrl_c().await?;
    } else {
        let state = AppState::new(builds, ledger);
        let app = routes::router(state).layer(TraceLayer::new_for_http());

        let addr: SocketAddr = config
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address {}", config.listen))?;
        info!("Starting server on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    }

    info!("Shutting down workers");
    shutdown_tx.send(true)?;
    for worker in workers {
        worker.await?;
    }

    Ok(())
}
