use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use web_history::config::{AppConfig, StreamBackend};
use web_history::diff_engine::{CheckOutcome, ContentDiffEngine};
use web_history::executor::JobExecutor;
use web_history::jobs::{
    BatchUpdateJob, PageDispatcher, Scheduler, WebsiteUpdateJob, WebsiteUpdateScheduler,
    WeeklyTrigger,
};
use web_history::models::{DEFAULT_RULE_DOMAIN, ExtractionConfig, NewTrackedPage, TrackedPage};
use web_history::repository::{Repository, SqliteRepository};
use web_history::scraper::{HttpFetcher, ReqwestFetcher};
use web_history::shutdown::ShutdownHandler;
use web_history::stream::{
    DurableStream, MemoryStream, SqliteStream, TaskRegistry, TaskSubscriber, UpdateWebsiteTask,
};
use web_history::utils::logging::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Watch tracked web pages for new entries", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker pool with the per-host scheduler and the weekly rescan
    Worker,

    /// Run the worker pool fed by the durable stream
    StreamWorker(StreamWorkerArgs),

    /// Publish every tracked page onto the stream once
    Publish,

    /// Fetch a page and print what would be tracked, without saving
    Check(UrlArgs),

    /// Start tracking a page
    Add(UrlArgs),
}

#[derive(Args, Debug)]
struct StreamWorkerArgs {
    /// Also publish every tracked page once a week from this process
    #[arg(long)]
    rescan: bool,
}

#[derive(Args, Debug)]
struct UrlArgs {
    /// Page URL
    #[arg(required = true)]
    url: String,
}

struct Services {
    config: AppConfig,
    repo: Arc<dyn Repository>,
    engine: ContentDiffEngine,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = init_tracing(&config.logging)?;

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .context("failed to install metrics exporter")?;
        info!("metrics exposed on port {}", config.metrics.port);
    }

    let services = services(config).await?;
    match cli.command {
        Commands::Worker => run_worker(services).await,
        Commands::StreamWorker(args) => run_stream_worker(services, args).await,
        Commands::Publish => publish_all(services).await,
        Commands::Check(args) => check(services, &args.url).await,
        Commands::Add(args) => add(services, &args.url).await,
    }
}

async fn services(config: AppConfig) -> Result<Services> {
    let sqlite = SqliteRepository::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    sqlite.migrate().await?;

    let repo: Arc<dyn Repository> = Arc::new(sqlite);
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(config.fetcher.clone())?);
    let engine = ContentDiffEngine::new(Arc::clone(&repo), fetcher);

    Ok(Services {
        config,
        repo,
        engine,
    })
}

async fn run_worker(services: Services) -> Result<()> {
    let Services {
        config,
        repo,
        engine,
    } = services;
    info!("starting web history worker");

    let scheduler = Arc::new(WebsiteUpdateScheduler::new(WebsiteUpdateJob::new(
        engine,
        config.scheduler.sleep_interval(),
    )));
    let weekly = Arc::new(WeeklyTrigger::new(
        BatchUpdateJob::new(repo, Arc::clone(&scheduler) as Arc<dyn PageDispatcher>),
        &config.scheduler,
    )?);

    let executor = Arc::new(JobExecutor::new(&config.executor));
    executor.register(scheduler.publisher()?)?;
    executor.register(weekly.publisher()?)?;

    scheduler.start().await?;
    weekly.start().await?;
    executor.start()?;

    // Producers stop before the executor drains
    let mut shutdown = ShutdownHandler::new();
    register_scheduler(&mut shutdown, weekly);
    register_scheduler(&mut shutdown, scheduler);
    shutdown.register("executor", move || async move { executor.stop().await });

    shutdown
        .listen(std::time::Duration::from_secs(config.shutdown_timeout))
        .await?;
    info!("web history worker stopped");
    Ok(())
}

async fn run_stream_worker(services: Services, args: StreamWorkerArgs) -> Result<()> {
    let Services {
        config,
        repo,
        engine,
    } = services;
    info!("starting web history stream worker");

    let registry = task_registry(&config, engine).await?;
    let subscriber = Arc::new(TaskSubscriber::new(registry.clone()));
    let executor = Arc::new(JobExecutor::new(&config.executor));
    executor.register(subscriber.publisher()?)?;

    let mut shutdown = ShutdownHandler::new();
    if args.rescan {
        let weekly = Arc::new(WeeklyTrigger::new(
            BatchUpdateJob::new(repo, Arc::new(registry) as Arc<dyn PageDispatcher>),
            &config.scheduler,
        )?);
        executor.register(weekly.publisher()?)?;
        weekly.start().await?;
        register_scheduler(&mut shutdown, weekly);
    }

    subscriber.start().await?;
    executor.start()?;

    register_scheduler(&mut shutdown, subscriber);
    // Queued jobs bail out early, their messages stay pending in the stream
    shutdown.register("executor", move || async move {
        executor.cancel();
        executor.stop().await
    });

    shutdown
        .listen(std::time::Duration::from_secs(config.shutdown_timeout))
        .await?;
    info!("web history stream worker stopped");
    Ok(())
}

async fn publish_all(services: Services) -> Result<()> {
    let registry = task_registry(&services.config, services.engine).await?;
    let pages = services.repo.find_websites().await?;

    let mut published = 0;
    for page in pages {
        let url = page.url.clone();
        match registry.dispatch(page).await {
            Ok(()) => published += 1,
            Err(e) => tracing::error!(url = %url, "fail to publish page: {}", e),
        }
    }

    println!("published {} pages", published);
    Ok(())
}

async fn check(services: Services, url: &str) -> Result<()> {
    let mut page = TrackedPage::new(
        NewTrackedPage {
            url: url.to_string(),
        },
        ExtractionConfig::from(&services.config.website),
    );

    match services.engine.check(&mut page).await {
        CheckOutcome::FetchFailed { message } => anyhow::bail!("could not fetch {}: {}", url, message),
        CheckOutcome::ExtractionFailed { message } => anyhow::bail!("could not extract {}: {}", url, message),
        CheckOutcome::Unchanged | CheckOutcome::Changed(_) => {}
    }

    println!("title:   {}", page.title);
    println!("host:    {}", page.host());
    for (i, entry) in page.entries().iter().enumerate() {
        println!("entry {}: {}", i + 1, entry);
    }
    Ok(())
}

async fn add(services: Services, url: &str) -> Result<()> {
    let page = services
        .engine
        .register(
            NewTrackedPage {
                url: url.to_string(),
            },
            ExtractionConfig::from(&services.config.website),
        )
        .await?;

    println!("tracking {} as {} ({})", page.url, page.id, page.title);
    Ok(())
}

async fn task_registry(config: &AppConfig, engine: ContentDiffEngine) -> Result<TaskRegistry> {
    let stream: Arc<dyn DurableStream> = match config.stream.backend {
        StreamBackend::Memory => Arc::new(MemoryStream::new(
            config.stream.claim_idle(),
            config.stream.poll_interval(),
        )),
        StreamBackend::Sqlite => Arc::new(
            SqliteStream::connect(&config.stream)
                .await
                .context("failed to open stream")?,
        ),
    };

    let mut classes = config.stream.host_classes.clone();
    if !classes.iter().any(|class| class == DEFAULT_RULE_DOMAIN) {
        classes.push(DEFAULT_RULE_DOMAIN.to_string());
    }

    let registry = TaskRegistry::new();
    for class in classes {
        registry
            .register(Arc::new(UpdateWebsiteTask::new(
                &class,
                &config.stream.consumer,
                Arc::clone(&stream),
                engine.clone(),
                config.scheduler.sleep_interval(),
            )))
            .await;
    }
    Ok(registry)
}

fn register_scheduler<S: Scheduler + 'static>(shutdown: &mut ShutdownHandler, scheduler: Arc<S>) {
    let name = scheduler.name();
    shutdown.register(name, move || async move { scheduler.stop().await });
}
