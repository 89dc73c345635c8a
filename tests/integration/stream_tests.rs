use super::*;
use tempfile::TempDir;
use web_history::config::{StreamBackend, StreamConfig};
use web_history::jobs::{PageDispatcher, Scheduler};
use web_history::stream::{
    DurableStream, MemoryStream, SqliteStream, TaskRegistry, TaskSubscriber, UpdateWebsiteTask,
};

const CONSUMER: &str = "worker-1";

fn stream_config(dir: &TempDir) -> StreamConfig {
    StreamConfig {
        backend: StreamBackend::Sqlite,
        url: format!("sqlite://{}", dir.path().join("stream.db").display()),
        consumer: CONSUMER.to_string(),
        host_classes: vec!["default".to_string()],
        claim_idle_ms: 300_000,
        poll_interval_ms: 20,
    }
}

async fn registry(
    stream: Arc<dyn DurableStream>,
    engine: ContentDiffEngine,
    classes: &[&str],
) -> TaskRegistry {
    let registry = TaskRegistry::new();
    for class in classes {
        registry
            .register(Arc::new(UpdateWebsiteTask::new(
                class,
                CONSUMER,
                Arc::clone(&stream),
                engine.clone(),
                Duration::ZERO,
            )))
            .await;
    }
    registry
}

struct StreamWorker {
    subscriber: Arc<TaskSubscriber>,
    executor: Arc<JobExecutor>,
}

impl StreamWorker {
    async fn start(registry: TaskRegistry, workers: usize) -> anyhow::Result<Self> {
        let subscriber = Arc::new(TaskSubscriber::new(registry));
        let executor = executor(workers);
        executor.register(subscriber.publisher()?)?;
        subscriber.start().await?;
        executor.start()?;
        Ok(Self { subscriber, executor })
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.subscriber.stop().await?;
        self.executor.cancel();
        self.executor.stop().await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_published_pages_are_updated_and_acknowledged() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/one", page_body("One", &["2024-03-03", "2024-03-02"])).await;
    mount_page(&server, "/two", page_body("Two", &["2024-01-01"])).await;

    let one = tracked(format!("{}/one", server.uri()));
    let two = tracked(format!("{}/two", server.uri()));
    let repo = memory_repo(&[one.clone(), two.clone()]);

    let stream = Arc::new(MemoryStream::new(Duration::from_secs(300), Duration::from_millis(20)));
    let registry = registry(stream.clone(), engine(repo.clone())?, &["default"]).await;
    let worker = StreamWorker::start(registry.clone(), 2).await?;

    registry.dispatch(one.clone()).await?;
    registry.dispatch(two.clone()).await?;

    let updated = eventually(|| {
        let repo = repo.clone();
        let (one, two) = (one.id.clone(), two.id.clone());
        async move {
            stored_entries(&*repo, &one).await.len() == 2 && stored_entries(&*repo, &two).await.len() == 1
        }
    })
    .await;
    assert!(updated, "stream messages were never handled");

    let task = registry.route(&one).await?;
    let group = web_history::stream::ConsumerGroup {
        stream: "web_history:default".to_string(),
        group: "web_history_workers".to_string(),
        consumer: CONSUMER.to_string(),
    };
    assert_eq!(task.name(), "default");
    assert!(eventually(|| {
        let stream = stream.clone();
        let group = group.clone();
        async move { stream.pending_count(&group) == 0 }
    })
    .await);

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_pages_route_to_their_host_class() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/local", page_body("Local", &["2023-12-24"])).await;

    let page = tracked(format!("{}/local", server.uri()));
    let repo = memory_repo(std::slice::from_ref(&page));
    let stream = Arc::new(MemoryStream::new(Duration::from_secs(300), Duration::from_millis(20)));
    let registry = registry(stream.clone(), engine(repo.clone())?, &["default", "127.0.0.1"]).await;

    assert_eq!(registry.route(&page).await?.name(), "127.0.0.1");

    let worker = StreamWorker::start(registry.clone(), 1).await?;
    registry.dispatch(page.clone()).await?;

    let updated = eventually(|| {
        let repo = repo.clone();
        let id = page.id.clone();
        async move { stored_entries(&*repo, &id).await == vec!["2023-12-24"] }
    })
    .await;
    assert!(updated);
    worker.stop().await?;

    // Nothing was published for the default class
    let default_group = web_history::stream::ConsumerGroup {
        stream: "web_history:default".to_string(),
        group: "web_history_workers".to_string(),
        consumer: CONSUMER.to_string(),
    };
    stream.ensure_group(&default_group).await?;
    assert!(stream.read_next(&default_group).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_failed_message_is_redelivered_after_restart() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    mount_status(&server, "/flaky", 500).await;

    let page = tracked(format!("{}/flaky", server.uri()));
    let repo = memory_repo(std::slice::from_ref(&page));

    // First run: the fetch fails, so the message is never acknowledged
    {
        let stream: Arc<dyn DurableStream> = Arc::new(SqliteStream::connect(&stream_config(&dir)).await?);
        let registry = registry(stream, engine(repo.clone())?, &["default"]).await;
        let worker = StreamWorker::start(registry.clone(), 1).await?;
        registry.dispatch(page.clone()).await?;

        let attempted = eventually(|| {
            let server = &server;
            async move {
                server
                    .received_requests()
                    .await
                    .map(|requests| !requests.is_empty())
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(attempted, "first worker never fetched the page");

        // Let the failed job finish before shutting down
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await?;
    }
    assert!(stored_entries(&*repo, &page.id).await.is_empty());

    server.reset().await;
    mount_page(&server, "/flaky", page_body("Flaky", &["2024-02-02"])).await;

    // Second run on the same stream file picks the pending message up again
    let stream: Arc<dyn DurableStream> = Arc::new(SqliteStream::connect(&stream_config(&dir)).await?);
    let registry = registry(stream, engine(repo.clone())?, &["default"]).await;
    let worker = StreamWorker::start(registry, 1).await?;

    let updated = eventually(|| {
        let repo = repo.clone();
        let id = page.id.clone();
        async move { stored_entries(&*repo, &id).await == vec!["2024-02-02"] }
    })
    .await;
    assert!(updated, "pending message was not redelivered");

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_message_is_retried_by_the_same_worker() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/retry"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, "/retry", page_body("Retry", &["2024-05-05"])).await;

    let page = tracked(format!("{}/retry", server.uri()));
    let repo = memory_repo(std::slice::from_ref(&page));
    let stream = Arc::new(MemoryStream::new(Duration::from_millis(50), Duration::from_millis(20)));
    let registry = registry(stream.clone(), engine(repo.clone())?, &["default"]).await;
    let worker = StreamWorker::start(registry.clone(), 1).await?;

    registry.dispatch(page.clone()).await?;

    let updated = eventually(|| {
        let repo = repo.clone();
        let id = page.id.clone();
        async move { stored_entries(&*repo, &id).await == vec!["2024-05-05"] }
    })
    .await;
    assert!(updated, "failed message was never retried");
    assert!(server.received_requests().await.unwrap_or_default().len() >= 2);

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_undecodable_message_is_dropped() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/after", page_body("After", &["2024-04-01"])).await;

    let page = tracked(format!("{}/after", server.uri()));
    let repo = memory_repo(std::slice::from_ref(&page));
    let stream = Arc::new(MemoryStream::new(Duration::from_secs(300), Duration::from_millis(20)));
    let registry = registry(stream.clone(), engine(repo.clone())?, &["default"]).await;

    stream
        .publish(
            "web_history:default",
            std::collections::HashMap::from([
                ("task_name".to_string(), "default".to_string()),
                ("web".to_string(), "not json".to_string()),
            ]),
        )
        .await?;
    registry.dispatch(page.clone()).await?;

    let worker = StreamWorker::start(registry, 1).await?;
    let updated = eventually(|| {
        let repo = repo.clone();
        let id = page.id.clone();
        async move { stored_entries(&*repo, &id).await == vec!["2024-04-01"] }
    })
    .await;
    assert!(updated, "valid message behind a broken one was not handled");

    let group = web_history::stream::ConsumerGroup {
        stream: "web_history:default".to_string(),
        group: "web_history_workers".to_string(),
        consumer: CONSUMER.to_string(),
    };
    assert!(eventually(|| {
        let stream = stream.clone();
        let group = group.clone();
        async move { stream.pending_count(&group) == 0 }
    })
    .await);

    worker.stop().await?;
    Ok(())
}
