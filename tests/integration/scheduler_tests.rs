use super::*;
use web_history::jobs::{
    BatchUpdateJob, PageDispatcher, Scheduler, WebsiteUpdateJob, WebsiteUpdateScheduler, WeeklyTrigger,
};
use web_history::models::{ExtractionRule, NewTrackedPage};
use web_history::AppError;

#[tokio::test]
async fn test_worker_updates_deployed_pages() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/a", page_body("Page A", &["2024-03-01", "2024-02-01"])).await;
    mount_page(&server, "/b", page_body("Page B", &["2024-01-15"])).await;

    let a = tracked(format!("{}/a", server.uri()));
    let b = tracked(format!("{}/b", server.uri()));
    let repo = memory_repo(&[a.clone(), b.clone()]);

    let scheduler = Arc::new(WebsiteUpdateScheduler::new(WebsiteUpdateJob::new(
        engine(repo.clone())?,
        Duration::ZERO,
    )));
    let executor = executor(2);
    executor.register(scheduler.publisher()?)?;
    scheduler.start().await?;
    executor.start()?;

    scheduler.deploy_job(a.clone())?;
    scheduler.deploy_job(b.clone())?;

    let updated = eventually(|| {
        let repo = repo.clone();
        let (a, b) = (a.id.clone(), b.id.clone());
        async move {
            !stored_entries(&*repo, &a).await.is_empty() && !stored_entries(&*repo, &b).await.is_empty()
        }
    })
    .await;
    assert!(updated, "pages were never updated");

    scheduler.stop().await?;
    executor.stop().await?;

    let stored_a = repo.find_website(&a.id).await?;
    assert_eq!(stored_a.title, "Page A");
    assert_eq!(stored_a.entries(), vec!["2024-03-01", "2024-02-01"]);
    assert_eq!(stored_entries(&*repo, &b.id).await, vec!["2024-01-15"]);

    assert!(matches!(scheduler.deploy_job(a), Err(AppError::SchedulerStopped)));
    Ok(())
}

#[tokio::test]
async fn test_weekly_rescan_runs_at_start() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pages: Vec<TrackedPage> = (0..3)
        .map(|i| tracked(format!("{}/chapter/{}", server.uri(), i)))
        .collect();
    for i in 0..3 {
        mount_page(
            &server,
            &format!("/chapter/{}", i),
            page_body(&format!("Chapter {}", i), &["2024-02-29"]),
        )
        .await;
    }
    let repo = memory_repo(&pages);

    let scheduler = Arc::new(WebsiteUpdateScheduler::new(WebsiteUpdateJob::new(
        engine(repo.clone())?,
        Duration::ZERO,
    )));
    let weekly = Arc::new(WeeklyTrigger::new(
        BatchUpdateJob::new(repo.clone(), scheduler.clone() as Arc<dyn PageDispatcher>),
        &scheduler_config(true),
    )?);

    let executor = executor(3);
    executor.register(scheduler.publisher()?)?;
    executor.register(weekly.publisher()?)?;
    scheduler.start().await?;
    weekly.start().await?;
    executor.start()?;

    let updated = eventually(|| {
        let repo = repo.clone();
        async move {
            match repo.find_websites().await {
                Ok(pages) => pages.iter().all(|page| page.entries() == vec!["2024-02-29"]),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(updated, "weekly rescan did not cover every page");

    weekly.stop().await?;
    scheduler.stop().await?;
    executor.stop().await?;

    let titles: Vec<String> = repo.find_websites().await?.into_iter().map(|p| p.title).collect();
    assert_eq!(titles.len(), 3);
    assert!(titles.iter().all(|title| title.starts_with("Chapter ")));
    Ok(())
}

#[tokio::test]
async fn test_weekly_rescan_waits_when_not_at_beginning() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/quiet", page_body("Quiet", &["2024-01-01"])).await;
    let page = tracked(format!("{}/quiet", server.uri()));
    let repo = memory_repo(std::slice::from_ref(&page));

    let scheduler = Arc::new(WebsiteUpdateScheduler::new(WebsiteUpdateJob::new(
        engine(repo.clone())?,
        Duration::ZERO,
    )));
    let weekly = Arc::new(WeeklyTrigger::new(
        BatchUpdateJob::new(repo.clone(), scheduler.clone() as Arc<dyn PageDispatcher>),
        &scheduler_config(false),
    )?);

    let executor = executor(1);
    executor.register(scheduler.publisher()?)?;
    executor.register(weekly.publisher()?)?;
    scheduler.start().await?;
    weekly.start().await?;
    executor.start()?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    weekly.stop().await?;
    scheduler.stop().await?;
    executor.stop().await?;

    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    assert!(stored_entries(&*repo, &page.id).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fetcher_retries_then_reports_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(fetcher_config(2))?;
    let result = fetcher.get(&format!("{}/down", server.uri())).await;

    assert!(matches!(result, Err(AppError::Fetch { .. })));
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_register_uses_stored_host_rule() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let body = "<html><head><title>Site title</title></head><body>\
                <h1 class=\"name\">Serial</h1>\
                <div class=\"chapter\">Chapter 12</div><div class=\"chapter\">Chapter 11</div>\
                <p>2024-03-01</p></body></html>";
    mount_page(&server, "/serial", body.to_string()).await;

    let repo = sqlite_repo().await?;
    repo.upsert_website_setting(&ExtractionRule {
        domain: "127.0.0.1".to_string(),
        title_selector: Some("h1.name".to_string()),
        entry_selector: Some("div.chapter".to_string()),
        ..Default::default()
    })
    .await?;

    let engine = engine(repo.clone())?;
    let page = engine
        .register(
            NewTrackedPage {
                url: format!("{}/serial", server.uri()),
            },
            ExtractionConfig::default(),
        )
        .await?;

    let stored = repo.find_website(&page.id).await?;
    assert_eq!(stored.title, "Serial");
    assert_eq!(stored.entries(), vec!["Chapter 12", "Chapter 11"]);
    Ok(())
}

#[tokio::test]
async fn test_register_keeps_unreachable_page() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_status(&server, "/gone", 404).await;

    let repo = sqlite_repo().await?;
    let engine = engine(repo.clone())?;
    let page = engine
        .register(
            NewTrackedPage {
                url: format!("{}/gone", server.uri()),
            },
            ExtractionConfig::default(),
        )
        .await?;

    let stored = repo.find_website(&page.id).await?;
    assert_eq!(stored.title, web_history::models::UNKNOWN_TITLE);
    assert!(stored.entries().is_empty());
    Ok(())
}
