//! End-to-end tests for the download pipeline and scheduler: discovery,
//! embedded resources, politeness, cancellation, and hibernation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crystal_core::model::GroupSource;
use crystal_core::project::{OpenOptions, Project};
use crystal_core::scheduler::{
    DownloadPriority, Scheduler, SchedulerConfig, TaskId, TaskKind, TaskListener, TaskState,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A scheduler config with pacing disabled, for fast tests.
fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        politeness_delay: Duration::ZERO,
        min_fetch_interval: Duration::ZERO,
        ..SchedulerConfig::default()
    }
}

async fn fresh_project(temp: &TempDir) -> Project {
    Project::create(temp.path().join("test.crystalproj"), OpenOptions::default())
        .await
        .unwrap()
}

async fn serve_html(server: &MockServer, at: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html; charset=utf-8")
                .set_body_string(body.to_string()),
        )
        .mount(server)
        .await;
}

async fn serve_png(server: &MockServer, at: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "image/png")
                .set_body_bytes(b"\x89PNG fake".to_vec()),
        )
        .mount(server)
        .await;
}

#[derive(Default)]
struct RecordingListener {
    states: Mutex<Vec<(TaskId, TaskState)>>,
    added: Mutex<Vec<(TaskId, String)>>,
}

impl TaskListener for RecordingListener {
    fn on_task_added(&self, _parent_id: TaskId, task_id: TaskId, kind: &TaskKind, _title: &str) {
        self.added
            .lock()
            .unwrap()
            .push((task_id, kind.label().to_string()));
    }

    fn on_task_state(&self, task_id: TaskId, state: TaskState, _error: Option<&str>) {
        self.states.lock().unwrap().push((task_id, state));
    }
}

#[tokio::test]
async fn test_download_resource_persists_revision_and_embeds() {
    let server = MockServer::start().await;
    serve_html(
        &server,
        "/page",
        r#"<html><img src="/logo.png"><a href="/other">other</a></html>"#,
    )
    .await;
    serve_png(&server, "/logo.png").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let page = project
        .get_or_create_resource(&format!("{}/page", server.uri()))
        .await
        .unwrap();
    let revision = scheduler
        .download_resource(page.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(revision.status_code(), Some(200));
    scheduler.wait_idle().await.unwrap();

    // The embedded image was fetched; the navigational link was only
    // discovered
    let logo = project
        .get_resource_by_url(&format!("{}/logo.png", server.uri()))
        .await
        .unwrap()
        .expect("embedded resource should be discovered");
    assert!(project
        .default_revision(logo.id)
        .await
        .unwrap()
        .is_some());

    let other = project
        .get_resource_by_url(&format!("{}/other", server.uri()))
        .await
        .unwrap()
        .expect("navigational link should be discovered");
    assert!(project.default_revision(other.id).await.unwrap().is_none());

    let body = project.read_revision_body(&revision).await.unwrap();
    assert!(body.starts_with(b"<html>"));

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_second_download_same_session_is_cache_hit() {
    let server = MockServer::start().await;
    serve_html(&server, "/cached", "<html>cached</html>").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let resource = project
        .get_or_create_resource(&format!("{}/cached", server.uri()))
        .await
        .unwrap();
    let first = scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    let second = scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    assert_eq!(first.id, second.id, "same-session re-download should hit cache");
    assert_eq!(project.revision_count().await.unwrap(), 1);

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_stale_before_forces_redownload_and_moves_default_revision() {
    let server = MockServer::start().await;
    serve_html(&server, "/fresh", "<html>fresh</html>").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let resource = project
        .get_or_create_resource(&format!("{}/fresh", server.uri()))
        .await
        .unwrap();
    let first = scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();

    // Anything downloaded before this instant is stale
    let threshold = chrono::Utc::now() + chrono::Duration::seconds(1);
    let second = scheduler
        .download_resource_with(resource.id, DownloadPriority::Interactive, Some(threshold))
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    assert!(second.id > first.id);
    let default = project
        .default_revision(resource.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(default.id, second.id);

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_self_embedded_page_does_not_recurse() {
    let server = MockServer::start().await;
    serve_html(&server, "/mirror", r#"<html><img src="/mirror"></html>"#).await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());
    let listener = Arc::new(RecordingListener::default());
    scheduler.add_listener(listener.clone()).unwrap();

    let resource = project
        .get_or_create_resource(&format!("{}/mirror", server.uri()))
        .await
        .unwrap();
    scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    assert_eq!(
        project.revision_count().await.unwrap(),
        1,
        "exactly one revision despite the self-embed"
    );
    let download_tasks = listener
        .added
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, label)| label == "download_resource")
        .count();
    assert_eq!(download_tasks, 1, "the page must not schedule itself");

    // State transitions are monotonic: nothing runs again after reaching a
    // terminal state
    let states = listener.states.lock().unwrap();
    for (task_id, _) in states.iter() {
        let sequence: Vec<TaskState> = states
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, state)| *state)
            .collect();
        if let Some(terminal_at) = sequence.iter().position(|s| s.is_terminal()) {
            assert_eq!(
                terminal_at,
                sequence.len() - 1,
                "task {task_id} changed state after terminal: {sequence:?}"
            );
        }
    }
    drop(states);

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_error_page_embeds_suppressed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("Content-Type", "text/html")
                .set_body_string(r#"<html><img src="/sad.png">gone</html>"#),
        )
        .mount(&server)
        .await;
    serve_png(&server, "/sad.png").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let resource = project
        .get_or_create_resource(&format!("{}/gone", server.uri()))
        .await
        .unwrap();
    let revision = scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    assert_eq!(revision.status_code(), Some(404));
    // The 404 page itself is archived, but its embeds are not fetched
    let image = project
        .get_resource_by_url(&format!("{}/sad.png", server.uri()))
        .await
        .unwrap();
    if let Some(image) = image {
        assert!(project.default_revision(image.id).await.unwrap().is_none());
    }

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_do_not_download_group_blocks_embeds() {
    let server = MockServer::start().await;
    serve_html(&server, "/article", r#"<html><img src="/ads/banner.png"></html>"#).await;
    serve_png(&server, "/ads/banner.png").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    project
        .create_resource_group(
            "Ads",
            &format!("{}/ads/**", server.uri()),
            GroupSource::None,
            true,
        )
        .await
        .unwrap();
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let resource = project
        .get_or_create_resource(&format!("{}/article", server.uri()))
        .await
        .unwrap();
    scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    let banner = project
        .get_resource_by_url(&format!("{}/ads/banner.png", server.uri()))
        .await
        .unwrap()
        .expect("banner is still discovered as a resource");
    assert!(
        project.default_revision(banner.id).await.unwrap().is_none(),
        "do-not-download member must not be fetched"
    );

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_external_alias_excludes_url_from_archive() {
    let server = MockServer::start().await;
    serve_html(
        &server,
        "/page",
        r#"<html><img src="https://tracker.example/pixel.png"></html>"#,
    )
    .await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    project
        .create_alias("https://tracker.example/", "https://tracker.example/", true)
        .await
        .unwrap();
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let resource = project
        .get_or_create_resource(&format!("{}/page", server.uri()))
        .await
        .unwrap();
    scheduler
        .download_resource(resource.id, DownloadPriority::Interactive)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();

    // Neither the original nor the wrapped URL is persisted: the only
    // stored resource is the page itself
    assert_eq!(project.resource_count().await.unwrap(), 1);
    let pixel = project
        .get_resource_by_url("https://tracker.example/pixel.png")
        .await
        .unwrap()
        .expect("external URL resolves to an in-memory resource");
    assert!(pixel.id.is_unsaved());
    assert!(pixel.is_external());

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_group_download_discovers_and_fetches_members() {
    let server = MockServer::start().await;
    // Comic 1 links to comic 2; the group pattern matches both
    serve_html(&server, "/1/", r#"<html><a href="/2/">next</a>first</html>"#).await;
    serve_html(&server, "/2/", "<html>second</html>").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let scheduler = Scheduler::spawn(project.clone(), fast_config());

    let first = project
        .get_or_create_resource(&format!("{}/1/", server.uri()))
        .await
        .unwrap();
    let root = project
        .create_root_resource("First Comic", first.id)
        .await
        .unwrap();
    let group = project
        .create_resource_group(
            "Comics",
            &format!("{}/#/", server.uri()),
            GroupSource::Root(root.id),
            false,
        )
        .await
        .unwrap();

    scheduler.download_group(group.id).await.unwrap();
    scheduler.wait_idle().await.unwrap();

    // Membership now includes both comics, and both are archived
    let members = project
        .group_members(&group)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let member_urls: Vec<&str> = members.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        member_urls,
        [
            format!("{}/1/", server.uri()).as_str(),
            format!("{}/2/", server.uri()).as_str(),
        ]
    );
    for member in &members {
        assert!(
            project.default_revision(member.id).await.unwrap().is_some(),
            "member {} should be archived",
            member.url
        );
    }
    assert!(project.revision_count().await.unwrap() >= 2);

    scheduler.shutdown().await.unwrap();

    // Reopen: same entities, same revisions
    let path = project.path().to_path_buf();
    project.close().await;
    let project = Project::open(&path, OpenOptions::default()).await.unwrap();
    assert_eq!(project.root_resources().await.unwrap().len(), 1);
    assert!(project.revision_count().await.unwrap() >= 2);
    project.close().await;
}

#[tokio::test]
async fn test_politeness_spaces_out_page_downloads() {
    let server = MockServer::start().await;
    for index in 1..=3 {
        serve_html(&server, &format!("/p{index}"), "<html>page</html>").await;
    }

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let delay = Duration::from_millis(400);
    let scheduler = Scheduler::spawn(
        project.clone(),
        SchedulerConfig {
            politeness_delay: delay,
            min_fetch_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        },
    );

    let mut handles = Vec::new();
    for index in 1..=3 {
        let resource = project
            .get_or_create_resource(&format!("{}/p{index}", server.uri()))
            .await
            .unwrap();
        handles.push(
            scheduler
                .download_resource(resource.id, DownloadPriority::Background)
                .unwrap(),
        );
    }

    let started = std::time::Instant::now();
    for handle in handles {
        handle.await.unwrap();
    }
    scheduler.wait_idle().await.unwrap();
    let elapsed = started.elapsed();

    // Three pages, two inter-page delays
    assert!(
        elapsed >= delay * 2,
        "pages completed too quickly: {elapsed:?}"
    );

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_embeds_within_a_page_incur_no_politeness_delay() {
    let server = MockServer::start().await;
    serve_html(
        &server,
        "/gallery",
        r#"<html><img src="/a.png"><img src="/b.png"><img src="/c.png"></html>"#,
    )
    .await;
    for name in ["a", "b", "c"] {
        serve_png(&server, &format!("/{name}.png")).await;
    }

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let delay = Duration::from_millis(800);
    let scheduler = Scheduler::spawn(
        project.clone(),
        SchedulerConfig {
            politeness_delay: delay,
            min_fetch_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        },
    );

    let resource = project
        .get_or_create_resource(&format!("{}/gallery", server.uri()))
        .await
        .unwrap();
    let started = std::time::Instant::now();
    scheduler
        .download_resource(resource.id, DownloadPriority::Background)
        .unwrap()
        .await
        .unwrap();
    scheduler.wait_idle().await.unwrap();
    let elapsed = started.elapsed();

    // One page and three embeds: the politeness delay applies between
    // pages, never inside one
    assert!(
        elapsed < delay,
        "embeds must not consume politeness slots: {elapsed:?}"
    );
    assert_eq!(project.revision_count().await.unwrap(), 4);

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_cancel_group_keeps_completed_revisions() {
    let server = MockServer::start().await;
    serve_html(&server, "/1/", "<html>one</html>").await;
    // Member 2 is slow enough to still be pending when the cancel lands
    Mock::given(method("GET"))
        .and(path("/2/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string("<html>two</html>")
                .set_delay(Duration::from_secs(20)),
        )
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    for index in 1..=2 {
        project
            .get_or_create_resource(&format!("{}/{index}/", server.uri()))
            .await
            .unwrap();
    }
    let group = project
        .create_resource_group(
            "Pages",
            &format!("{}/#/", server.uri()),
            GroupSource::None,
            false,
        )
        .await
        .unwrap();

    let scheduler = Scheduler::spawn(project.clone(), fast_config());
    let group_task = scheduler.download_group(group.id).await.unwrap();

    // Let the first member land, then cancel the rest
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.cancel(group_task).unwrap();
    scheduler.wait_idle().await.unwrap();

    let one = project
        .get_resource_by_url(&format!("{}/1/", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert!(
        project.default_revision(one.id).await.unwrap().is_some(),
        "completed revision must persist across a cancel"
    );

    scheduler.shutdown().await.unwrap();
    project.close().await;
}

#[tokio::test]
async fn test_hibernated_tasks_reappear_exactly_once() {
    let server = MockServer::start().await;
    serve_html(&server, "/first", "<html>first</html>").await;
    serve_html(&server, "/second", "<html>second</html>").await;

    let temp = TempDir::new().unwrap();
    let project = fresh_project(&temp).await;
    let first = project
        .get_or_create_resource(&format!("{}/first", server.uri()))
        .await
        .unwrap();
    let second = project
        .get_or_create_resource(&format!("{}/second", server.uri()))
        .await
        .unwrap();

    // The first page completes and arms a huge politeness gate; the second
    // is still queued when the scheduler shuts down
    let scheduler = Scheduler::spawn(
        project.clone(),
        SchedulerConfig {
            politeness_delay: Duration::from_secs(600),
            min_fetch_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        },
    );
    let first_handle = scheduler
        .download_resource(first.id, DownloadPriority::Background)
        .unwrap();
    let _second_handle = scheduler
        .download_resource(second.id, DownloadPriority::Background)
        .unwrap();
    first_handle.await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.shutdown().await.unwrap();

    let hibernated = project
        .get_property("hibernated_tasks")
        .await
        .unwrap()
        .expect("the queued page should hibernate");
    assert!(hibernated.contains("download_resource"));

    // A fresh scheduler resumes the record, exactly once
    let scheduler = Scheduler::spawn(project.clone(), fast_config());
    scheduler.wait_idle().await.unwrap();
    assert!(
        project
            .get_property("hibernated_tasks")
            .await
            .unwrap()
            .is_none(),
        "hibernation record must be consumed"
    );
    assert!(
        project.default_revision(second.id).await.unwrap().is_some(),
        "resumed task should complete the download"
    );

    scheduler.shutdown().await.unwrap();
    project.close().await;
}
