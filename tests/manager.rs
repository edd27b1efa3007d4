mod common;
use common::{test_settings, FakeConnector, FakeShell, RecordingEcho, ENV_LOCK};

use std::sync::Arc;
use swarmlink::errors::{Error, ErrorKind};
use swarmlink::managers::swarm::SwarmManager;
use swarmlink::services::engine::ObjectApi;
use swarmlink::services::inventory::{HostRecord, StaticInventory};

fn host(id: &str) -> HostRecord {
    HostRecord::new(id, format!("{}.example.com", id)).with_stack("prod")
}

fn manager() -> (SwarmManager, Arc<FakeShell>, Arc<FakeConnector>) {
    let settings = test_settings();
    let shell = FakeShell::new(&settings);
    let connector = FakeConnector::new(shell.clone());
    let manager = SwarmManager::new(
        connector.clone(),
        Arc::new(settings),
        Arc::new(RecordingEcho::default()),
    );
    (manager, shell, connector)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acquire_opens_tunnel_and_release_tears_down() {
    let (manager, shell, connector) = manager();
    let handle = manager.acquire(host("m1")).await.expect("acquire");

    assert_eq!(connector.connects(), 1);
    assert!(handle.tunnel_status().listening);
    let path = handle
        .endpoint()
        .unix_path()
        .expect("unix endpoint")
        .to_path_buf();
    assert!(path.exists());
    let (name, value) = handle.command_env();
    assert_eq!(name, "DOCKER_HOST");
    assert_eq!(value, format!("unix://{}", path.display()));
    assert_eq!(handle.executor().execute("true", false).expect("run"), 0);

    handle.release().await;
    assert!(handle.is_released());
    assert!(!path.exists());
    assert_eq!(shell.disconnects(), 1);
    assert!(!manager.registry().is_active("m1"));

    handle.release().await;
    assert_eq!(shell.disconnects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_active_manager_per_host() {
    let (manager, _, _) = manager();
    let first = manager.acquire(host("m1")).await.expect("acquire");

    let err = manager.acquire(host("m1")).await.err().expect("second acquire");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let other = manager.acquire(host("m2")).await.expect("other host");
    assert_ne!(first.endpoint(), other.endpoint());
    assert_eq!(manager.registry().active_count(), 2);

    first.release().await;
    let again = manager.acquire(host("m1")).await.expect("after release");
    again.release().await;
    other.release().await;
    assert_eq!(manager.registry().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scoped_releases_even_when_the_body_fails() {
    let (manager, shell, _) = manager();
    let mut seen_path = None;

    let outcome: Result<(), Error> = manager
        .scoped(host("m1"), |handle| {
            seen_path = handle.endpoint().unix_path().map(|p| p.to_path_buf());
            async move { Err(Error::execution("caller failed")) }
        })
        .await;

    assert_eq!(outcome.expect_err("body error").kind(), ErrorKind::Execution);
    assert!(!manager.registry().is_active("m1"));
    assert_eq!(shell.disconnects(), 1);
    let path = seen_path.expect("endpoint path");
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_handle_frees_the_host() {
    let (manager, shell, _) = manager();
    let handle = manager.acquire(host("m1")).await.expect("acquire");
    drop(handle);

    assert_eq!(shell.disconnects(), 1);
    assert!(!manager.registry().is_active("m1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_uses_discovery_by_stack() {
    let (manager, _, _) = manager();
    let inventory = StaticInventory::parse(["prod=m1.example.com"]).expect("inventory");

    let err = manager
        .find(&inventory, Some("staging"))
        .await
        .err()
        .expect("no staging manager");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let handle = manager.find(&inventory, Some("prod")).await.expect("find");
    assert_eq!(handle.host().dns_name, "m1.example.com");
    handle.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_env_sets_the_endpoint_variable() {
    let _guard = ENV_LOCK.lock().await;
    let (manager, _, _) = manager();
    let handle = manager.acquire(host("m1")).await.expect("acquire");

    handle.publish_env();
    let (name, value) = handle.command_env();
    assert_eq!(std::env::var(&name).ok(), Some(value));

    std::env::remove_var(&name);
    handle.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configs_run_over_the_manager_session() {
    let (manager, shell, _) = manager();
    shell.script(
        swarmlink::constants::configs::LIST_COMMAND,
        vec![common::Script::output(
            r#"[{"ID":"c1","Spec":{"Name":"app.env"}}]"#,
            "",
            0,
        )],
    );

    let configs = manager
        .scoped(host("m1"), |handle| async move { handle.configs().list().await })
        .await
        .expect("list configs");
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].name, "app.env");
    assert!(shell
        .executed()
        .iter()
        .any(|command| command == swarmlink::constants::configs::LIST_COMMAND));
}
