//! End-to-end daemon run: PID file, ticks, health endpoint, shutdown

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use lk_core::config::{DaemonConfig, NotificationConfig};
use lk_core::pidfile;
use lk_core::{FileTokenStore, Profile, Token, TokenStore};
use lk_daemon::notify::RecordingNotifier;
use lk_daemon::{DaemonState, HealthReport, HealthStatus, NotificationKind, RenewalEngine, Scheduler};
use lk_exec::{Environment, Executor, ExecutorConfig, OutputSink, Script, ScriptedRunner};

fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn config(data_dir: &Path, health_address: String) -> DaemonConfig {
    DaemonConfig {
        health_address,
        data_dir: data_dir.to_path_buf(),
        notifications: NotificationConfig {
            enabled: true,
            on_renewal: true,
            on_failure: true,
        },
        profiles: vec![
            Profile::new("work", "https://vault.example.com:8200"),
            Profile::new("home", "http://127.0.0.1:8200"),
        ],
        ..DaemonConfig::default()
    }
}

async fn fetch_health(client: &reqwest::Client, address: &str) -> Option<HealthReport> {
    let response = client
        .get(format!("http://{}/health", address))
        .send()
        .await
        .ok()?;
    response.json().await.ok()
}

#[tokio::test]
async fn test_daemon_renews_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let address = free_address();
    let config = config(dir.path(), address.clone());
    let pid_path = pidfile::pid_path_in(dir.path());

    let store = Arc::new(FileTokenStore::new(dir.path().join("tokens")));
    let due = Token::issued("s.work", 3600, true, Utc::now() - TimeDelta::seconds(3500));
    store.set("work", &due).unwrap();
    let fresh = Token::issued("s.home", 3600, true, Utc::now());
    store.set("home", &fresh).unwrap();

    let runner = ScriptedRunner::new().with_binary("vault", "/usr/local/bin/vault");
    runner.push(Script::success(
        "{\"auth\":{\"client_token\":\"s.work2\",\"lease_duration\":7200,\"renewable\":true}}",
    ));
    let executor = Executor::with_runner(
        Arc::new(runner.clone()),
        ExecutorConfig {
            stdout: OutputSink::Discard,
            stderr: OutputSink::Discard,
            forward_signals: false,
            ..ExecutorConfig::default()
        },
    );
    let engine = RenewalEngine::new(executor, store.clone(), config.policy())
        .with_base_env(Environment::empty());
    let notes = RecordingNotifier::new();
    let mut scheduler = Scheduler::new(config, engine, Arc::new(notes.clone())).unwrap();

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let daemon = tokio::spawn(async move {
        let result = scheduler.run(task_cancel).await;
        (result, scheduler)
    });

    let client = reqwest::Client::new();
    let mut report = None;
    for _ in 0..100 {
        if let Some(r) = fetch_health(&client, &address).await {
            if r.last_tick.is_some() {
                report = Some(r);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let report = report.expect("health endpoint never reported a tick");

    assert_eq!(report.status, HealthStatus::Ok);
    assert!(report.alive);
    assert_eq!(report.pid, std::process::id());
    assert!(report.last_successful_tick.is_some());
    assert_eq!(report.profiles["work"].last_outcome.as_deref(), Some("renewed"));
    assert_eq!(report.profiles["home"].last_outcome.as_deref(), Some("not_due"));
    assert_eq!(pidfile::running_pid(&pid_path), Some(std::process::id()));

    let renewed = store.get("work").unwrap().unwrap();
    assert_eq!(renewed.client_token, "s.work2");
    assert_eq!(renewed.lease_duration, 7200);
    assert_eq!(store.get("home").unwrap().unwrap(), fresh);
    assert_eq!(notes.kinds(), vec![NotificationKind::Renewed]);

    let calls = runner.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].env.get("VAULT_ADDR").unwrap(),
        "https://vault.example.com:8200"
    );

    cancel.cancel();
    let (result, scheduler) = tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon did not stop")
        .unwrap();
    result.unwrap();

    assert_eq!(scheduler.state(), DaemonState::Stopped);
    assert!(!pid_path.exists());
    assert!(fetch_health(&client, &address).await.is_none());
}

#[tokio::test]
async fn test_unbindable_health_address_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let mut config = config(dir.path(), address);
    config.profiles.clear();
    let engine = RenewalEngine::new(
        Executor::with_runner(Arc::new(ScriptedRunner::new()), ExecutorConfig::default()),
        Arc::new(FileTokenStore::new(dir.path().join("tokens"))),
        config.policy(),
    );
    let mut scheduler = Scheduler::new(config, engine, Arc::new(RecordingNotifier::new())).unwrap();
    let status = scheduler.status();

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let daemon = tokio::spawn(async move { scheduler.run(task_cancel).await });

    for _ in 0..100 {
        if status.read().await.last_tick.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status.read().await.state, DaemonState::Running);
    assert!(status.read().await.last_tick.is_some());

    cancel.cancel();
    daemon.await.unwrap().unwrap();
    drop(taken);
}
