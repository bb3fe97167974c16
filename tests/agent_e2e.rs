//! End-to-end checks against the built binary: the `test` and `help` verbs,
//! and a short local-mode run that must leave boot-task events in the spool.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::get;

fn agent_binary() -> &'static str {
    env!("CARGO_BIN_EXE_teaweb-agent")
}

fn write_connect(root: &Path, body: &str) {
    std::fs::create_dir_all(root.join("configs")).unwrap();
    std::fs::write(root.join("configs/agent.conf"), body).unwrap();
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_verb_succeeds_against_a_healthy_master() {
    let dir = tempfile::tempdir().unwrap();

    let router = Router::new().route(
        "/api/agent",
        get(|| async {
            axum::Json(serde_json::json!({
                "code": 200,
                "data": {"config": "id: \"agent1\"\non: true\n"}
            }))
        }),
    );
    let base = serve(router).await;
    write_connect(
        dir.path(),
        &format!("id: \"agent1\"\nkey: \"k1\"\nmaster: \"{base}\"\n"),
    );

    let root = dir.path().to_path_buf();
    let status = tokio::task::spawn_blocking(move || {
        Command::new(agent_binary())
            .arg("test")
            .env("TEAWEB_AGENT_ROOT", &root)
            .status()
            .unwrap()
    })
    .await
    .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_verb_fails_when_the_master_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    write_connect(
        dir.path(),
        "id: \"agent1\"\nkey: \"k1\"\nmaster: \"http://127.0.0.1:1\"\n",
    );

    let root = dir.path().to_path_buf();
    let status = tokio::task::spawn_blocking(move || {
        Command::new(agent_binary())
            .arg("test")
            .env("TEAWEB_AGENT_ROOT", &root)
            .status()
            .unwrap()
    })
    .await
    .unwrap();
    assert!(!status.success());
}

#[test]
fn help_verb_prints_the_usage_block() {
    let output = Command::new(agent_binary()).arg("help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Usage"));
    assert!(text.contains("start"));
    assert!(text.contains("run"));
}

#[test]
fn local_mode_spools_boot_task_events_without_a_master() {
    let dir = tempfile::tempdir().unwrap();
    write_connect(dir.path(), "id: \"local\"\n");
    std::fs::create_dir_all(dir.path().join("configs/agents")).unwrap();
    std::fs::write(
        dir.path().join("configs/agents/agent.local.conf"),
        "id: \"local\"\non: true\napps:\n  - id: \"app1\"\n    on: true\n    tasks:\n      - id: \"T1\"\n        name: \"bootme\"\n        version: 1\n        on: true\n        boot: true\n        schedule: \"\"\n        script: \"echo hello-from-boot\"\n",
    )
    .unwrap();

    let mut child = Command::new(agent_binary())
        .env("TEAWEB_AGENT_ROOT", dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Wait until the boot task's start/stdout/stop records hit the spool.
    let spool_path = dir.path().join("logs/spool.db");
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut rows: Vec<String> = Vec::new();
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
        let Ok(db) = rusqlite::Connection::open(&spool_path) else {
            continue;
        };
        let collected: rusqlite::Result<Vec<String>> = db
            .prepare("SELECT value FROM events ORDER BY key ASC")
            .and_then(|mut stmt| {
                let mapped = stmt
                    .query_map([], |row| {
                        row.get::<_, Vec<u8>>(0)
                            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                    })?
                    .collect();
                mapped
            });
        if let Ok(collected) = collected
            && collected.iter().any(|value| value.contains("\"stop\""))
        {
            rows = collected;
            break;
        }
    }

    child.kill().unwrap();
    let _ = child.wait();

    assert!(!rows.is_empty(), "no events reached the spool");
    assert!(rows.first().unwrap().contains("\"start\""));
    assert!(rows.iter().any(|r| r.contains("hello-from-boot")));
    assert!(rows.iter().any(|r| r.contains("\"stop\"")));
}
