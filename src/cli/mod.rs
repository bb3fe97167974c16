mod daemon;

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::core::agent::Agent;
use crate::core::config::{AgentConfig, ConfigStore, ConnectConfig};
use crate::core::executor::TaskRunner;
use crate::core::master::{Credentials, MasterClient};
use crate::core::terminal::{print_error, print_success, print_usage};
use crate::platform::agent_root;

fn print_help() {
    println!("Usage:");
    print_usage("teaweb-agent", "run in foreground");
    print_usage("teaweb-agent help", "show help");
    print_usage("teaweb-agent start", "start agent in background");
    print_usage("teaweb-agent stop", "stop agent");
    print_usage("teaweb-agent restart", "restart agent");
    print_usage("teaweb-agent run [TASK ID]", "run a task once");
    print_usage("teaweb-agent test", "test the connection to master");
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let root = agent_root();

    match args.get(1).map(String::as_str).unwrap_or_default() {
        "start" => daemon::start(&root).await,
        "stop" => daemon::stop(&root),
        "restart" => {
            daemon::stop(&root)?;
            daemon::start(&root).await
        }
        "run" => run_task(&root, args.get(2).map(String::as_str)).await,
        "test" => test_connection(&root).await,
        "help" | "-h" | "h" | "-help" => {
            print_help();
            Ok(())
        }
        "background" => run_foreground(&root, true).await,
        // Anything else, including no verb at all, runs in the foreground.
        _ => run_foreground(&root, false).await,
    }
}

async fn run_foreground(root: &Path, background: bool) -> Result<()> {
    crate::logging::init(root, background)?;
    let connect = ConnectConfig::load(root)?;
    let (agent, events) = Agent::new(root.to_path_buf(), connect).await?;
    crate::core::agent::run(agent, events).await
}

/// `run <TASK_ID>`: execute one task outside the daemon and print what it
/// did. Events still flow into the runner's channel but nobody listens.
async fn run_task(root: &Path, task_id: Option<&str>) -> Result<()> {
    let Some(task_id) = task_id.filter(|id| !id.is_empty()) else {
        print_error("no task to run");
        return Ok(());
    };

    let connect = ConnectConfig::load(root)?;
    let config = ConfigStore::load_installed(root, &connect.id).context("agent not found")?;
    let Some((app, task)) = config.find_task(task_id) else {
        print_error("task not found");
        return Ok(());
    };

    let (events, _unused) = tokio::sync::mpsc::unbounded_channel();
    let runner = TaskRunner::new(
        &app.id,
        &config.id,
        task.clone(),
        &root.join("configs").join("agents"),
        events,
    );
    let outcome = runner.run_once().await;

    if !outcome.stdout.is_empty() {
        println!("stdout: {}", outcome.stdout.trim_end());
    }
    if !outcome.stderr.is_empty() {
        println!("stderr: {}", outcome.stderr.trim_end());
    }
    if let Some(code) = outcome.exit_code
        && code != 0
    {
        println!("exit code: {code}");
    }
    if let Some(error) = outcome.error {
        print_error(&error);
    }
    Ok(())
}

/// `test`: one full config fetch against the master, end to end.
async fn test_connection(root: &Path) -> Result<()> {
    let connect = ConnectConfig::load(root)?;
    if connect.master.is_empty() {
        bail!("'master' should not be empty");
    }
    let master = MasterClient::new(&connect.master)?;
    let raw = master
        .fetch_config(&Credentials {
            id: connect.id.clone(),
            key: connect.key.clone(),
        })
        .await?;
    let config = AgentConfig::parse(&raw)?;
    config.validate()?;
    print_success("connection to master is ok");
    Ok(())
}
