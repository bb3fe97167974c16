use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::core::terminal::{print_error, print_success};
use crate::platform::{NativePlatform, Platform};

/// Fork the agent into the background: re-exec ourselves with the
/// `background` verb, wire stdout/stderr to `logs/run.log` and record the
/// pid. One second of grace catches configs that fail immediately.
pub async fn start(root: &Path) -> Result<()> {
    let logs_dir = root.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("run.log"))?;

    let exe = std::env::current_exe()?;
    let mut child = std::process::Command::new(exe)
        .arg("background")
        .current_dir(root)
        .env("TEAWEB_AGENT_ROOT", root)
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    if child.try_wait()?.is_some() {
        bail!("process terminated, look at 'logs/run.log' for more details");
    }

    std::fs::write(logs_dir.join("pid"), child.id().to_string())?;
    print_success(&format!("start success, pid: {}", child.id()));
    Ok(())
}

/// Kill the process recorded in `logs/pid`. Executors get no graceful
/// shutdown; the spool is on disk and survives.
pub fn stop(root: &Path) -> Result<()> {
    let pid_file = root.join("logs").join("pid");
    match std::fs::read_to_string(&pid_file) {
        Ok(content) => {
            match content.trim().parse::<u32>() {
                Ok(pid) => {
                    let _ = NativePlatform::kill_process_force(pid);
                    print_success(&format!("stopped pid {pid}"));
                }
                Err(_) => print_error(&format!("invalid pid file content '{}'", content.trim())),
            }
            let _ = std::fs::remove_file(&pid_file);
        }
        Err(e) => print_error(&format!("error: {e}")),
    }
    Ok(())
}
