use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::TaskConfig;
use crate::core::events::{AgentEvent, EventSender, ProcessEvent, ProcessEventKind, unix_now};
use crate::platform::{NativePlatform, Platform};

/// Grace period between the polite kill and the forced one.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Result of one task run, as printed by the `run` verb.
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }
}

/// The runnable part of a task, shared between the executor held in the
/// running map and the cron closure that fires it.
pub struct TaskRunner {
    pub config: TaskConfig,
    app_id: String,
    agent_id: String,
    script_path: PathBuf,
    events: EventSender,
    /// Held by a scheduled run for its whole duration; a fire that cannot
    /// take it is skipped instead of queued.
    gate: tokio::sync::Mutex<()>,
    child_pid: std::sync::Mutex<Option<u32>>,
}

impl TaskRunner {
    pub fn new(
        app_id: &str,
        agent_id: &str,
        config: TaskConfig,
        script_dir: &Path,
        events: EventSender,
    ) -> Arc<Self> {
        let script_path = script_dir.join(format!("task.{}.script", config.id));
        Arc::new(Self {
            config,
            app_id: app_id.to_string(),
            agent_id: agent_id.to_string(),
            script_path,
            events,
            gate: tokio::sync::Mutex::new(()),
            child_pid: std::sync::Mutex::new(None),
        })
    }

    /// Cron entry point: skip the fire when the previous scheduled run of
    /// this task has not exited yet.
    pub async fn run_scheduled(&self) {
        let Ok(_guard) = self.gate.try_lock() else {
            warn!(
                "task {} ({}) is still running, skipping this fire",
                self.config.id, self.config.name
            );
            return;
        };
        self.run_once().await;
    }

    /// Run the task once: make sure the script file matches the config,
    /// spawn it through the platform shell and stream its output as events.
    pub async fn run_once(&self) -> TaskOutcome {
        let run_id = Uuid::new_v4().to_string();

        if let Err(e) = self.write_script() {
            let message = format!("cannot generate script: {e}");
            self.emit(ProcessEventKind::Stop, &run_id, message.clone());
            return TaskOutcome::failed(message);
        }

        let mut cmd = NativePlatform::shell_command_async(&self.script_path);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if !self.config.cwd.is_empty() {
            cmd.current_dir(&self.config.cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("cannot spawn task: {e}");
                self.emit(ProcessEventKind::Stop, &run_id, message.clone());
                return TaskOutcome::failed(message);
            }
        };
        *self.child_pid.lock().expect("pid lock poisoned") = child.id();
        self.emit(ProcessEventKind::Start, &run_id, String::new());

        let mut stdout_tail = String::new();
        let mut stderr_tail = String::new();
        let mut timed_out = false;

        let status = if self.config.timeout > 0 {
            let waited = tokio::time::timeout(
                Duration::from_secs(self.config.timeout),
                self.supervise(&mut child, &run_id, &mut stdout_tail, &mut stderr_tail),
            )
            .await;
            match waited {
                Ok(status) => status,
                Err(_) => {
                    timed_out = true;
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        } else {
            self.supervise(&mut child, &run_id, &mut stdout_tail, &mut stderr_tail)
                .await
        };

        *self.child_pid.lock().expect("pid lock poisoned") = None;

        match status {
            Ok(status) => {
                let data = if timed_out {
                    format!("timeout after {}s", self.config.timeout)
                } else {
                    match status.code() {
                        Some(code) => code.to_string(),
                        None => "killed".to_string(),
                    }
                };
                self.emit(ProcessEventKind::Stop, &run_id, data);
                TaskOutcome {
                    exit_code: status.code(),
                    stdout: stdout_tail,
                    stderr: stderr_tail,
                    error: timed_out
                        .then(|| format!("timeout after {}s", self.config.timeout)),
                }
            }
            Err(e) => {
                let message = format!("cannot wait for task: {e}");
                self.emit(ProcessEventKind::Stop, &run_id, message.clone());
                TaskOutcome {
                    stdout: stdout_tail,
                    stderr: stderr_tail,
                    ..TaskOutcome::failed(message)
                }
            }
        }
    }

    async fn supervise(
        &self,
        child: &mut Child,
        run_id: &str,
        stdout_tail: &mut String,
        stderr_tail: &mut String,
    ) -> std::io::Result<std::process::ExitStatus> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            self.pump(stdout, ProcessEventKind::Stdout, run_id, stdout_tail),
            self.pump(stderr, ProcessEventKind::Stderr, run_id, stderr_tail),
        );
        child.wait().await
    }

    async fn pump<R: AsyncRead + Unpin>(
        &self,
        stream: Option<R>,
        kind: ProcessEventKind,
        run_id: &str,
        tail: &mut String,
    ) {
        let Some(stream) = stream else { return };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            self.emit(kind, run_id, line.clone());
            tail.push_str(&line);
            tail.push('\n');
        }
    }

    /// Rewrite the script file when the config body differs from what is on
    /// disk. The shell reads the script from this path at spawn time.
    pub fn write_script(&self) -> Result<()> {
        if let Some(parent) = self.script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Ok(existing) = std::fs::read_to_string(&self.script_path)
            && existing == self.config.script
        {
            return Ok(());
        }
        std::fs::write(&self.script_path, &self.config.script)?;
        NativePlatform::set_executable(&self.script_path);
        Ok(())
    }

    pub fn delete_script(&self) {
        if let Err(e) = std::fs::remove_file(&self.script_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("cannot delete script {}: {e}", self.script_path.display());
        }
    }

    /// Terminate the in-flight child, if any: polite kill now, forced kill
    /// after the grace period if it is still around.
    pub fn terminate(&self) {
        let pid = self.child_pid.lock().expect("pid lock poisoned").take();
        if let Some(pid) = pid {
            info!("task {}: terminating child {pid}", self.config.id);
            let _ = NativePlatform::kill_process(pid);
            tokio::spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                if NativePlatform::process_exists(pid) {
                    let _ = NativePlatform::kill_process_force(pid);
                }
            });
        }
    }

    fn emit(&self, kind: ProcessEventKind, run_id: &str, data: String) {
        let _ = self.events.send(AgentEvent::Process(ProcessEvent {
            event: kind,
            agent_id: self.agent_id.clone(),
            app_id: self.app_id.clone(),
            task_id: self.config.id.clone(),
            unique_id: run_id.to_string(),
            data,
            timestamp: unix_now(),
        }));
    }
}

/// One entry of the running-task map: the runner plus its cron registration.
pub struct TaskExecutor {
    runner: Arc<TaskRunner>,
    job_id: Option<Uuid>,
}

impl TaskExecutor {
    pub fn new(
        app_id: &str,
        agent_id: &str,
        config: TaskConfig,
        script_dir: &Path,
        events: EventSender,
    ) -> Self {
        Self {
            runner: TaskRunner::new(app_id, agent_id, config, script_dir, events),
            job_id: None,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.runner.config
    }

    /// Register the cron trigger for this task.
    pub async fn schedule(&mut self, scheduler: &JobScheduler) -> Result<()> {
        let runner = self.runner.clone();
        let expr = cron_with_seconds(&self.runner.config.schedule);
        let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run_scheduled().await;
            })
        })
        .map_err(|e| {
            anyhow!(
                "invalid schedule '{}' for task {}: {e}",
                self.runner.config.schedule,
                self.runner.config.id
            )
        })?;
        let mut scheduler = scheduler.clone();
        let job_id = scheduler
            .add(job)
            .await
            .map_err(|e| anyhow!("cannot register schedule: {e}"))?;
        self.job_id = Some(job_id);
        Ok(())
    }

    /// Drop the cron trigger and terminate any running child.
    pub async fn stop(&mut self, scheduler: &JobScheduler) {
        if let Some(job_id) = self.job_id.take() {
            let mut scheduler = scheduler.clone();
            if let Err(e) = scheduler.remove(&job_id).await {
                warn!(
                    "cannot remove schedule for task {}: {e}",
                    self.runner.config.id
                );
            }
        }
        self.runner.terminate();
    }

    pub fn write_script(&self) -> Result<()> {
        self.runner.write_script()
    }

    pub fn delete_script(&self) {
        self.runner.delete_script()
    }
}

/// The scheduler dialect includes a leading seconds field; masters usually
/// hand out plain 5-field crontab lines, so prefix those with `0`.
pub(crate) fn cron_with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TaskConfig;
    use crate::core::events::AgentEvent;

    fn task_config(id: &str, script: &str) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            name: id.to_string(),
            version: 1,
            on: true,
            schedule: String::new(),
            boot: false,
            script: script.to_string(),
            env: Default::default(),
            cwd: String::new(),
            timeout: 0,
        }
    }

    fn drain_process_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    ) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::Process(pe) = event {
                events.push(pe);
            }
        }
        events
    }

    #[test]
    fn five_field_schedules_gain_a_seconds_column() {
        assert_eq!(cron_with_seconds("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(cron_with_seconds("0 0/5 * * * *"), "0 0/5 * * * *");
        assert_eq!(cron_with_seconds("  0 * * * *  "), "0 0 * * * *");
    }

    #[tokio::test]
    async fn run_once_streams_output_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = TaskRunner::new(
            "app1",
            "agent1",
            task_config("T1", "echo hello\necho oops 1>&2\nexit 3\n"),
            dir.path(),
            tx,
        );

        let outcome = runner.run_once().await;
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.stderr.contains("oops"));
        assert!(outcome.error.is_none());
        assert!(dir.path().join("task.T1.script").exists());

        let events = drain_process_events(&mut rx);
        assert_eq!(events.first().unwrap().event, ProcessEventKind::Start);
        assert_eq!(events.last().unwrap().event, ProcessEventKind::Stop);
        assert_eq!(events.last().unwrap().data, "3");
        assert!(events
            .iter()
            .any(|e| e.event == ProcessEventKind::Stdout && e.data == "hello"));
        assert!(events
            .iter()
            .any(|e| e.event == ProcessEventKind::Stderr && e.data == "oops"));
        // All records of one run share the run id.
        let run_id = &events[0].unique_id;
        assert!(events.iter().all(|e| &e.unique_id == run_id));
    }

    #[tokio::test]
    async fn spawn_failure_emits_stop_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut config = task_config("T2", "echo never");
        config.cwd = "/definitely/not/a/dir".to_string();
        let runner = TaskRunner::new("app1", "agent1", config, dir.path(), tx);

        let outcome = runner.run_once().await;
        assert!(outcome.error.is_some());
        assert!(outcome.exit_code.is_none());

        let events = drain_process_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ProcessEventKind::Stop);
        assert!(events[0].data.contains("cannot spawn task"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut config = task_config("T3", "sleep 30\n");
        config.timeout = 1;
        let runner = TaskRunner::new("app1", "agent1", config, dir.path(), tx);

        let outcome = runner.run_once().await;
        assert!(outcome.error.as_deref().unwrap_or("").contains("timeout"));

        let events = drain_process_events(&mut rx);
        assert!(events.last().unwrap().data.contains("timeout"));
    }

    #[tokio::test]
    async fn overlapping_scheduled_fires_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = TaskRunner::new(
            "app1",
            "agent1",
            task_config("T4", "sleep 1\n"),
            dir.path(),
            tx,
        );

        tokio::join!(runner.run_scheduled(), runner.run_scheduled());

        let events = drain_process_events(&mut rx);
        let starts = events
            .iter()
            .filter(|e| e.event == ProcessEventKind::Start)
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn script_file_is_rewritten_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = TaskRunner::new(
            "app1",
            "agent1",
            task_config("T5", "echo one\n"),
            dir.path(),
            tx.clone(),
        );
        runner.write_script().unwrap();
        let path = dir.path().join("task.T5.script");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo one\n");

        let updated = TaskRunner::new(
            "app1",
            "agent1",
            task_config("T5", "echo two\n"),
            dir.path(),
            tx,
        );
        updated.write_script().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo two\n");

        updated.delete_script();
        assert!(!path.exists());
    }
}
