use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Writer for `background` mode: every log line is appended to
/// `logs/run.log` instead of the (detached) terminal.
#[derive(Clone)]
pub(crate) struct RunLogWriter {
    file: Arc<std::fs::File>,
}

impl<'a> MakeWriter<'a> for RunLogWriter {
    type Writer = RunLogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogHandle {
            file: self.file.clone(),
        }
    }
}

pub(crate) struct RunLogHandle {
    file: Arc<std::fs::File>,
}

impl std::io::Write for RunLogHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.file).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.file).flush()
    }
}

pub fn init(root: &Path, background: bool) -> Result<()> {
    if background {
        let logs_dir = root.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("run.log"))?;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(RunLogWriter {
                file: Arc::new(file),
            })
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }
    Ok(())
}
