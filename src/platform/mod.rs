use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that executes a script file through the
    /// platform shell.
    fn shell_command_async(script_path: &Path) -> tokio::process::Command;

    /// Build a **tokio** `Command` that runs an inline shell string
    /// (collectors are one-liners, not script files).
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Ask the process identified by `pid` to terminate.
    fn kill_process(pid: u32) -> std::io::Result<std::process::Output>;

    /// Terminate `pid` without giving it a chance to clean up.
    fn kill_process_force(pid: u32) -> std::io::Result<std::process::Output>;

    /// Whether `pid` still names a live process.
    fn process_exists(pid: u32) -> bool;

    /// Mark a file as executable (0o755 on Unix, no-op on Windows).
    fn set_executable(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);
}

/// Root directory everything (`configs/`, `logs/`) is resolved against.
/// `TEAWEB_AGENT_ROOT` wins; a binary installed under `<root>/bin/` uses
/// `<root>`; otherwise the current directory.
pub fn agent_root() -> PathBuf {
    if let Ok(dir) = std::env::var("TEAWEB_AGENT_ROOT")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
        && dir.file_name().is_some_and(|name| name == "bin")
        && let Some(root) = dir.parent()
    {
        return root.to_path_buf();
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
