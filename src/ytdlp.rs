//! Thin wrapper around the `yt-dlp` executable shared by the lister and the
//! caption fetcher. Tests swap the binary for a shell stub via
//! [`set_ytdlp_stub_path`].

use std::process::{Command, Stdio};
#[cfg(test)]
use std::path::PathBuf;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, bail};
use tokio::runtime::RuntimeFlavor;

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    let mut command = Command::new("yt-dlp");
    command.stdin(Stdio::null());
    command
}

/// Points every `yt-dlp` invocation at `path` until the guard is dropped.
/// The guard also serializes tests that rely on the stub.
#[cfg(test)]
pub(crate) fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Writes an executable bash script standing in for yt-dlp.
#[cfg(test)]
pub(crate) fn install_stub_script(dir: &std::path::Path, body: &str) -> Result<PathBuf> {
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    let script_path = dir.join("yt-dlp");
    fs::write(&script_path, format!("#!/usr/bin/env bash\nset -eu\n{body}"))?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
    }
    Ok(script_path)
}

/// Runs the command and returns stdout, or a one-line reason on failure.
/// The reason includes the last stderr line, which is where yt-dlp puts its
/// `ERROR:` message.
pub(crate) fn capture_stdout(mut command: Command) -> Result<String, String> {
    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| format!("could not run yt-dlp: {err}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no error output");
        return Err(format!("yt-dlp exited with {}: {detail}", output.status));
    }

    String::from_utf8(output.stdout).map_err(|err| format!("yt-dlp output is not UTF-8: {err}"))
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Runs a blocking yt-dlp call from async code. On a multi-threaded runtime
/// the worker is handed off first so other tasks keep running; a
/// current-thread runtime has no spare worker and runs `op` in place.
pub fn blocking_section<T>(op: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(op)
        }
        _ => op(),
    }
}

/// Runs `<name> --version` to fail loudly when yt-dlp is missing.
pub fn ensure_program_available(name: &str) -> Result<()> {
    let status = Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}
