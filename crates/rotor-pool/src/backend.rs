//! Backend process plumbing: working directory, config file, spawn, terminate.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::PoolError;

/// State files the backend rewrites on every run. A trailing `*` matches any
/// suffix; other entries match exactly.
const PURGE_PATTERNS: &[&str] = &["cached-*", "state", "lock", "router*", "micro*"];

const CONFIG_FILE_NAME: &str = "torrc";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Everything needed to launch one backend process.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec<'a> {
    pub binary: &'a Path,
    pub project_root: &'a Path,
    pub work_dir: &'a Path,
    pub socks_port: u16,
    pub control_port: u16,
    pub hashed_secret: &'a str,
}

/// Render the backend config file for one instance.
pub(crate) fn render_config(spec: &LaunchSpec<'_>) -> String {
    format!(
        "SocksPort {}\nControlPort {}\nDataDirectory {}\nHashedControlPassword {}\n",
        spec.socks_port,
        spec.control_port,
        spec.work_dir.display(),
        spec.hashed_secret,
    )
}

fn matches_purge_pattern(name: &str) -> bool {
    PURGE_PATTERNS.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == *pattern,
    })
}

/// Remove cached consensus and state files so the next run builds fresh
/// circuits, keeping anything that does not match [`PURGE_PATTERNS`].
///
/// Individual removal failures are logged and skipped.
pub(crate) fn purge_cached_state(work_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !matches_purge_pattern(name) {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "could not purge cached state");
        }
    }
}

/// Create the working directory, purge stale state and write the config file.
///
/// Returns the config file path.
pub(crate) fn prepare_work_dir(spec: &LaunchSpec<'_>) -> Result<PathBuf, PoolError> {
    let work_dir_err = |source| PoolError::WorkDir {
        path: spec.work_dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(spec.work_dir).map_err(work_dir_err)?;
    purge_cached_state(spec.work_dir);
    let config_path = spec.work_dir.join(CONFIG_FILE_NAME);
    std::fs::write(&config_path, render_config(spec)).map_err(work_dir_err)?;
    Ok(config_path)
}

/// Launch the backend with its config file. Output is discarded and the
/// process is killed if its handle is dropped.
pub(crate) fn spawn(spec: &LaunchSpec<'_>, config_path: &Path) -> Result<Child, PoolError> {
    let mut command = Command::new(spec.binary);
    command
        .arg("-f")
        .arg(config_path)
        .current_dir(spec.project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    command.spawn().map_err(|source| PoolError::Spawn {
        path: spec.binary.to_path_buf(),
        source,
    })
}

/// Ask the process to exit, then force-kill it after `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet, so it cannot
        // have been recycled for another process.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::debug!(pid, "backend ignored SIGTERM; killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill backend process");
    }
}

/// Kill every process named like `binary`, left over from an earlier run.
///
/// Best-effort: failures are logged at debug level. Waits half a second
/// afterwards so the ports are released.
pub async fn kill_strays(binary: &Path) {
    let Some(name) = binary.file_name().and_then(|n| n.to_str()) else {
        return;
    };

    #[cfg(windows)]
    let mut command = {
        let mut c = Command::new("taskkill");
        c.args(["/F", "/IM", name]);
        c.creation_flags(CREATE_NO_WINDOW);
        c
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut c = Command::new("pkill");
        c.args(["-x", name]);
        c
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.status().await {
        Ok(status) => tracing::debug!(name, %status, "stray backend sweep finished"),
        Err(e) => tracing::debug!(name, error = %e, "stray backend sweep unavailable"),
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
}
