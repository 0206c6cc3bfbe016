//! Local server process management.
//!
//! `server start` launches the `noetl-control-plane` binary detached and
//! records its pid under `~/.noetl/server.pid`; `server stop` signals it.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;

fn pid_file() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .ok_or_else(|| anyhow!("cannot determine home directory"))?
        .join(".noetl");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("server.pid"))
}

/// Start the control plane as a background process.
pub fn start() -> Result<()> {
    let pid_path = pid_file()?;

    if let Ok(existing) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if kill(Pid::from_raw(pid), None).is_ok() {
                return Err(anyhow!("server already running (pid {})", pid));
            }
        }
    }

    let child = std::process::Command::new("noetl-control-plane")
        .stdin(std::process::Stdio::null())
        .spawn()
        .context("failed to launch noetl-control-plane (is it on PATH?)")?;

    std::fs::write(&pid_path, child.id().to_string())?;
    println!("server started (pid {})", child.id());
    Ok(())
}

/// Stop a running control plane via SIGTERM.
pub fn stop() -> Result<()> {
    let pid_path = pid_file()?;
    let pid: i32 = std::fs::read_to_string(&pid_path)
        .context("no pid file; is the server running?")?
        .trim()
        .parse()
        .context("invalid pid file")?;

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow!("failed to signal pid {}: {}", pid, e))?;
    std::fs::remove_file(&pid_path).ok();

    println!("server stopped (pid {})", pid);
    Ok(())
}
