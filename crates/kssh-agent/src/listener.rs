//! Private socket directory and the environment contract for clients.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";
pub const SSH_AGENT_PID: &str = "SSH_AGENT_PID";
pub const DEFAULT_SOCKET_PREFIX: &str = "kssh-";

/// A bound agent socket inside a directory only the current user can enter.
///
/// Dropping it unlinks the socket and removes the directory.
#[derive(Debug)]
pub struct AgentSocket {
    listener: Option<UnixListener>,
    path: PathBuf,
    pid: u32,
    dir: TempDir,
}

impl AgentSocket {
    /// Must be called from within a Tokio runtime.
    pub fn bind(prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700))?;

        let pid = std::process::id();
        let path = dir.path().join(format!("agent.{pid}"));
        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, Permissions::from_mode(0o600))?;
        info!(path = %path.display(), pid, "agent socket bound");

        Ok(Self {
            listener: Some(listener),
            path,
            pid,
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hands the listener to the server; the socket file stays owned here.
    pub fn take_listener(&mut self) -> Option<UnixListener> {
        self.listener.take()
    }

    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (SSH_AUTH_SOCK, self.path.display().to_string()),
            (SSH_AGENT_PID, self.pid.to_string()),
        ]
    }

    /// Bourne shell snippet in the format `ssh-agent -s` prints.
    pub fn env_script(&self) -> String {
        format!(
            "{sock}={path}; export {sock};\n{pid_var}={pid}; export {pid_var};\necho Agent pid {pid};\n",
            sock = SSH_AUTH_SOCK,
            path = self.path.display(),
            pid_var = SSH_AGENT_PID,
            pid = self.pid,
        )
    }
}

impl Drop for AgentSocket {
    fn drop(&mut self) {
        self.listener.take();
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "agent socket removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove agent socket"),
        }
    }
}
