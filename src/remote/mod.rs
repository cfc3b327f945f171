//! Short-lived remote sessions against network appliances.
//!
//! [`RemoteSessionAdapter`] opens a fresh authenticated session for every
//! operation, performs exactly one action and closes it again. There is no
//! pooling and no retry. The vendor I/O is blocking, so each operation runs on
//! the blocking thread pool.
//!
//! Paths are always sent with forward slashes; Windows-style separators in
//! caller input are converted.

pub mod ftp;
pub mod memory;
pub mod recorder;
pub mod ssh;

pub use ftp::LoggerFtpClient;
pub use memory::MemoryConnector;
pub use recorder::{modcod_name, ModemClient, RecorderClient};
pub use ssh::SshConnector;

use crate::config::SshConfig;
use crate::error::RemoteError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Login for a remote appliance. The password never appears in `Debug`.
#[derive(Clone)]
pub struct RemoteCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
}

impl RemoteCredentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl From<&SshConfig> for RemoteCredentials {
    fn from(config: &SshConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.port,
            config.username.clone(),
            config.password.clone(),
        )
    }
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// Opens authenticated sessions. Implementations block.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, credentials: &RemoteCredentials) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// One open remote session. Paths use `/` separators.
pub trait RemoteSession: Send {
    /// `Ok(false)` when the path does not exist.
    fn stat(&mut self, path: &str) -> Result<bool, RemoteError>;

    /// Entry names (not full paths) of a directory.
    fn read_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError>;

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Copy a remote file to `local`, returning the byte count.
    fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError>;

    /// Run a shell command, optionally feeding one line to its stdin.
    fn exec(&mut self, command: &str, stdin_line: Option<&str>) -> Result<CommandOutput, RemoteError>;

    fn close(&mut self) {}
}

/// Convert caller paths to the remote `/` form.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Every ancestor of `path` followed by the path itself, root first.
///
/// `a/b/c` gives `["a", "a/b", "a/b/c"]`; a leading `/` is kept.
pub fn ancestor_chain(path: &str) -> Vec<String> {
    let normalized = normalize_path(path);
    let absolute = normalized.starts_with('/');
    let mut chain = Vec::new();
    let mut current = String::new();
    for part in normalized.split('/').filter(|part| !part.is_empty()) {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(part);
        chain.push(current.clone());
    }
    chain
}

/// Reject arguments that would be interpreted by the remote shell.
fn shell_word(value: &str, what: &str) -> Result<String, RemoteError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/');
    let value = normalize_path(value);
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(RemoteError::InvalidRequest(format!(
            "{} '{}' contains unsupported characters",
            what, value
        )));
    }
    Ok(value)
}

/// One-session-per-operation wrapper around a [`RemoteConnector`].
#[derive(Clone)]
pub struct RemoteSessionAdapter {
    credentials: Arc<RemoteCredentials>,
    connector: Arc<dyn RemoteConnector>,
}

impl fmt::Debug for RemoteSessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSessionAdapter")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl RemoteSessionAdapter {
    pub fn new(credentials: RemoteCredentials, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            credentials: Arc::new(credentials),
            connector,
        }
    }

    pub fn host(&self) -> &str {
        &self.credentials.host
    }

    async fn with_session<T, F>(&self, operation: &'static str, act: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RemoteSession, &RemoteCredentials) -> Result<T, RemoteError>
            + Send
            + 'static,
    {
        let connector = Arc::clone(&self.connector);
        let credentials = Arc::clone(&self.credentials);
        tokio::task::spawn_blocking(move || {
            debug!(
                "Remote {}: opening session to {}@{}:{}",
                operation, credentials.username, credentials.host, credentials.port
            );
            let mut session = connector.connect(&credentials)?;
            let result = act(session.as_mut(), &credentials);
            session.close();
            result
        })
        .await
        .map_err(|err| RemoteError::Worker(err.to_string()))?
    }

    pub async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        let path = normalize_path(path);
        self.with_session("exists", move |session, _| session.stat(&path))
            .await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let path = normalize_path(path);
        self.with_session("list", move |session, _| {
            if !session.stat(&path)? {
                return Err(RemoteError::NotFound(path));
            }
            let mut entries = session.read_dir(&path)?;
            entries.sort();
            Ok(entries)
        })
        .await
    }

    /// Create `path` and every missing ancestor; returns whether it exists after.
    pub async fn make_directory_recursive(&self, path: &str) -> Result<bool, RemoteError> {
        let path = normalize_path(path);
        self.with_session("mkdir", move |session, _| {
            for ancestor in ancestor_chain(&path) {
                if session.stat(&ancestor)? {
                    continue;
                }
                if let Err(err) = session.mkdir(&ancestor) {
                    // created concurrently by someone else
                    if !session.stat(&ancestor)? {
                        return Err(err);
                    }
                }
            }
            session.stat(&path)
        })
        .await
    }

    /// `rm -r` a directory relative to the remote home.
    pub async fn delete_directory(&self, path: &str) -> Result<CommandOutput, RemoteError> {
        let path = shell_word(path, "directory")?;
        info!("Remote delete of ~/{} on {}", path, self.host());
        self.with_session("delete", move |session, credentials| {
            session.exec(&format!("rm -r ~/{}", path), Some(credentials.password()))
        })
        .await
    }

    /// Copy one remote file to `local`.
    pub async fn fetch_file(&self, remote: &str, local: impl Into<PathBuf>) -> Result<u64, RemoteError> {
        let remote = normalize_path(remote);
        let local = local.into();
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| RemoteError::Local {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }
        self.with_session("fetch", move |session, _| {
            let bytes = session.fetch(&remote, &local)?;
            debug!("Fetched {} ({} bytes) to {}", remote, bytes, local.display());
            Ok(bytes)
        })
        .await
    }

    /// Run `~/<script> <session_name>` from `~/<working_dir>`.
    ///
    /// The script may prompt for the login password; it is written to stdin.
    pub async fn run_script(
        &self,
        working_dir: &str,
        script: &str,
        session_name: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let working_dir = shell_word(working_dir, "directory")?;
        let script = shell_word(script, "script")?;
        let session_name = shell_word(session_name, "session name")?;
        let command = format!("cd ~/{} ; ~/{} {}", working_dir, script, session_name);
        info!("Remote script on {}: {}", self.host(), command);
        self.with_session("script", move |session, credentials| {
            session.exec(&command, Some(credentials.password()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn adapter(connector: &MemoryConnector) -> RemoteSessionAdapter {
        RemoteSessionAdapter::new(
            RemoteCredentials::new("10.0.0.5", 22, "qdra", "s3cret"),
            Arc::new(connector.clone()),
        )
    }

    #[test]
    fn test_ancestor_chain() {
        assert_eq!(ancestor_chain("a\\b\\c"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(ancestor_chain("/data/obs/"), vec!["/data", "/data/obs"]);
        assert!(ancestor_chain("").is_empty());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = RemoteCredentials::new("h", 22, "user", "s3cret");
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_make_directory_recursive_creates_missing_ancestors() {
        let connector = MemoryConnector::new();
        connector.add_dir("data");
        let remote = adapter(&connector);

        assert!(remote.make_directory_recursive("data\\obs\\20240309").await.unwrap());
        assert_eq!(connector.created_dirs(), vec!["data/obs", "data/obs/20240309"]);
        assert_eq!(connector.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_each_operation_uses_fresh_session() {
        let connector = MemoryConnector::new();
        connector.add_file("out/a.bin", b"abc");
        let remote = adapter(&connector);

        assert!(remote.exists("out").await.unwrap());
        assert!(!remote.exists("missing").await.unwrap());
        assert_eq!(remote.list_directory("out").await.unwrap(), vec!["a.bin"]);
        assert_eq!(connector.sessions_opened(), 3);
        assert_eq!(connector.sessions_closed(), 3);
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let connector = MemoryConnector::new();
        let remote = adapter(&connector);
        assert!(matches!(
            remote.list_directory("nope").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let connector = MemoryConnector::new();
        connector.add_file("out/a.bin", b"abc");
        let remote = adapter(&connector);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested").join("a.bin");

        assert_eq!(remote.fetch_file("out\\a.bin", &local).await.unwrap(), 3);
        assert_eq!(std::fs::read(&local).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_run_script_command_and_password_on_stdin() {
        let connector = MemoryConnector::new();
        let remote = adapter(&connector);
        remote
            .run_script("proc", "bin\\process.sh", "pass_0042")
            .await
            .unwrap();

        let executed = connector.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "cd ~/proc ; ~/bin/process.sh pass_0042");
        assert_eq!(executed[0].1.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_script_log_omits_password() {
        let connector = MemoryConnector::new();
        let remote = adapter(&connector);
        remote.run_script("proc", "run.sh", "pass_0042").await.unwrap();
        assert!(logs_contain("cd ~/proc ; ~/run.sh pass_0042"));
        assert!(!logs_contain("s3cret"));
    }

    #[tokio::test]
    async fn test_shell_metacharacters_rejected() {
        let connector = MemoryConnector::new();
        let remote = adapter(&connector);
        let result = remote.run_script("proc", "run.sh", "x; reboot").await;
        assert!(matches!(result, Err(RemoteError::InvalidRequest(_))));
        assert!(connector.executed().is_empty());
        assert_eq!(connector.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let connector = MemoryConnector::new();
        let remote = adapter(&connector);
        remote.delete_directory("data/old").await.unwrap();
        assert_eq!(connector.executed()[0].0, "rm -r ~/data/old");
    }
}
