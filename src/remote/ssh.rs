//! SSH/SFTP sessions via `ssh2`.
//!
//! Host keys are accepted without verification; the recorder appliances sit
//! on an isolated test network.

use super::{RemoteConnector, RemoteCredentials, RemoteSession};
use crate::error::RemoteError;
use std::time::Duration;

#[cfg(feature = "remote_ssh")]
use super::CommandOutput;
#[cfg(feature = "remote_ssh")]
use std::io::{Read, Write};
#[cfg(feature = "remote_ssh")]
use std::path::Path;
#[cfg(feature = "remote_ssh")]
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(feature = "remote_ssh")]
use tracing::debug;

/// sftp status code for a missing path (LIBSSH2_FX_NO_SUCH_FILE)
#[cfg(feature = "remote_ssh")]
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Connects with username/password authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    timeout: Duration,
}

impl SshConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(feature = "remote_ssh")]
fn operation_error(operation: &'static str, err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Operation {
        operation,
        reason: err.to_string(),
    }
}

#[cfg(feature = "remote_ssh")]
impl RemoteConnector for SshConnector {
    fn connect(&self, credentials: &RemoteCredentials) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let connect_error = |reason: String| RemoteError::Connect {
            host: credentials.host.clone(),
            port: credentials.port,
            reason,
        };

        let address = (credentials.host.as_str(), credentials.port)
            .to_socket_addrs()
            .map_err(|err| connect_error(err.to_string()))?
            .next()
            .ok_or_else(|| connect_error("host did not resolve".to_string()))?;
        let tcp = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|err| connect_error(err.to_string()))?;

        let mut session = ssh2::Session::new().map_err(|err| connect_error(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|err| connect_error(err.to_string()))?;
        session
            .userauth_password(&credentials.username, credentials.password())
            .map_err(|_| RemoteError::Authentication(credentials.username.clone()))?;
        if !session.authenticated() {
            return Err(RemoteError::Authentication(credentials.username.clone()));
        }

        debug!("SSH session open to {}", address);
        Ok(Box::new(SshSession { session }))
    }
}

#[cfg(not(feature = "remote_ssh"))]
impl RemoteConnector for SshConnector {
    fn connect(&self, _credentials: &RemoteCredentials) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Err(RemoteError::FeatureNotEnabled("remote_ssh".to_string()))
    }
}

#[cfg(feature = "remote_ssh")]
struct SshSession {
    session: ssh2::Session,
}

#[cfg(feature = "remote_ssh")]
impl SshSession {
    fn sftp(&self) -> Result<ssh2::Sftp, RemoteError> {
        self.session
            .sftp()
            .map_err(|err| operation_error("sftp", err))
    }
}

#[cfg(feature = "remote_ssh")]
impl RemoteSession for SshSession {
    fn stat(&mut self, path: &str) -> Result<bool, RemoteError> {
        match self.sftp()?.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(false),
            Err(err) => Err(operation_error("stat", err)),
        }
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|err| operation_error("readdir", err))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry, _)| {
                entry
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.sftp()?
            .mkdir(Path::new(path), 0o755)
            .map_err(|err| operation_error("mkdir", err))
    }

    fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        let sftp = self.sftp()?;
        let mut source = sftp.open(Path::new(remote)).map_err(|err| {
            if err.code() == ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) {
                RemoteError::NotFound(remote.to_string())
            } else {
                operation_error("open", err)
            }
        })?;
        let mut target = std::fs::File::create(local)?;
        Ok(std::io::copy(&mut source, &mut target)?)
    }

    fn exec(&mut self, command: &str, stdin_line: Option<&str>) -> Result<CommandOutput, RemoteError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| operation_error("channel", err))?;
        // sudo inside the scripts reads the password from a terminal
        channel
            .request_pty("xterm", None, None)
            .map_err(|err| operation_error("pty", err))?;
        channel
            .exec(command)
            .map_err(|err| operation_error("exec", err))?;

        if let Some(line) = stdin_line {
            channel.write_all(line.as_bytes())?;
            channel.write_all(b"\n")?;
            channel.flush()?;
        }
        channel
            .send_eof()
            .map_err(|err| operation_error("exec", err))?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel
            .wait_close()
            .map_err(|err| operation_error("exec", err))?;
        let exit_status = channel
            .exit_status()
            .map_err(|err| operation_error("exec", err))?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    fn close(&mut self) {
        if let Err(err) = self.session.disconnect(None, "done", None) {
            debug!("SSH disconnect failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "remote_ssh"))]
    #[test]
    fn test_feature_disabled() {
        let credentials = RemoteCredentials::new("127.0.0.1", 22, "u", "p");
        assert!(matches!(
            SshConnector::default().connect(&credentials),
            Err(RemoteError::FeatureNotEnabled(_))
        ));
    }

    #[cfg(feature = "remote_ssh")]
    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let credentials = RemoteCredentials::new("127.0.0.1", port, "u", "p");
        let result = SshConnector::new(Duration::from_millis(500)).connect(&credentials);
        assert!(matches!(result, Err(RemoteError::Connect { .. })));
    }
}
