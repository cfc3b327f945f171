//! Anonymous FTP access to the data logger's internal storage.
//!
//! The GL840 serves its memory card over plain FTP. Every call opens its own
//! control connection, logs in anonymously, performs one transfer and quits.
//! Paths may use either separator; they are always sent with `/`.

use super::normalize_path;
use crate::config::NetworkConfig;
use crate::error::RemoteError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info};

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// File listing and download from the data logger's FTP server.
#[derive(Debug, Clone)]
pub struct LoggerFtpClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl LoggerFtpClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &NetworkConfig, timeout: Duration) -> Self {
        Self::new(config.host.clone(), config.port, timeout)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn connect_error(&self, reason: impl std::fmt::Display) -> RemoteError {
        RemoteError::Connect {
            host: self.host.clone(),
            port: self.port,
            reason: reason.to_string(),
        }
    }

    fn resolve(&self) -> Result<SocketAddr, RemoteError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| self.connect_error(err))?
            .next()
            .ok_or_else(|| self.connect_error("host did not resolve"))
    }

    /// Connect, log in, run `act`, then quit, all on the blocking pool.
    async fn with_connection<T, F>(&self, operation: &'static str, act: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, FtpError> + Send + 'static,
    {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            let address = client.resolve()?;
            let mut ftp = FtpStream::connect_timeout(address, client.timeout)
                .map_err(|err| client.connect_error(err))?;
            ftp.login(ANONYMOUS_USER, ANONYMOUS_PASSWORD)
                .map_err(|_| RemoteError::Authentication(ANONYMOUS_USER.to_string()))?;
            debug!("FTP {}: logged in to {}", operation, address);

            let result = act(&mut ftp).map_err(|err| RemoteError::Operation {
                operation,
                reason: err.to_string(),
            });
            if let Err(err) = ftp.quit() {
                debug!("FTP {}: quit failed: {}", operation, err);
            }
            result
        })
        .await
        .map_err(|err| RemoteError::Worker(err.to_string()))?
    }

    /// Names under `path`, without the blank entries some servers emit.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let path = normalize_path(path);
        let entries = self
            .with_connection("list", move |ftp| ftp.nlst(Some(path.as_str())))
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| entry.trim_end_matches(['\r', '\n']).to_string())
            .filter(|entry| !entry.trim().is_empty())
            .collect())
    }

    /// Download `remote` into `local`, returning the byte count.
    pub async fn get_file(&self, remote: &str, local: impl Into<PathBuf>) -> Result<u64, RemoteError> {
        let remote = normalize_path(remote);
        let local = local.into();
        let local_error = |source| RemoteError::Local {
            path: local.display().to_string(),
            source,
        };

        let fetched = remote.clone();
        let contents = self
            .with_connection("download", move |ftp| {
                ftp.transfer_type(FileType::Binary)?;
                Ok(ftp.retr_as_buffer(&fetched)?.into_inner())
            })
            .await?;

        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(local_error)?;
            }
        }
        tokio::fs::write(&local, &contents)
            .await
            .map_err(local_error)?;
        info!(
            "Downloaded {} ({} bytes) from {} to {}",
            remote,
            contents.len(),
            self.host,
            local.display()
        );
        Ok(contents.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    type Files = &'static [(&'static str, &'static [u8])];

    fn reply(control: &mut TcpStream, line: &str) {
        control.write_all(format!("{}\r\n", line).as_bytes()).unwrap();
    }

    /// Minimal anonymous FTP server serving `sessions` control connections.
    /// NLST of any listed directory returns `listing`; RETR serves `files`.
    /// Returns the port and a handle yielding every command received.
    fn ftp_server(
        sessions: usize,
        listing: &'static str,
        files: Files,
    ) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut commands = Vec::new();
            for _ in 0..sessions {
                let (mut control, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(control.try_clone().unwrap());
                let mut data_listener: Option<TcpListener> = None;
                reply(&mut control, "220 GL840 FTP ready");
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        break;
                    }
                    let line = line.trim_end().to_string();
                    commands.push(line.clone());
                    let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                    let payload: Option<&[u8]> = match verb {
                        "NLST" => Some(listing.as_bytes()),
                        "RETR" => files
                            .iter()
                            .find(|(name, _)| *name == arg)
                            .map(|(_, contents)| *contents),
                        _ => None,
                    };
                    match verb {
                        "USER" => reply(&mut control, "331 Password required"),
                        "PASS" => reply(&mut control, "230 Logged in"),
                        "TYPE" => reply(&mut control, "200 Type set"),
                        "PASV" => {
                            let data = TcpListener::bind("127.0.0.1:0").unwrap();
                            let data_port = data.local_addr().unwrap().port();
                            reply(
                                &mut control,
                                &format!(
                                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                                    data_port / 256,
                                    data_port % 256
                                ),
                            );
                            data_listener = Some(data);
                        }
                        "NLST" | "RETR" => match (payload, data_listener.take()) {
                            (Some(bytes), Some(data)) => {
                                reply(&mut control, "150 Opening data connection");
                                let (mut stream, _) = data.accept().unwrap();
                                stream.write_all(bytes).unwrap();
                                drop(stream);
                                reply(&mut control, "226 Transfer complete");
                            }
                            _ => reply(&mut control, "550 No such file"),
                        },
                        "QUIT" => {
                            reply(&mut control, "221 Bye");
                            break;
                        }
                        _ => reply(&mut control, "502 Not implemented"),
                    }
                }
            }
            commands
        });
        (port, handle)
    }

    fn client(port: u16) -> LoggerFtpClient {
        LoggerFtpClient::new("127.0.0.1", port, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_list_dir_drops_blank_entries() {
        let (port, server) = ftp_server(1, "DATA001.GBD\r\n\r\nDATA002.CSV\r\n", &[]);

        let entries = client(port).list_dir("SD1\\DATA").await.unwrap();
        assert_eq!(entries, vec!["DATA001.GBD", "DATA002.CSV"]);

        let commands = server.join().unwrap();
        assert_eq!(commands[0], "USER anonymous");
        assert!(commands.contains(&"NLST SD1/DATA".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_get_file_writes_local_copy() {
        let (port, server) = ftp_server(1, "", &[("SD1/DATA/DATA002.CSV", b"ch1,ch2\r\n1.0,2.0\r\n")]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("pass_01").join("DATA002.CSV");

        let bytes = client(port)
            .get_file("SD1\\DATA\\DATA002.CSV", &local)
            .await
            .unwrap();
        assert_eq!(bytes, 18);
        assert_eq!(std::fs::read(&local).unwrap(), b"ch1,ch2\r\n1.0,2.0\r\n");

        let commands = server.join().unwrap();
        assert!(commands.contains(&"TYPE I".to_string()));
        assert!(commands.contains(&"RETR SD1/DATA/DATA002.CSV".to_string()));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_operation_error() {
        let (port, _server) = ftp_server(1, "", &[]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("missing.csv");

        let err = client(port).get_file("SD1/none.csv", &local).await.unwrap_err();
        assert!(matches!(err, RemoteError::Operation { operation: "download", .. }));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client(port).list_dir("SD1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Connect { .. }));
    }
}
