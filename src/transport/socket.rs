//! Raw SCPI socket transport (`TCPIP0::<host>::<port>::SOCKET`).

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// TCP connection to an instrument's raw socket port.
pub struct SocketTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl SocketTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
        }
    }

    fn timeout_error(&self, operation: &'static str, timeout: Duration) -> TransportError {
        TransportError::Timeout {
            endpoint: self.endpoint(),
            operation,
            timeout,
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| self.timeout_error("connect", self.connect_timeout))?
            .map_err(|err| TransportError::OpenFailed {
                endpoint: self.endpoint(),
                reason: err.to_string(),
            })?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let endpoint = self.endpoint();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(endpoint.clone()))?;

        let result = tokio::time::timeout(timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!("Socket TX '{}': {} byte(s)", endpoint, data.len());
                Ok(())
            }
            Ok(Err(err)) => {
                self.stream = None;
                Err(TransportError::Io(err))
            }
            Err(_) => Err(self.timeout_error("write", timeout)),
        }
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let endpoint = self.endpoint();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(endpoint.clone()))?;

        let mut buffer = vec![0u8; READ_CHUNK];
        let first = match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                return Err(TransportError::Disconnected(endpoint));
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                self.stream = None;
                return Err(TransportError::Io(err));
            }
            Err(_) => return Err(self.timeout_error("read", timeout)),
        };
        buffer.truncate(first);

        // Drain whatever else is already buffered without waiting again.
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        debug!("Socket RX '{}': {} byte(s)", endpoint, buffer.len());
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 64];
            let n = socket.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"*IDN?\n");
            socket.write_all(b"ACME,MODEL1,0,1.0\n").await.unwrap();
        });

        let mut transport = SocketTransport::new("127.0.0.1", port, Duration::from_secs(1));
        transport.open().await.unwrap();
        assert!(transport.is_open());
        transport
            .write(b"*IDN?\n", Duration::from_secs(1))
            .await
            .unwrap();
        let reply = transport.read_available(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"ACME,MODEL1,0,1.0\n".to_vec());

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_times_out_when_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let mut transport = SocketTransport::new("127.0.0.1", port, Duration::from_secs(1));
        transport.open().await.unwrap();
        let err = transport
            .read_available(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_peer_close_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = SocketTransport::new("127.0.0.1", port, Duration::from_secs(1));
        transport.open().await.unwrap();
        server.await.unwrap();
        let err = transport
            .read_available(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
        assert!(!transport.is_open());
    }
}
