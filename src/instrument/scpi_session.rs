//! Line-oriented SCPI session with identity verification.
//!
//! `open` connects the transport and issues `*IDN?`; the session only counts
//! as open when the reply fully matches the instrument's identity pattern. On a
//! mismatch the transport is closed again before `open` returns.

use super::Instrument;
use crate::error::SessionError;
use crate::protocol::scpi::{identity_matches, parse_definite_block, BlockStatus};
use crate::transport::TransportChannel;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

pub const IDENTITY_QUERY: &str = "*IDN?";

/// SCPI session over any transport.
pub struct ScpiSession {
    name: &'static str,
    channel: TransportChannel,
    identity: Regex,
    write_terminator: &'static str,
    read_terminator: &'static str,
    identified: bool,
    last_identity: Option<String>,
}

impl ScpiSession {
    /// `identity` must already be anchored (see [`crate::protocol::scpi::identity_regex`]).
    pub fn new(name: &'static str, channel: TransportChannel, identity: Regex) -> Self {
        Self {
            name,
            channel,
            identity,
            write_terminator: "\n",
            read_terminator: "\n",
            identified: false,
            last_identity: None,
        }
    }

    pub fn with_terminators(mut self, write: &'static str, read: &'static str) -> Self {
        self.write_terminator = write;
        self.read_terminator = read;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The most recent `*IDN?` reply, matching or not.
    pub fn last_identity(&self) -> Option<&str> {
        self.last_identity.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.channel.has_error()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::NotOpen(self.name))
        }
    }

    /// Send one command line.
    pub async fn write(&mut self, command: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.write_line(command).await)
    }

    async fn write_line(&mut self, command: &str) -> bool {
        debug!("{} <- {}", self.name, command);
        let line = format!("{}{}", command, self.write_terminator);
        self.channel.send(line.as_bytes()).await
    }

    /// Send a query and read one terminated reply.
    ///
    /// Transport failures are absorbed: the reply is `None` and the channel's
    /// error flag is set.
    pub async fn query(&mut self, command: &str) -> Result<Option<String>, SessionError> {
        self.ensure_open()?;
        Ok(self.query_line(command).await)
    }

    async fn query_line(&mut self, command: &str) -> Option<String> {
        if !self.write_line(command).await {
            return None;
        }
        let terminator = self.read_terminator.as_bytes().to_vec();
        let raw = self.read_until(&terminator).await?;
        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        debug!("{} -> {}", self.name, reply);
        Some(reply)
    }

    /// Read until the accumulated bytes end with `suffix`.
    pub async fn read_raw_until(&mut self, suffix: &[u8]) -> Result<Option<Vec<u8>>, SessionError> {
        self.ensure_open()?;
        Ok(self.read_until(suffix).await)
    }

    async fn read_until(&mut self, suffix: &[u8]) -> Option<Vec<u8>> {
        self.accumulate(|buffer| buffer.ends_with(suffix)).await
    }

    /// Read until `complete` accepts the accumulated bytes.
    pub async fn read_raw_until_complete<F>(&mut self, complete: F) -> Result<Option<Vec<u8>>, SessionError>
    where
        F: Fn(&[u8]) -> bool + Send,
    {
        self.ensure_open()?;
        Ok(self.accumulate(complete).await)
    }

    async fn accumulate<F>(&mut self, complete: F) -> Option<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool + Send,
    {
        let mut buffer = Vec::new();
        loop {
            let chunk = self.channel.receive_raw().await?;
            buffer.extend_from_slice(&chunk);
            if complete(&buffer) {
                return Some(buffer);
            }
        }
    }

    /// Drain and discard anything already buffered.
    pub async fn clear_input(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let stale = self.channel.discard_input().await;
        if stale > 0 {
            debug!("{}: discarded {} stale byte(s)", self.name, stale);
        }
        Ok(())
    }

    /// Send a query whose reply is an IEEE 488.2 definite-length block.
    pub async fn query_block(&mut self, command: &str) -> Result<Option<Vec<u8>>, SessionError> {
        self.ensure_open()?;
        if !self.write_line(command).await {
            return Ok(None);
        }

        let mut buffer = Vec::new();
        loop {
            match parse_definite_block(&buffer) {
                BlockStatus::Complete { start, len } => {
                    debug!("{} -> block of {} byte(s)", self.name, len);
                    return Ok(Some(buffer[start..start + len].to_vec()));
                }
                BlockStatus::Malformed => {
                    warn!("{}: malformed block reply to '{}'", self.name, command);
                    return Ok(None);
                }
                BlockStatus::Incomplete => match self.channel.receive_raw().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk),
                    None => return Ok(None),
                },
            }
        }
    }
}

#[async_trait]
impl Instrument for ScpiSession {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_open(&self) -> bool {
        self.identified && self.channel.is_open()
    }

    async fn open(&mut self) -> Result<bool, SessionError> {
        if self.is_open() {
            return Ok(true);
        }
        self.channel.open().await?;

        let reply = self.query_line(IDENTITY_QUERY).await;
        self.identified = reply
            .as_deref()
            .is_some_and(|reply| identity_matches(&self.identity, reply));
        self.last_identity = reply;

        if !self.identified {
            warn!(
                "{}: identity mismatch on '{}' (got {:?}); closing",
                self.name,
                self.channel.endpoint(),
                self.last_identity
            );
            self.channel.close().await;
        }
        Ok(self.identified)
    }

    async fn close(&mut self) {
        self.identified = false;
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::scpi::identity_regex;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn session(mock: &MockTransport) -> ScpiSession {
        let channel = TransportChannel::new(Box::new(mock.clone()), Duration::from_millis(50));
        ScpiSession::new("Test meter", channel, identity_regex(r"ACME,METER,[0-9]+").unwrap())
    }

    #[tokio::test]
    async fn test_open_requires_identity_match() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "ACME,METER,42\n");
        let mut session = session(&mock);
        assert!(session.open().await.unwrap());
        assert!(session.is_open());
        assert_eq!(session.last_identity(), Some("ACME,METER,42"));
    }

    #[tokio::test]
    async fn test_identity_mismatch_closes_transport() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "OTHER,THING,1\n");
        let mut session = session(&mock);
        assert!(!session.open().await.unwrap());
        assert!(!session.is_open());
        assert_eq!(mock.call_log().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_silent_instrument_is_not_open() {
        let mock = MockTransport::new("mock");
        let mut session = session(&mock);
        assert!(!session.open().await.unwrap());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_query_requires_open() {
        let mock = MockTransport::new("mock");
        let mut session = session(&mock);
        let err = session.query("fetc?").await.unwrap_err();
        assert!(matches!(err, SessionError::NotOpen("Test meter")));
    }

    #[tokio::test]
    async fn test_query_reassembles_split_reply() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "ACME,METER,42\n");
        let mut session = session(&mock);
        session.open().await.unwrap();

        mock.respond_to("fetc?", "-12.5");
        let handle = mock.clone();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.push_inbound("E+00\n");
        });
        let reply = session.query("fetc?").await.unwrap();
        feeder.await.unwrap();
        assert_eq!(reply.as_deref(), Some("-12.5E+00"));
    }

    #[tokio::test]
    async fn test_query_block() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "ACME,METER,42\n");
        mock.respond_to(":MMEM:DATA?", b"#14\x89PNG\n".to_vec());
        let mut session = session(&mock);
        session.open().await.unwrap();
        let block = session.query_block(":MMEM:DATA? \"a.png\"").await.unwrap();
        assert_eq!(block, Some(b"\x89PNG".to_vec()));
    }

    #[tokio::test]
    async fn test_timeout_yields_none_and_sets_error() {
        let mock = MockTransport::new("mock");
        mock.respond_to("*IDN?", "ACME,METER,42\n");
        let mut session = session(&mock);
        session.open().await.unwrap();
        assert_eq!(session.query("fetc?").await.unwrap(), None);
        assert!(session.has_error());
    }
}
