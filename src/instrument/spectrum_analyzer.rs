//! Keysight N90xx X-series signal analyzer.
//!
//! Screenshots are written by the analyzer into its own file system under
//! `<capture_dir>/<YYYYmmdd>/<name>_<YYYYmmddHHMMSS>.png`, then read back as an
//! IEEE 488.2 definite-length block.

use super::scpi_session::ScpiSession;
use super::{network_channel, Instrument};
use crate::config::SpectrumAnalyzerConfig;
use crate::error::{SessionError, TransportError};
use crate::protocol::scpi::{identity_regex, parse_float_list, quoted};
use crate::transport::TransportChannel;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

const NAME: &str = "Spectrum analyzer";

pub const IDENTITY_PATTERN: &str =
    r"Keysight Technologies,N90([0-9]{2})(A|B),MY([0-9]+),A([0-9]*).([0-9]{2}).([0-9]{2})";

/// Trace power paired with its frequency axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreqResponse {
    /// Hz
    pub frequency: Vec<f64>,
    /// dBm
    pub power: Vec<f64>,
}

/// Evenly spaced sweep frequencies; `None` for fewer than two points.
pub fn linear_frequencies(start: f64, stop: f64, points: usize) -> Option<Vec<f64>> {
    if points < 2 {
        return None;
    }
    let step = (stop - start) / (points - 1) as f64;
    Some((0..points).map(|i| start + step * i as f64).collect())
}

/// Upper bound on sweep points accepted from the instrument.
pub const MAX_SWEEP_POINTS: usize = 100_001;

fn sweep_point_count(points: f64) -> Option<usize> {
    if points.fract() != 0.0 || !(0.0..=MAX_SWEEP_POINTS as f64).contains(&points) {
        warn!("{}: implausible sweep point count {}", NAME, points);
        return None;
    }
    Some(points as usize)
}

/// Join path segments using the separator already present in `base`.
pub fn instrument_path(base: &str, segments: &[&str]) -> String {
    let separator = if base.contains('\\') { '\\' } else { '/' };
    let mut path = base.trim_end_matches(['\\', '/']).to_string();
    for segment in segments {
        path.push(separator);
        path.push_str(segment);
    }
    path
}

/// Screenshot location for a capture taken at `now`.
pub fn capture_path(capture_dir: &str, name: &str, now: DateTime<Local>) -> String {
    let day = now.format("%Y%m%d").to_string();
    let file = format!("{}_{}.png", name, now.format("%Y%m%d%H%M%S"));
    instrument_path(capture_dir, &[&day, &file])
}

pub struct SpectrumAnalyzer {
    session: ScpiSession,
    capture_dir: String,
}

impl SpectrumAnalyzer {
    pub fn new(channel: TransportChannel, capture_dir: impl Into<String>) -> Result<Self, regex::Error> {
        let session = ScpiSession::new(NAME, channel, identity_regex(IDENTITY_PATTERN)?)
            .with_terminators("\r\n", "\n");
        Ok(Self {
            session,
            capture_dir: capture_dir.into(),
        })
    }

    pub fn from_config(config: &SpectrumAnalyzerConfig) -> Result<Self, TransportError> {
        let channel = network_channel(&config.resource, config.timeout())?;
        Self::new(channel, config.capture_dir.clone())
            .map_err(|err| TransportError::UnsupportedResource(err.to_string()))
    }

    async fn query_number(&mut self, command: &str) -> Result<Option<f64>, SessionError> {
        let reply = self.session.query(command).await?;
        Ok(reply.and_then(|reply| reply.trim().parse::<f64>().ok()))
    }

    /// Sweep start frequency in Hz.
    pub async fn freq_start(&mut self) -> Result<Option<f64>, SessionError> {
        self.query_number("freq:start?").await
    }

    /// Sweep stop frequency in Hz.
    pub async fn freq_stop(&mut self) -> Result<Option<f64>, SessionError> {
        self.query_number("freq:stop?").await
    }

    /// Number of sweep points; `None` unless the reply is a whole number
    /// within the analyzer's range.
    pub async fn sweep_points(&mut self) -> Result<Option<usize>, SessionError> {
        let points = self.query_number("sweep:points?").await?;
        Ok(points.and_then(sweep_point_count))
    }

    pub async fn frequency_list(&mut self) -> Result<Option<Vec<f64>>, SessionError> {
        let Some(start) = self.freq_start().await? else {
            return Ok(None);
        };
        let Some(stop) = self.freq_stop().await? else {
            return Ok(None);
        };
        let Some(points) = self.sweep_points().await? else {
            return Ok(None);
        };
        Ok(linear_frequencies(start, stop, points))
    }

    /// Power values of trace 1-4.
    pub async fn trace(&mut self, trace: u8) -> Result<Option<Vec<f64>>, SessionError> {
        if !(1..=4).contains(&trace) {
            return Err(SessionError::InvalidArgument(format!(
                "trace {} out of range 1-4",
                trace
            )));
        }
        let reply = self
            .session
            .query(&format!("trace:data? trace{}", trace))
            .await?;
        Ok(reply.as_deref().and_then(parse_float_list))
    }

    /// Trace power with its frequency axis; `None` if the lengths disagree.
    pub async fn get_data(&mut self, trace: u8) -> Result<Option<FreqResponse>, SessionError> {
        let Some(frequency) = self.frequency_list().await? else {
            return Ok(None);
        };
        let Some(power) = self.trace(trace).await? else {
            return Ok(None);
        };
        if frequency.len() != power.len() {
            debug!(
                "{}: {} frequencies vs {} trace points",
                NAME,
                frequency.len(),
                power.len()
            );
            return Ok(None);
        }
        Ok(Some(FreqResponse { frequency, power }))
    }

    /// Same as pressing "Restart" on the front panel.
    pub async fn restart(&mut self) -> Result<bool, SessionError> {
        self.session.write("init").await
    }

    /// Create a directory on the analyzer.
    pub async fn make_dir(&mut self, path: &str) -> Result<bool, SessionError> {
        self.session
            .write(&format!("MMEM:MDIR {}", quoted(path)))
            .await
    }

    /// Save a screenshot on the analyzer and read back its PNG bytes.
    pub async fn get_capture(
        &mut self,
        name: &str,
        delete_after: bool,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let path = capture_path(&self.capture_dir, name, Local::now());
        let target = quoted(&path);

        if !self.session.write(&format!(":MMEM:STOR:SCR {}", target)).await? {
            return Ok(None);
        }
        let capture = self
            .session
            .query_block(&format!(":MMEM:DATA? {}", target))
            .await?;

        if delete_after {
            self.session.write(&format!(":MMEM:DEL {}", target)).await?;
        }

        if let Some(bytes) = &capture {
            info!("{}: captured '{}' ({} bytes)", NAME, path, bytes.len());
        }
        Ok(capture)
    }
}

#[async_trait]
impl Instrument for SpectrumAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    async fn open(&mut self) -> Result<bool, SessionError> {
        self.session.open().await
    }

    async fn close(&mut self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use chrono::TimeZone;
    use std::time::Duration;

    const IDN: &str = "Keysight Technologies,N9010B,MY55460123,A.26.07\n";

    async fn open_analyzer(mock: &MockTransport) -> SpectrumAnalyzer {
        mock.respond_to("*IDN?", IDN);
        let channel = TransportChannel::new(Box::new(mock.clone()), Duration::from_millis(50));
        let mut analyzer = SpectrumAnalyzer::new(channel, "D:\\capture").unwrap();
        assert!(analyzer.open().await.unwrap());
        mock.clear_log();
        analyzer
    }

    #[test]
    fn test_linear_frequencies() {
        assert_eq!(
            linear_frequencies(1.0e9, 2.0e9, 3),
            Some(vec![1.0e9, 1.5e9, 2.0e9])
        );
        assert_eq!(linear_frequencies(1.0e9, 2.0e9, 1), None);
    }

    #[test]
    fn test_capture_path() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            capture_path("D:\\capture\\", "obs", now),
            "D:\\capture\\20240309\\obs_20240309140507.png"
        );
        assert_eq!(
            capture_path("/data/capture", "obs", now),
            "/data/capture/20240309/obs_20240309140507.png"
        );
    }

    #[tokio::test]
    async fn test_get_data_pairs_trace_with_frequencies() {
        let mock = MockTransport::new("mock");
        let mut analyzer = open_analyzer(&mock).await;
        mock.respond_to("freq:start?", "1.000000000E+09\n");
        mock.respond_to("freq:stop?", "2.000000000E+09\n");
        mock.respond_to("sweep:points?", "3\n");
        mock.respond_to("trace:data? trace1", "-80.5,-40.25,-79.0\n");

        let data = analyzer.get_data(1).await.unwrap().unwrap();
        assert_eq!(data.frequency, vec![1.0e9, 1.5e9, 2.0e9]);
        assert_eq!(data.power, vec![-80.5, -40.25, -79.0]);
    }

    #[tokio::test]
    async fn test_get_data_length_mismatch() {
        let mock = MockTransport::new("mock");
        let mut analyzer = open_analyzer(&mock).await;
        mock.respond_to("freq:start?", "1E9\n");
        mock.respond_to("freq:stop?", "2E9\n");
        mock.respond_to("sweep:points?", "4\n");
        mock.respond_to("trace:data? trace2", "-80.5,-40.25,-79.0\n");
        assert_eq!(analyzer.get_data(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_implausible_sweep_points_rejected() {
        let mock = MockTransport::new("mock");
        let mut analyzer = open_analyzer(&mock).await;
        mock.respond_to("sweep:points?", "1.8446744E+19\n");
        assert_eq!(analyzer.sweep_points().await.unwrap(), None);
        assert_eq!(analyzer.frequency_list().await.unwrap(), None);
    }

    #[test]
    fn test_sweep_point_count() {
        assert_eq!(sweep_point_count(1001.0), Some(1001));
        assert_eq!(sweep_point_count(10.5), None);
        assert_eq!(sweep_point_count(-1.0), None);
        assert_eq!(sweep_point_count(f64::NAN), None);
        assert_eq!(sweep_point_count(MAX_SWEEP_POINTS as f64 + 1.0), None);
    }

    #[tokio::test]
    async fn test_trace_number_checked() {
        let mock = MockTransport::new("mock");
        let mut analyzer = open_analyzer(&mock).await;
        assert!(matches!(
            analyzer.trace(5).await,
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_reads_block_and_deletes() {
        let mock = MockTransport::new("mock");
        let mut analyzer = open_analyzer(&mock).await;
        mock.respond_to(":MMEM:DATA?", b"#18\x89PNG\r\n\x1a\n\n".to_vec());

        let capture = analyzer.get_capture("obs", true).await.unwrap().unwrap();
        assert_eq!(capture, b"\x89PNG\r\n\x1a\n".to_vec());

        let written = mock.written_text();
        assert_eq!(written.len(), 3);
        assert!(written[0].starts_with(":MMEM:STOR:SCR \"D:\\capture\\"));
        assert!(written[1].starts_with(":MMEM:DATA? "));
        assert!(written[2].starts_with(":MMEM:DEL "));
        assert!(written[2].ends_with(".png\""));
    }
}
