//! REST control of the recorder and modem appliances.
//!
//! Both appliances expose their objects as typed "attributes" under
//! `/rest/<object>/...`; every value travels wrapped as
//! `{"factory": "Attribute", "factoryType": <type>, "value": <value>}`.

use crate::config::{ModemConfig, RecorderConfig};
use crate::error::RemoteError;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const START_RECORDING: &str = "rest/dataRecorder5/_procedure/startRecording";
const STOP_RECORDING: &str = "rest/dataRecorder5/_procedure/stopRecording";
const EXPECTED_MODCOD: &str = "rest/demodulatorWb1/_attribute/dvbs2ModCodExpected";

/// Recordings start as soon as the request arrives.
const IMMEDIATE_START: &str = "1970-01-01 00:00:00";

fn attribute(factory_type: &str, value: Value) -> Value {
    json!({
        "factory": "Attribute",
        "factoryType": factory_type,
        "value": value,
    })
}

fn build_client(timeout: Duration) -> Result<Client, RemoteError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| RemoteError::Http {
            url: String::new(),
            reason: err.to_string(),
        })
}

fn http_error(url: &str, err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Http {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// DVB-S2 MODCOD index to the modem's expected-modcod label.
pub fn modcod_name(modcod: u8) -> Option<&'static str> {
    match modcod {
        13 => Some("8PSK 2/3"),
        15 => Some("8PSK 5/6"),
        _ => None,
    }
}

/// Data recorder REST endpoint.
#[derive(Debug, Clone)]
pub struct RecorderClient {
    client: Client,
    base_url: String,
}

impl RecorderClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    pub fn from_config(config: &RecorderConfig) -> Result<Self, RemoteError> {
        Self::new(
            &config.rest.host,
            config.rest.port,
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// Stop any running recording. Returns the HTTP status code.
    pub async fn stop_recording(&self) -> Result<u16, RemoteError> {
        let url = self.url(STOP_RECORDING);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|err| http_error(&url, err))?;
        info!("Recorder: stop recording -> {}", response.status());
        Ok(response.status().as_u16())
    }

    /// Start a new recording session, stopping the current one first.
    ///
    /// Returns `true` when the recorder acknowledged the start.
    pub async fn start_recording(
        &self,
        session_name: &str,
        description: &str,
        duration_s: i64,
    ) -> Result<bool, RemoteError> {
        if session_name.is_empty() {
            return Err(RemoteError::InvalidRequest(
                "session name must not be empty".to_string(),
            ));
        }
        self.stop_recording().await?;

        let url = self.url(START_RECORDING);
        let payload = json!({
            "sessionName": attribute("string", json!(session_name)),
            "sessionDesc": attribute("string", json!(description)),
            "startTime": attribute("time", json!(IMMEDIATE_START)),
            "duration": attribute("int64", json!(duration_s)),
        });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| http_error(&url, err))?;
        let body: Value = response.json().await.map_err(|err| http_error(&url, err))?;

        let accepted = body
            .pointer("/startRecordingResponse/value")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if accepted {
            info!("Recorder: session '{}' started ({} s)", session_name, duration_s);
        } else {
            warn!("Recorder rejected session '{}': {}", session_name, body);
        }
        Ok(accepted)
    }
}

/// Satellite modem REST endpoint.
#[derive(Debug, Clone)]
pub struct ModemClient {
    client: Client,
    base_url: String,
}

impl ModemClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    pub fn from_config(config: &ModemConfig) -> Result<Self, RemoteError> {
        Self::new(
            &config.rest.host,
            config.rest.port,
            Duration::from_millis(config.timeout_ms),
        )
    }

    /// Set the MODCOD the demodulator expects. Only 13 and 15 are supported.
    pub async fn set_modcod(&self, modcod: u8) -> Result<u16, RemoteError> {
        let name = modcod_name(modcod).ok_or_else(|| {
            RemoteError::InvalidRequest(format!("unsupported MODCOD {}", modcod))
        })?;
        let url = format!("{}/{}", self.base_url, EXPECTED_MODCOD);
        let payload = json!({ "dvbs2ModCodExpected": attribute("string", json!(name)) });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| http_error(&url, err))?;
        info!("Modem: expected MODCOD {} -> {}", name, response.status());
        Ok(response.status().as_u16())
    }
}
