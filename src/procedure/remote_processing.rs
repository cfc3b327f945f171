//! Remote processing: run the recorder's processing script for a session,
//! then pull its output files back to the local machine.

use super::Interrupted;
use crate::remote::{normalize_path, CommandOutput, RemoteSessionAdapter};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRequest {
    pub session_name: String,
    /// Script working directory, relative to the remote home
    pub script_dir: String,
    /// Script path, relative to the remote home
    pub script: String,
    /// Directory whose files are fetched once the script has run
    pub output_dir: String,
    pub local_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub script: Option<CommandOutput>,
    pub fetched: Vec<PathBuf>,
}

/// Run one processing pass, checking for cancellation between steps.
///
/// A failure after the script has run keeps the script output and the files
/// already fetched.
pub async fn run_remote_processing(
    remote: RemoteSessionAdapter,
    request: ProcessingRequest,
    token: CancellationToken,
) -> Result<ProcessingResult, Interrupted<ProcessingResult>> {
    let mut result = ProcessingResult::default();
    if token.is_cancelled() {
        return Ok(result);
    }

    let output = remote
        .run_script(&request.script_dir, &request.script, &request.session_name)
        .await
        .map_err(|err| Interrupted::new(err, ProcessingResult::default()))?;
    if output.exit_status != 0 {
        warn!(
            "Processing script for '{}' exited with {}",
            request.session_name, output.exit_status
        );
    }
    result.script = Some(output);

    if token.is_cancelled() {
        info!("Remote processing cancelled after the script ran");
        return Ok(result);
    }

    let output_dir = normalize_path(&request.output_dir);
    let entries = match remote.list_directory(&output_dir).await {
        Ok(entries) => entries,
        Err(err) => return Err(Interrupted::new(err, result)),
    };
    for name in entries {
        if token.is_cancelled() {
            info!(
                "Remote processing cancelled after {} file(s)",
                result.fetched.len()
            );
            break;
        }
        let local = request.local_dir.join(&name);
        let remote_path = format!("{}/{}", output_dir.trim_end_matches('/'), name);
        if let Err(err) = remote.fetch_file(&remote_path, &local).await {
            warn!(
                "Remote processing stopped after {} file(s): {}",
                result.fetched.len(),
                err
            );
            return Err(Interrupted::new(err, result));
        }
        result.fetched.push(local);
    }
    Ok(result)
}
