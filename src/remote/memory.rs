//! In-memory remote appliance for tests and dry runs.

use super::{CommandOutput, RemoteConnector, RemoteCredentials, RemoteSession};
use crate::error::RemoteError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

#[derive(Default)]
struct MemoryState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    created: Vec<String>,
    executed: Vec<(String, Option<String>)>,
    exec_output: CommandOutput,
    reject_login: bool,
    opened: usize,
    closed: usize,
}

impl MemoryState {
    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    fn add_ancestors(&mut self, path: &str) {
        let chain = super::ancestor_chain(path);
        for dir in chain.iter().take(chain.len().saturating_sub(1)) {
            self.dirs.insert(dir.clone());
        }
    }
}

/// Remote file tree held in memory. Clones share the same tree.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock();
        state.add_ancestors(path);
        state.dirs.insert(path.to_string());
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        state.add_ancestors(path);
        state.files.insert(path.to_string(), contents.to_vec());
    }

    /// Output returned by every subsequent `exec`.
    pub fn set_exec_output(&self, output: CommandOutput) {
        self.state.lock().exec_output = output;
    }

    pub fn reject_login(&self) {
        self.state.lock().reject_login = true;
    }

    pub fn created_dirs(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Commands run so far, with the stdin line each one received.
    pub fn executed(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().executed.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().closed
    }
}

impl RemoteConnector for MemoryConnector {
    fn connect(&self, credentials: &RemoteCredentials) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut state = self.state.lock();
        if state.reject_login {
            return Err(RemoteError::Authentication(credentials.username.clone()));
        }
        state.opened += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

impl RemoteSession for MemorySession {
    fn stat(&mut self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.state.lock().exists(path.trim_end_matches('/')))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
        let state = self.state.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children = state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter_map(|entry| entry.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if state.exists(path) {
            return Err(RemoteError::Operation {
                operation: "mkdir",
                reason: format!("'{}' already exists", path),
            });
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() && !state.dirs.contains(parent) {
                return Err(RemoteError::NotFound(parent.to_string()));
            }
        }
        state.dirs.insert(path.to_string());
        state.created.push(path.to_string());
        Ok(())
    }

    fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        let contents = self
            .state
            .lock()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))?;
        std::fs::write(local, &contents)?;
        Ok(contents.len() as u64)
    }

    fn exec(&mut self, command: &str, stdin_line: Option<&str>) -> Result<CommandOutput, RemoteError> {
        let mut state = self.state.lock();
        state
            .executed
            .push((command.to_string(), stdin_line.map(str::to_string)));
        Ok(state.exec_output.clone())
    }

    fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}
