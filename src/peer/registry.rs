use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::ErrorKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("piece {0} is already being downloaded")]
    AlreadyClaimed(u32),
    #[error("piece {0} is already complete")]
    AlreadyComplete(u32),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    in_progress: HashSet<u32>,
    done: HashSet<u32>,
}

/// Tracks which pieces are being assembled or already verified, so that
/// concurrent sessions never work on the same index at once.
#[derive(Debug, Default)]
pub struct PieceRegistry {
    state: Mutex<RegistryState>,
}

/// Exclusive right to assemble one piece. Dropping it without calling
/// [`PieceClaim::complete`] frees the index for another session.
#[derive(Debug)]
pub struct PieceClaim {
    registry: Arc<PieceRegistry>,
    index: u32,
    completed: bool,
}

impl PieceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(PieceRegistry::default())
    }

    pub fn claim(self: &Arc<Self>, index: u32) -> Result<PieceClaim, RegistryError> {
        let mut state = self.state.lock();
        if state.done.contains(&index) {
            return Err(RegistryError::AlreadyComplete(index));
        }
        if !state.in_progress.insert(index) {
            return Err(RegistryError::AlreadyClaimed(index));
        }
        trace!(index, "piece claimed");
        Ok(PieceClaim { registry: Arc::clone(self), index, completed: false })
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.state.lock().done.contains(&index)
    }

    pub fn is_claimed(&self, index: u32) -> bool {
        self.state.lock().in_progress.contains(&index)
    }

    pub fn num_complete(&self) -> usize {
        self.state.lock().done.len()
    }
}

impl PieceClaim {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn complete(mut self) {
        let mut state = self.registry.state.lock();
        state.in_progress.remove(&self.index);
        state.done.insert(self.index);
        self.completed = true;
        trace!(index = self.index, "piece complete");
    }
}

impl Drop for PieceClaim {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.state.lock().in_progress.remove(&self.index);
            trace!(index = self.index, "piece released");
        }
    }
}
