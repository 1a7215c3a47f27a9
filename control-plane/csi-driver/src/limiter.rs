//! Volume Concurrency Limiter Module
//!
//! The CO is responsible for ensuring that there is no more than one call in-flight per volume,
//! but it MAY lose that state when it restarts and issue overlapping calls. Overlapping calls
//! are rejected with ABORTED so the CO retries them once the first call completes.
use once_cell::sync::OnceCell;
use snafu::Snafu;
use std::{collections::HashSet, sync::Mutex};
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Existing Csi operation is in progress for volume: {}", id))]
    OperationInProgress { id: String },
    #[snafu(display("Volume id must not be empty"))]
    EmptyId,
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress { .. } => tonic::Status::aborted(error.to_string()),
            Error::EmptyId => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// Holds a reservation on a volume id for the duration of one controller operation.
/// The reservation is returned on drop.
#[derive(Debug)]
pub struct VolumeOpGuard {
    id: String,
}

impl VolumeOpGuard {
    /// Tries to take a new volume reservation and returns error if an existing
    /// operation is already in progress.
    pub fn new(id: &str) -> Result<Self, Error> {
        if id.is_empty() {
            return EmptyId.fail();
        }
        let mut inventory = volume_serializer()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !inventory.insert(id.to_string()) {
            trace!(volume.id = %id, "Operation already exists for volume");
            return OperationInProgress { id }.fail();
        }
        trace!(volume.id = %id, "New reservation");
        Ok(Self { id: id.to_string() })
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = volume_serializer()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inventory.remove(&self.id);
    }
}

/// Set of volume ids with an operation in flight.
fn volume_serializer() -> &'static Mutex<HashSet<String>> {
    static OPERATION_LIMITER: OnceCell<Mutex<HashSet<String>>> = OnceCell::new();

    OPERATION_LIMITER.get_or_init(|| Mutex::new(HashSet::new()))
}
