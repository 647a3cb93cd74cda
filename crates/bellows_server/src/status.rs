//! Commit-status posting collaborator.

use bellows_storage::JobRecord;
use tracing::debug;

/// Invoked once per job on its terminal frame, after the status is
/// persisted. Implementations talk to the forge; anything slow should spawn
/// and return. Failures are the implementation's problem to log - the
/// control plane does not retry.
pub trait StatusPoster: Send + Sync {
    fn post(&self, job: &JobRecord);
}

/// Posts nothing. Used in tests and in deployments without forge
/// credentials.
pub struct NoopStatusPoster;

impl StatusPoster for NoopStatusPoster {
    fn post(&self, job: &JobRecord) {
        debug!("No status poster configured; job {} finished as {}", job.id, job.status);
    }
}
