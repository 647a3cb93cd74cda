//! Normative timing and sizing defaults shared by server and workers.

use std::time::Duration;

/// Server-side keep-alive interval on worker connections.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Inbound deadline on a worker connection; reset on every received frame.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(90);
/// Deadline for a single outbound frame write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// A worker whose last ping is older than this is evicted.
pub const STALE_AFTER: Duration = Duration::from_secs(90);
/// A queued job older than this is errored out.
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// How long the relay ingress waits for a tunneled response.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(30);
/// Dispatcher assignment loop tick.
pub const DISPATCH_TICK: Duration = Duration::from_secs(1);
/// Stale-worker and queue-timeout sweep interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on each worker's outbound frame queue.
pub const OUTBOUND_QUEUE: usize = 256;
