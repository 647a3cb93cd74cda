//! Wire protocol for Bellows <-> Worker / Relay communication.
//!
//! Every frame on the wire is a UTF-8 JSON text message of the shape
//! `{"type": <tag>, "payload": <object>}`. Tags are short snake_case ASCII
//! identifiers. Within one connection frames are delivered and processed in
//! send order; nothing is promised across connections.
//!
//! A single malformed frame is a recoverable decode error for the receiver,
//! never a reason to tear the connection down.

pub mod defaults;
pub mod error;
pub mod frame;
pub mod types;

pub use error::ProtocolError;
pub use frame::{Frame, ViewerFrame, MAX_FRAME_SIZE};
pub use types::{
    AuthFailPayload,
    AuthOkPayload,
    Capabilities,
    ErrorPhase,
    Forge,
    JobCompletePayload,
    JobErrorPayload,
    JobId,
    JobRef,
    JobRejectPayload,
    JobSpec,
    JobStatus,
    LogChunkPayload,
    LogStream,
    PingPayload,
    RegisterPayload,
    RegisteredPayload,
    RelayId,
    RelayReadyPayload,
    RelayRequestPayload,
    RelayResponsePayload,
    RepoPointer,
    RequestId,
    TrustLevel,
    WorkerId,
    WorkerMode,
};
