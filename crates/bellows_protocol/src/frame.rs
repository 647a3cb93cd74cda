//! The `{type, payload}` envelope and its codec.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::error::ProtocolError;
use crate::types::{
    AuthFailPayload, AuthOkPayload, JobCompletePayload, JobErrorPayload, JobRef,
    JobRejectPayload, JobSpec, JobStatus, LogChunkPayload, LogStream, PingPayload,
    RegisterPayload, RegisteredPayload, RelayReadyPayload, RelayRequestPayload,
    RelayResponsePayload,
};

/// Maximum encoded frame size (1 MiB). Larger frames are refused on both
/// encode and decode.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Every message on a worker or relay connection.
///
/// Serialized as `{"type": <tag>, "payload": <obj>}`; unit variants omit the
/// payload field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    // Server -> Worker (handshake)
    AuthOk(AuthOkPayload),
    AuthFail(AuthFailPayload),

    // Worker -> Server (handshake)
    Register(RegisterPayload),

    // Server -> Worker (handshake ack)
    Registered(RegisteredPayload),

    // Worker <-> Server (heartbeat)
    Ping(PingPayload),
    Pong,

    // Server -> Worker (assignment)
    JobAssign(JobSpec),

    // Worker -> Server (assignment response)
    JobAck(JobRef),
    JobReject(JobRejectPayload),

    // Worker -> Server (execution)
    JobStarted(JobRef),
    LogChunk(LogChunkPayload),
    JobComplete(JobCompletePayload),
    JobError(JobErrorPayload),

    // Server -> Worker (control)
    JobCancel(JobRef),
    WorkerDrain,
    WorkerKill,

    // Server <-> Relay (tunneled HTTP)
    RelayReady(RelayReadyPayload),
    RelayRequest(RelayRequestPayload),
    RelayResponse(RelayResponsePayload),

    // Server -> Worker (generic ack for terminal frames)
    Ack(JobRef),
}

impl Frame {
    /// Encode to the wire text representation.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(text)
    }

    /// Decode one wire text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::AuthOk(_) => "auth_ok",
            Frame::AuthFail(_) => "auth_fail",
            Frame::Register(_) => "register",
            Frame::Registered(_) => "registered",
            Frame::Ping(_) => "ping",
            Frame::Pong => "pong",
            Frame::JobAssign(_) => "job_assign",
            Frame::JobAck(_) => "job_ack",
            Frame::JobReject(_) => "job_reject",
            Frame::JobStarted(_) => "job_started",
            Frame::LogChunk(_) => "log_chunk",
            Frame::JobComplete(_) => "job_complete",
            Frame::JobError(_) => "job_error",
            Frame::JobCancel(_) => "job_cancel",
            Frame::WorkerDrain => "worker_drain",
            Frame::WorkerKill => "worker_kill",
            Frame::RelayReady(_) => "relay_ready",
            Frame::RelayRequest(_) => "relay_request",
            Frame::RelayResponse(_) => "relay_response",
            Frame::Ack(_) => "ack",
        }
    }
}

/// Frames pushed to log viewers on `/ws/logs/<job>`.
///
/// A viewer sees zero or more `log` frames followed by exactly one `status`
/// frame, after which the connection is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerFrame {
    Log {
        stream: LogStream,
        data: String,
        time: DateTime<Utc>,
    },
    Status {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
    },
}

impl ViewerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, WorkerId};

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::LogChunk(LogChunkPayload {
            job_id: JobId::from("job-1"),
            stream: LogStream::Stderr,
            data: "warning: unused variable\n".to_string(),
        });
        let text = frame.encode().unwrap();
        let decoded = Frame::decode(&text).unwrap();
        match decoded {
            Frame::LogChunk(chunk) => {
                assert_eq!(chunk.job_id, JobId::from("job-1"));
                assert_eq!(chunk.stream, LogStream::Stderr);
                assert_eq!(chunk.data, "warning: unused variable\n");
            }
            other => panic!("wrong variant: {}", other.tag()),
        }
    }

    #[test]
    fn frame_wire_shape() {
        let frame = Frame::Registered(RegisteredPayload {
            worker_id: WorkerId::new("user:alice@example.com:buildbox"),
        });
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["payload"]["worker_id"], "user:alice@example.com:buildbox");
    }

    #[test]
    fn unit_frame_has_no_payload() {
        let text = Frame::Pong.encode().unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
        assert!(matches!(Frame::decode(&text).unwrap(), Frame::Pong));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Frame::decode("not json").is_err());
        assert!(Frame::decode(r#"{"type":"no_such_frame"}"#).is_err());
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let text = format!(
            r#"{{"type":"log_chunk","payload":{{"job_id":"j","stream":"stdout","data":"{}"}}}}"#,
            "x".repeat(MAX_FRAME_SIZE)
        );
        assert!(matches!(
            Frame::decode(&text),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn viewer_status_frame_shape() {
        let frame = ViewerFrame::Status {
            status: JobStatus::Success,
            exit_code: Some(0),
        };
        let value: serde_json::Value =
            serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "success");
        assert_eq!(value["exit_code"], 0);

        // exit_code is omitted entirely for statuses that never had one
        let frame = ViewerFrame::Status {
            status: JobStatus::Error,
            exit_code: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert!(value.get("exit_code").is_none());
    }
}
