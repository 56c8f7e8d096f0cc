//! Protocol messages.
//!
//! Every message travels as a [`Frame`]: a small-integer tag selecting the
//! variant and a JSON payload holding its fields. Tags are fixed and never
//! reused; requests use `1..16`, responses `16..32` and notifications
//! `32..48`.

use std::fmt;

use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::{JobSettings, LimitKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tagged message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Variant discriminant.
    pub t: u8,
    /// Variant fields.
    pub b: Value,
}

/// A message that can be carried in a [`Frame`].
pub trait Wire: Sized {
    /// Converts the message into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn to_frame(&self) -> Result<Frame>;

    /// Rebuilds a message from a frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown tags or malformed payloads.
    fn from_frame(frame: Frame) -> Result<Self>;
}

/// Client requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Create or update a job, optionally subscribing to its notifications.
    MonitorJob {
        /// Job name.
        name: String,
        /// Whether the connection becomes a subscriber of the job.
        subscribe: bool,
        /// Limits to apply, merged onto existing ones.
        settings: JobSettings,
    },
    /// Look up the job a process belongs to.
    GetJobName {
        /// Process to look up.
        pid: u32,
    },
    /// Look up the settings of a job.
    GetJobSettings {
        /// Job to look up.
        name: String,
    },
}

const REQUEST_TAGS: &[(u8, &str)] = &[(1, "MonitorJob"), (2, "GetJobName"), (3, "GetJobSettings")];

/// Supervisor responses, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The job was created or updated.
    MonitorJob {
        /// Resolved job name.
        name: String,
    },
    /// Job of the queried process; empty if the process is not governed.
    GetJobName {
        /// Job name, or empty.
        name: String,
    },
    /// Settings of the queried job.
    GetJobSettings {
        /// Echo of the queried name; empty if the job is unknown.
        name: String,
        /// Stored settings; default if the job is unknown.
        settings: JobSettings,
    },
    /// The request failed.
    Error {
        /// Description of the failure.
        message: String,
    },
}

const RESPONSE_TAGS: &[(u8, &str)] = &[
    (16, "MonitorJob"),
    (17, "GetJobName"),
    (18, "GetJobSettings"),
    (19, "Error"),
];

/// Unsolicited job events pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A process joined the job.
    NewProcess {
        /// Job name.
        name: String,
        /// Joining process.
        pid: u32,
    },
    /// A member process exited.
    ExitProcess {
        /// Job name.
        name: String,
        /// Exited process.
        pid: u32,
        /// Whether the process exited abnormally.
        abnormal: bool,
    },
    /// A job-wide limit was exceeded.
    JobLimitExceeded {
        /// Job name.
        name: String,
        /// Exceeded limit.
        kind: LimitKind,
    },
    /// A per-process limit was exceeded.
    ProcessLimitExceeded {
        /// Job name.
        name: String,
        /// Offending process.
        pid: u32,
        /// Exceeded limit.
        kind: LimitKind,
    },
    /// The job has no member left. Always the last event of a job.
    NoActiveProcesses {
        /// Job name.
        name: String,
    },
}

const NOTIFICATION_TAGS: &[(u8, &str)] = &[
    (32, "NewProcess"),
    (33, "ExitProcess"),
    (34, "JobLimitExceeded"),
    (35, "ProcessLimitExceeded"),
    (36, "NoActiveProcesses"),
];

impl Notification {
    /// Name of the job the event concerns.
    #[must_use]
    pub fn job_name(&self) -> &str {
        match self {
            Self::NewProcess { name, .. }
            | Self::ExitProcess { name, .. }
            | Self::JobLimitExceeded { name, .. }
            | Self::ProcessLimitExceeded { name, .. }
            | Self::NoActiveProcesses { name } => name,
        }
    }

    /// Returns whether no further event follows for this job.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::NoActiveProcesses { .. })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewProcess { name, pid } => write!(f, "[{name}] process {pid} started"),
            Self::ExitProcess {
                name,
                pid,
                abnormal: false,
            } => write!(f, "[{name}] process {pid} exited"),
            Self::ExitProcess { name, pid, .. } => {
                write!(f, "[{name}] process {pid} exited abnormally")
            }
            Self::JobLimitExceeded { name, kind } => {
                write!(f, "[{name}] job exceeded its {kind} limit")
            }
            Self::ProcessLimitExceeded { name, pid, kind } => {
                write!(f, "[{name}] process {pid} exceeded its {kind} limit")
            }
            Self::NoActiveProcesses { name } => write!(f, "[{name}] no active processes left"),
        }
    }
}

/// Anything the supervisor sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Reply to the connection's last request.
    Response(Response),
    /// Pushed job event.
    Notification(Notification),
}

fn encode_variant<T: Serialize>(tags: &[(u8, &str)], message: &T) -> Result<Frame> {
    let Value::Object(map) = serde_json::to_value(message)? else {
        return Err(ProcgovError::protocol("message variant without fields"));
    };
    let Some((variant, body)) = map.into_iter().next() else {
        return Err(ProcgovError::protocol("empty message"));
    };
    let t = tags
        .iter()
        .find_map(|&(tag, name)| (name == variant).then_some(tag))
        .ok_or_else(|| ProcgovError::protocol(format!("no tag for variant {variant}")))?;
    Ok(Frame { t, b: body })
}

fn decode_variant<T: DeserializeOwned>(tags: &[(u8, &str)], frame: Frame) -> Result<T> {
    let variant = tags
        .iter()
        .find_map(|&(tag, name)| (tag == frame.t).then_some(name))
        .ok_or_else(|| ProcgovError::protocol(format!("unexpected message tag {}", frame.t)))?;
    let mut map = Map::with_capacity(1);
    let _ = map.insert(variant.to_owned(), frame.b);
    serde_json::from_value(Value::Object(map))
        .map_err(|e| ProcgovError::protocol(format!("malformed {variant} payload: {e}")))
}

fn has_tag(tags: &[(u8, &str)], t: u8) -> bool {
    tags.iter().any(|&(tag, _)| tag == t)
}

impl Wire for Request {
    fn to_frame(&self) -> Result<Frame> {
        encode_variant(REQUEST_TAGS, self)
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        decode_variant(REQUEST_TAGS, frame)
    }
}

impl Wire for Response {
    fn to_frame(&self) -> Result<Frame> {
        encode_variant(RESPONSE_TAGS, self)
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        decode_variant(RESPONSE_TAGS, frame)
    }
}

impl Wire for Notification {
    fn to_frame(&self) -> Result<Frame> {
        encode_variant(NOTIFICATION_TAGS, self)
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        decode_variant(NOTIFICATION_TAGS, frame)
    }
}

impl Wire for ServerMessage {
    fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::Response(response) => response.to_frame(),
            Self::Notification(notification) => notification.to_frame(),
        }
    }

    fn from_frame(frame: Frame) -> Result<Self> {
        if has_tag(NOTIFICATION_TAGS, frame.t) {
            Notification::from_frame(frame).map(Self::Notification)
        } else {
            Response::from_frame(frame).map(Self::Response)
        }
    }
}

impl From<Response> for ServerMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}
