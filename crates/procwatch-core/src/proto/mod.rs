//! Report wire types and framing.
//!
//! The collector RPC is a single framed exchange: the agent sends one
//! [`Report`] message and reads back one [`Ack`]. Messages are
//! protobuf-encoded and carried in length-prefixed frames (see
//! [`FrameCodec`]). Opaque byte fields hold the stable JSON serialisation of
//! the corresponding agent-side structures.

mod framing;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Size of the rejected frame.
        size: usize,
        /// The configured limit.
        max: usize,
    },

    /// Underlying transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why the supervised process was killed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum KillReason {
    /// No kill occurred.
    Unspecified = 0,
    /// The kill timeout elapsed.
    Timeout = 1,
    /// Resident memory exceeded the kill threshold.
    Memory = 2,
    /// An interrupt or terminate signal was forwarded.
    Signal = 3,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unspecified => "unspecified",
            Self::Timeout => "timeout",
            Self::Memory => "memory",
            Self::Signal => "signal",
        };
        write!(f, "{name}")
    }
}

/// Why a report was generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReportReason {
    /// Reserved zero value.
    Unspecified = 0,
    /// The process exited successfully.
    Success = 1,
    /// The process exited with a failure status.
    Failure = 2,
    /// A rule matched the process output.
    Alert = 3,
    /// The rule match rate exceeded the configured threshold.
    AlertRate = 4,
    /// Resident memory exceeded the warning threshold.
    MemoryWarning = 5,
    /// Run time exceeded the warning threshold.
    TimeWarning = 6,
    /// An expected artifact file was not created.
    FileNotCreated = 7,
    /// The process was killed.
    Killed = 8,
    /// A daemon-mode process started.
    Start = 9,
}

impl std::fmt::Display for ReportReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unspecified => "unspecified",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Alert => "alert",
            Self::AlertRate => "alert_rate",
            Self::MemoryWarning => "memory_warning",
            Self::TimeWarning => "time_warning",
            Self::FileNotCreated => "file_not_created",
            Self::Killed => "killed",
            Self::Start => "start",
        };
        write!(f, "{name}")
    }
}

/// A telemetry report describing one supervised run.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Report {
    /// Monitor identifier connecting the report to its notification
    /// channels.
    #[prost(string, tag = "1")]
    pub id: String,

    /// Hostname of the machine running the agent.
    #[prost(string, tag = "2")]
    pub hostname: String,

    /// Most recent stdout lines, oldest first.
    #[prost(string, repeated, tag = "3")]
    pub stdout: Vec<String>,

    /// Most recent stderr lines, oldest first.
    #[prost(string, repeated, tag = "4")]
    pub stderr: Vec<String>,

    /// Whether the process exited successfully.
    #[prost(bool, tag = "5")]
    pub success: bool,

    /// Peak resident memory observed, in kilobytes.
    #[prost(uint64, tag = "6")]
    pub max_memory: u64,

    /// Whether the agent killed the process.
    #[prost(bool, tag = "7")]
    pub killed: bool,

    /// Why the process was killed, when `killed` is set.
    #[prost(enumeration = "KillReason", tag = "8")]
    pub kill_reason: i32,

    /// JSON-encoded artifact file descriptors.
    #[prost(bytes = "vec", tag = "9")]
    pub created: Vec<u8>,

    /// Why this report was generated.
    #[prost(enumeration = "ReportReason", tag = "10")]
    pub report_reason: i32,

    /// Process start, epoch seconds.
    #[prost(int64, tag = "11")]
    pub start: i64,

    /// Process finish, epoch seconds; zero while still running.
    #[prost(int64, tag = "12")]
    pub finish: i64,

    /// Human-readable run duration.
    #[prost(string, tag = "13")]
    pub duration: String,

    /// Process exit code, meaningful when `exit_code_valid` is set.
    #[prost(int32, tag = "14")]
    pub exit_code: i32,

    /// Whether `exit_code` was recoverable from the exit status.
    #[prost(bool, tag = "15")]
    pub exit_code_valid: bool,

    /// Diagnostic messages accumulated during the run.
    #[prost(string, repeated, tag = "16")]
    pub messages: Vec<String>,

    /// JSON-encoded rule matches.
    #[prost(bytes = "vec", tag = "17")]
    pub matches: Vec<u8>,

    /// The supervised command, joined into one string.
    #[prost(string, tag = "18")]
    pub user_command: String,

    /// JSON-encoded configuration snapshot.
    #[prost(bytes = "vec", tag = "19")]
    pub config: Vec<u8>,

    /// When the report was built, epoch seconds.
    #[prost(int64, tag = "20")]
    pub created_at: i64,
}

/// Collector acknowledgment for a report.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Ack {
    /// Whether the collector accepted the report.
    #[prost(bool, tag = "1")]
    pub success: bool,
}
