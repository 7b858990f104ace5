//! Error taxonomy for the NTFS engine.
//!
//! Every failure maps to one of five kinds: bad arguments, image I/O,
//! structural corruption, unsupported on-disk features, or an error raised
//! by a walk callback.

use thiserror::Error;

/// Broad classification of an [`NtfsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Io,
    Structural,
    Unsupported,
    Callback,
}

#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("record {record} is outside the valid range {first}..={last}")]
    OutOfRange { record: u64, first: u64, last: u64 },

    #[error("cluster {cluster} is beyond the last cluster {last}")]
    ClusterOutOfRange { cluster: u64, last: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("short read at byte {offset}: wanted {wanted} bytes, got {got}")]
    ReadError { offset: u64, wanted: usize, got: usize },

    #[error("read at byte {offset} starts beyond the image end ({image_size} bytes)")]
    ReadOutOfRange { offset: u64, image_size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt MFT entry {record}: {reason}")]
    CorruptRecord { record: u64, reason: String },

    #[error("corrupt structure: {0}")]
    Corrupt(String),

    #[error("not an NTFS file system: {0}")]
    NotNtfs(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("walk callback error: {0}")]
    Callback(String),

    #[error("{source} - {context}")]
    Context {
        context: String,
        #[source]
        source: Box<NtfsError>,
    },
}

pub type Result<T> = std::result::Result<T, NtfsError>;

impl NtfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NtfsError::OutOfRange { .. }
            | NtfsError::ClusterOutOfRange { .. }
            | NtfsError::InvalidArgument(_) => ErrorKind::Argument,
            NtfsError::ReadError { .. } | NtfsError::ReadOutOfRange { .. } | NtfsError::Io(_) => {
                ErrorKind::Io
            }
            NtfsError::CorruptRecord { .. } | NtfsError::Corrupt(_) | NtfsError::NotNtfs(_) => {
                ErrorKind::Structural
            }
            NtfsError::Unsupported(_) => ErrorKind::Unsupported,
            NtfsError::Callback(_) => ErrorKind::Callback,
            NtfsError::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error, with all context layers peeled off.
    pub fn root(&self) -> &NtfsError {
        match self {
            NtfsError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Appends a short "where did this happen" note to an error on its way up.
pub trait ErrorContext<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| NtfsError::Context {
            context: context.into(),
            source: Box::new(e),
        })
    }
}
