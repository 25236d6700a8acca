// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    id::{DiskId, SegmentId},
    version::Version,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A checksum stored alongside a record did not match the record's contents
    ChecksumMismatch {
        /// Segment the record lives in, if known
        segment: Option<SegmentId>,
    },

    /// Both checkpoint slots failed to validate; only expected on a first-boot device
    CheckpointCorrupt,

    /// A write was attempted against a disk this host does not hold the secret for
    NotWritable(DiskId),

    /// A log entry failed structural validation (bad parent, oversized head, ...)
    Validation(&'static str),

    /// A non-blocking lookup could not be completed without suspending
    ///
    /// Never surfaced past the delayed-lookup worker; see [`crate::btree::store`].
    WouldBlock,

    /// A replica peer violated the wire protocol
    ProtocolViolation(&'static str),

    /// A write-quorum round could not reach the required number of agreeing peers
    QuorumNotReached {
        /// Peers that agreed before the round was abandoned
        agreeing: usize,
        /// Peers required to agree
        threshold: usize,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CloudFsError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::InvalidVersion(_)
            | Self::ChecksumMismatch { .. }
            | Self::CheckpointCorrupt
            | Self::NotWritable(_)
            | Self::Validation(_)
            | Self::WouldBlock
            | Self::ProtocolViolation(_)
            | Self::QuorumNotReached { .. } => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
