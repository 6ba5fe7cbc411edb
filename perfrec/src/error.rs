use crate::{
    config::ConfigErrors,
    database::ConnectionError,
    entity::{EntityType, ID},
    protocol::ProtocolError,
    sequence::OffsetError,
};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Coarse classification the CLI uses to decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolMismatch,
    DanglingReference,
    BackendFailure,
    MalformedField,
    Io,
    Config,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{referrer} references {entity} with local id {local}, which was never staged")]
    DanglingReference {
        entity: EntityType,
        local: ID,
        referrer: EntityType,
    },
    #[error("{referrer} references {entity} with local id {local}, which was staged after it")]
    StagedAfterReferrer {
        entity: EntityType,
        local: ID,
        referrer: EntityType,
    },
    #[error("Local id {local} of {entity} resolves to both {first} and {second}")]
    LocalIdConflict {
        entity: EntityType,
        local: ID,
        first: ID,
        second: ID,
    },
    #[error("{entity} value {value} is not finite")]
    NonFiniteValue { entity: EntityType, value: f64 },
    #[error("Backend failure")]
    Backend(#[from] ConnectionError),
    #[error("Failed to handle sequence offsets")]
    Offsets(#[from] OffsetError),
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to access {path:?}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to merge {path:?}")]
    File {
        path: PathBuf,
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(error) => error.kind(),
            Self::DanglingReference { .. }
            | Self::StagedAfterReferrer { .. }
            | Self::LocalIdConflict { .. } => ErrorKind::DanglingReference,
            Self::NonFiniteValue { .. } => ErrorKind::MalformedField,
            Self::Backend(_) => ErrorKind::BackendFailure,
            Self::Offsets(_) | Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::File { source, .. } => source.kind(),
        }
    }

    /// Attach the log file the error happened in
    pub fn in_file(self, path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            source: Box::new(self),
        }
    }
}
