use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::constants::{
    GROUP_MEMORY_EXCEEDED_CODE, INTERRUPTED_CODE, INVALID_ARGUMENT_CODE,
    SORT_LIMIT_MEMORY_EXCEEDED_CODE, SORT_MEMORY_EXCEEDED_CODE, SPILL_IO_ERROR_CODE,
};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Which stateful operator ran out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Grouping,
    Sorting,
    SortingWithLimit,
}

impl ResourceKind {
    pub fn code(self) -> i32 {
        match self {
            ResourceKind::Grouping => GROUP_MEMORY_EXCEEDED_CODE,
            ResourceKind::Sorting => SORT_MEMORY_EXCEEDED_CODE,
            ResourceKind::SortingWithLimit => SORT_LIMIT_MEMORY_EXCEEDED_CODE,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Grouping => write!(f, "$group"),
            ResourceKind::Sorting => write!(f, "$sort"),
            ResourceKind::SortingWithLimit => write!(f, "$sort with $limit"),
        }
    }
}

/// Errors surfaced by the aggregation engine.
///
/// None of these are transient: the same input and configuration fails the
/// same way every time, so callers should not retry.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Exceeded memory limit of {ceiling} bytes for {kind}: {detail}")]
    ResourceExceeded {
        kind: ResourceKind,
        ceiling: usize,
        detail: String,
    },

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Spill I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt spill record in {}: {source}", path.display())]
    RunFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn resource_exceeded(kind: ResourceKind, ceiling: usize, detail: impl Into<String>) -> Self {
        EngineError::ResourceExceeded {
            kind,
            ceiling,
            detail: detail.into(),
        }
    }

    /// The standard failure when an operator outgrows its budget and the
    /// request did not permit external storage.
    pub fn disk_use_required(kind: ResourceKind, ceiling: usize) -> Self {
        Self::resource_exceeded(
            kind,
            ceiling,
            "external storage is disabled, pass allowDiskUse:true to opt in",
        )
    }

    pub fn io(path: &Path, source: io::Error) -> Self {
        EngineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn run_format(path: &Path, source: serde_json::Error) -> Self {
        EngineError::RunFormat {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            EngineError::InvalidArgument { .. } => INVALID_ARGUMENT_CODE,
            EngineError::ResourceExceeded { kind, .. } => kind.code(),
            EngineError::Interrupted => INTERRUPTED_CODE,
            EngineError::Io { .. } | EngineError::RunFormat { .. } => SPILL_IO_ERROR_CODE,
        }
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            EngineError::ResourceExceeded { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, EngineError::InvalidArgument { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_codes() {
        assert_eq!(ResourceKind::Grouping.code(), 16945);
        assert_eq!(ResourceKind::Sorting.code(), 16819);
        assert_eq!(ResourceKind::SortingWithLimit.code(), 16820);

        let err = EngineError::disk_use_required(ResourceKind::Sorting, 1024);
        assert_eq!(err.code(), 16819);
        assert_eq!(err.resource_kind(), Some(ResourceKind::Sorting));
        assert!(err.to_string().contains("allowDiskUse"));
    }

    #[test]
    fn test_invalid_argument() {
        let err = EngineError::invalid_argument("allowDiskUse must be a boolean");
        assert!(err.is_invalid_argument());
        assert_eq!(err.code(), 2);
        assert_eq!(err.resource_kind(), None);
        assert_eq!(err.to_string(), "Invalid argument: allowDiskUse must be a boolean");
    }
}
