//! Error taxonomy for the watch engine

use crate::event::WatchTargetId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the watch engine
///
/// Registration errors are returned to the caller. Runtime conditions such
/// as overflow are recovered internally and only surface through target
/// status and logs.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The path does not exist or cannot be read
    #[error("invalid watch path {}: {source}", .path.display())]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The exact root is already registered
    #[error("{} is already watched by target {existing}", .path.display())]
    DuplicateWatch {
        path: PathBuf,
        existing: WatchTargetId,
    },

    /// An exclude pattern failed to compile
    #[error("invalid exclude pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The native backend refused to subscribe a path
    #[error("native backend refused {}: {reason}", .path.display())]
    BackendSubscription { path: PathBuf, reason: String },

    /// No target with this id is registered
    #[error("unknown watch target {0}")]
    UnknownTarget(WatchTargetId),

    /// The watched root is gone and could not be observed again
    #[error("watch root {} is gone", .0.display())]
    RootLost(PathBuf),

    /// A pipeline thread could not be spawned or joined
    #[error("pipeline failure: {0}")]
    Pipeline(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_messages_name_the_path() {
        let err = WatchError::DuplicateWatch {
            path: Path::new("/srv/data").to_path_buf(),
            existing: WatchTargetId::new(3),
        };
        assert_eq!(err.to_string(), "/srv/data is already watched by target #3");

        let err = WatchError::RootLost(Path::new("/srv/gone").to_path_buf());
        assert!(err.to_string().contains("/srv/gone"));
    }

    #[test]
    fn test_invalid_path_keeps_io_source() {
        use std::error::Error as _;

        let err = WatchError::InvalidPath {
            path: Path::new("/missing").to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.source().is_some());
    }
}
