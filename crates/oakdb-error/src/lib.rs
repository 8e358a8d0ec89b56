use thiserror::Error;

/// Primary error type for OakDB operations.
///
/// Variants are grouped by how the caller should react: transient errors are
/// retriable after rolling back, logical errors leave the transaction usable,
/// resource errors may clear after freeing space, and fatal errors mark the
/// engine unhealthy (every subsequent call answers [`OakError::EngineShut`]).
#[derive(Error, Debug)]
pub enum OakError {
    // === Transient (retriable by the caller) ===
    /// A lock wait exceeded the configured timeout; the transaction has been
    /// marked rollback-only.
    #[error("lock wait timeout exceeded")]
    LockWaitTimeout,

    /// This transaction was chosen as the deadlock victim and rolled back.
    #[error("deadlock found when trying to get lock")]
    Deadlock,

    // === Logical (non-retriable, transaction stays usable) ===
    /// An insert or update would duplicate an existing key.
    #[error("duplicate entry for key in index {index_id}")]
    DuplicateKey { index_id: u64 },

    /// The requested row does not exist (or is invisible to this view).
    #[error("record not found")]
    RowNotFound,

    /// A referenced parent row does not exist.
    #[error("no referenced row")]
    NoReferencedRow,

    /// A row operation violated a constraint supplied by the dictionary.
    #[error("constraint violation: {detail}")]
    ConstraintViolation { detail: String },

    /// The dictionary has no definition for the requested object, or the
    /// definition does not match the stored data.
    #[error("schema error: {detail}")]
    SchemaError { detail: String },

    /// Malformed input from the caller (bad tuple shape, empty key, ...).
    #[error("invalid input: {detail}")]
    InvalidInput { detail: String },

    // === Resource ===
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A tablespace cannot grow further within its configured maximum.
    #[error("out of file space in tablespace {space_id}")]
    OutOfFileSpace { space_id: u32 },

    /// The underlying filesystem is full.
    #[error("out of disk space")]
    OutOfDiskSpace,

    // === Durability / corruption (fatal) ===
    /// A page failed its checksum or torn-write check.
    #[error("page corruption on page {page_no} of space {space_id}: {detail}")]
    PageCorruption {
        space_id: u32,
        page_no: u32,
        detail: String,
    },

    /// The redo log is unreadable past the last checkpoint.
    #[error("log corruption at lsn {lsn}: {detail}")]
    LogCorruption { lsn: u64, detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine has been shut down (normally, or after a fatal error) and
    /// can no longer serve requests.
    #[error("storage engine is shut down")]
    EngineShut,

    // === Internal ===
    /// Internal logic error (should never escape to the host application).
    #[error("internal error: {0}")]
    Internal(String),
}

impl OakError {
    /// Whether retrying the whole transaction may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockWaitTimeout | Self::Deadlock)
    }

    /// Whether this error leaves the engine unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PageCorruption { .. } | Self::LogCorruption { .. } | Self::EngineShut
        )
    }

    /// Whether the failing operation leaves the transaction in a
    /// rollback-only state (the caller must `rollback` before reusing it).
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        matches!(self, Self::LockWaitTimeout | Self::Deadlock)
    }

    /// Create a schema error.
    pub fn schema(detail: impl Into<String>) -> Self {
        Self::SchemaError {
            detail: detail.into(),
        }
    }

    /// Create an invalid-input error.
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidInput {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a page-corruption error.
    pub fn corrupt(space_id: u32, page_no: u32, detail: impl Into<String>) -> Self {
        Self::PageCorruption {
            space_id,
            page_no,
            detail: detail.into(),
        }
    }
}

/// Result type alias using `OakError`.
pub type Result<T> = std::result::Result<T, OakError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(
            OakError::Deadlock.to_string(),
            "deadlock found when trying to get lock"
        );
        assert_eq!(
            OakError::DuplicateKey { index_id: 7 }.to_string(),
            "duplicate entry for key in index 7"
        );
        assert_eq!(
            OakError::corrupt(0, 12, "bad trailer").to_string(),
            "page corruption on page 12 of space 0: bad trailer"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(OakError::LockWaitTimeout.is_transient());
        assert!(OakError::Deadlock.is_transient());
        assert!(!OakError::RowNotFound.is_transient());
        assert!(!OakError::corrupt(0, 1, "x").is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(OakError::corrupt(0, 1, "x").is_fatal());
        assert!(OakError::LogCorruption {
            lsn: 42,
            detail: "truncated".to_owned()
        }
        .is_fatal());
        assert!(OakError::EngineShut.is_fatal());
        assert!(!OakError::Deadlock.is_fatal());
        assert!(!OakError::OutOfDiskSpace.is_fatal());
    }

    #[test]
    fn rollback_only_matches_transient() {
        assert!(OakError::Deadlock.is_rollback_only());
        assert!(OakError::LockWaitTimeout.is_rollback_only());
        assert!(!OakError::DuplicateKey { index_id: 1 }.is_rollback_only());
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "pwrite failed");
        let err: OakError = io.into();
        assert!(matches!(err, OakError::Io(_)));
    }
}
