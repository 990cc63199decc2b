/// Error Handling System
///
/// This module defines the error taxonomy shared by every component of the
/// datastore engine. Errors carry a kind (the classification surfaced to
/// callers), a human-readable message, an optional data path pinpointing the
/// offending node, an optional chained cause, and any number of accumulated
/// secondary errors.
///
/// Propagation policy: errors never cross a component boundary silently. A
/// boundary either recovers (the loader skips a module the caller cannot
/// read, the composer skips a statically disjoint subscription) or surfaces
/// the error unchanged. When two failures coincide (a commit persists but its
/// change notification fails) both are retained: the primary is rendered and
/// the secondaries are attached as notes.
use std::error::Error as StdError;
use std::fmt;

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// Classification of a failure, surfaced to callers unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The requested module, node, or subscription does not exist.
    NotFound,
    /// The item being created already exists.
    Exists,
    /// The caller lacks permission for the operation.
    Unauthorized,
    /// An argument failed validation before any work was performed.
    InvalArg,
    /// Data validation failed; the transaction was rolled back.
    ValidationFailed,
    /// A lock or rendezvous deadline expired; any partial state was undone.
    Timeout,
    /// A provider callback returned an error or did not answer in time.
    CallbackFailed,
    /// An underlying OS operation failed.
    Sys,
    /// An internal invariant was violated.
    Internal,
    /// The operation is not supported on this datastore or module.
    Unsupported,
}

impl ErrorKind {
    /// Stable textual tag, used in logs and rendered errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Exists => "EXISTS",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::InvalArg => "INVAL_ARG",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::CallbackFailed => "CALLBACK_FAILED",
            ErrorKind::Sys => "SYS",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chainable error for all datastore operations.
#[derive(Debug)]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
    path: Option<String>,
    cause: Option<Box<StoreError>>,
    secondaries: Vec<StoreError>,
}

impl StoreError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StoreError {
            kind,
            message: message.into(),
            path: None,
            cause: None,
            secondaries: Vec::new(),
        }
    }

    /// Attach the data path the error refers to.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Chain an underlying cause.
    pub fn caused_by(mut self, cause: StoreError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Merge a secondary error that occurred alongside this one. The primary
    /// is kept as-is; renderers attach secondaries as notes.
    pub fn merge(mut self, secondary: StoreError) -> Self {
        self.secondaries.push(secondary);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn secondaries(&self) -> &[StoreError] {
        &self.secondaries
    }

    /// Convenience constructor for OS failures with a context message.
    pub fn sys(context: impl Into<String>, err: std::io::Error) -> Self {
        StoreError::new(ErrorKind::Sys, format!("{}: {}", context.into(), err))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {}", cause)?;
        }
        for sec in &self.secondaries {
            write!(f, "; also: {}", sec)?;
        }
        Ok(())
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::new(ErrorKind::Sys, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_with_path_and_cause() {
        let cause = StoreError::new(ErrorKind::Sys, "disk full");
        let err = StoreError::new(ErrorKind::ValidationFailed, "missing mandatory leaf")
            .with_path("/m1:root/a")
            .caused_by(cause);

        let rendered = err.to_string();
        assert!(rendered.contains("VALIDATION_FAILED"));
        assert!(rendered.contains("/m1:root/a"));
        assert!(rendered.contains("disk full"));
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_error_merge_keeps_primary() {
        let primary = StoreError::new(ErrorKind::Timeout, "lock wait expired");
        let merged = primary.merge(StoreError::new(ErrorKind::CallbackFailed, "notify failed"));

        assert_eq!(merged.kind(), ErrorKind::Timeout);
        assert_eq!(merged.secondaries().len(), 1);
        assert_eq!(merged.secondaries()[0].kind(), ErrorKind::CallbackFailed);
    }

    #[test]
    fn test_io_error_maps_to_sys() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert_eq!(err.kind(), ErrorKind::Sys);
    }
}
