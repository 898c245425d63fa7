//! Structured error types for the event bus and the form proxy.
//!
//! Neither half of the crate surfaces errors at the call that triggered the
//! work: handler failures are swallowed by the bus, and cascade failures are
//! reported through the form's settle signal. The types here are what those
//! paths record and log.
//!
//! - [`BusError`]: bookkeeping failures inside the event bus.
//! - [`CascadeError`]: why a field write was rejected.
//! - [`ConfigError`]: invalid configuration values.

use thiserror::Error;

// =============================================================================
// Bus Error
// =============================================================================

/// Errors raised by [`EventBus`](crate::EventBus) bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The handler is registered for the event but this client never
    /// tracked it, so it cannot be released through this client.
    #[error("handler for event {event} is registered but not tracked by this client")]
    UntrackedHandler {
        /// Debug rendering of the event key.
        event: String,
    },
}

// =============================================================================
// Cascade Error
// =============================================================================

/// Why a field write was rejected by the form proxy.
///
/// Every variant leaves the record exactly as it was before the write and
/// discards every queued write behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeError {
    /// A setter proposed a value for a field that disagrees with the value
    /// already accumulated in the same cascade.
    #[error("setter for field {field} produced a value that conflicts with the pending changes")]
    Conflict {
        /// The field whose setter introduced the incompatible value.
        field: String,
    },

    /// A setter failed, synchronously or while its deferred result ran.
    #[error("setter for field {field} failed: {message}")]
    SetterFailed {
        /// The field whose setter failed.
        field: String,
        /// The setter's error message.
        message: String,
    },

    /// The cascade suspended on a deferred setter outside of a tokio runtime.
    #[error("cascade for field {field} suspended without a runtime to finish it")]
    Suspended {
        /// The field of the write whose cascade could not be scheduled.
        field: String,
    },
}

impl CascadeError {
    pub(crate) fn setter_failed(field: &str, err: anyhow::Error) -> Self {
        Self::SetterFailed {
            field: field.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// The field this rejection is attributed to.
    pub fn field(&self) -> &str {
        match self {
            Self::Conflict { field }
            | Self::SetterFailed { field, .. }
            | Self::Suspended { field } => field,
        }
    }

    /// Returns true if the write was rejected because setters disagreed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// =============================================================================
// Config Error
// =============================================================================

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The form mode is not one of `assign` or `reassign`.
    #[error("unknown form mode {0:?}, expected \"assign\" or \"reassign\"")]
    UnknownMode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_handler_display() {
        let err = BusError::UntrackedHandler {
            event: "\"save\"".into(),
        };
        assert!(err.to_string().contains("not tracked"));
        assert!(err.to_string().contains("save"));
    }

    #[test]
    fn test_conflict_display_and_field() {
        let err = CascadeError::Conflict {
            field: "bar".into(),
        };
        assert!(err.to_string().contains("bar"));
        assert!(err.is_conflict());
        assert_eq!(err.field(), "bar");
    }

    #[test]
    fn test_setter_failed_keeps_context_chain() {
        let source = anyhow::anyhow!("lookup failed").context("resolving zip code");
        let err = CascadeError::setter_failed("zip", source);
        assert!(!err.is_conflict());
        assert_eq!(err.field(), "zip");
        let display = err.to_string();
        assert!(display.contains("resolving zip code"));
        assert!(display.contains("lookup failed"));
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = CascadeError::Suspended {
            field: "foo".into(),
        }
        .into();

        match err.downcast_ref::<CascadeError>() {
            Some(CascadeError::Suspended { field }) => assert_eq!(field, "foo"),
            other => panic!("Expected Suspended, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_mode_display() {
        let err = ConfigError::UnknownMode("merge".into());
        assert!(err.to_string().contains("merge"));
    }
}
