use crate::environment::AdapterVersion;
use crate::models::ServiceKind;
use std::error::Error as StdError;

/// Common error type for `fleetsync_core`.
///
/// Store and upstream implementations should preserve the underlying error chain via
/// `Error::backend`. Variants reported by `is_fatal` must stop the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    #[error("foreign key violation ({}): {message}", constraint.as_deref().unwrap_or("unknown constraint"))]
    ForeignKeyViolation {
        constraint: Option<String>,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(
        "service '{service}' logged adapter version {logged} which is newer than this instance ({running}); refusing to run an older adapter against newer data"
    )]
    VersionDowngrade {
        service: ServiceKind,
        logged: AdapterVersion,
        running: AdapterVersion,
    },

    #[error(
        "service '{service}' is already tracked on machine '{logged}' but this instance runs on '{running}'; only one machine may run a given service against the database"
    )]
    MachineNameMismatch {
        service: ServiceKind,
        logged: String,
        running: String,
    },

    #[error("service '{0}' has no tracking record; it must be registered before validation")]
    ServiceNotRegistered(ServiceKind),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "fleetsync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Errors that must terminate the host. They are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::VersionDowngrade { .. }
                | Error::MachineNameMismatch { .. }
                | Error::ServiceNotRegistered(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_taxonomy() {
        assert!(Error::ServiceNotRegistered(ServiceKind::LogRecordFeed).is_fatal());
        assert!(
            Error::MachineNameMismatch {
                service: ServiceKind::DeviceCache,
                logged: "a".into(),
                running: "b".into(),
            }
            .is_fatal()
        );
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::BackendMessage("timeout".into()).is_fatal());
        assert!(
            !Error::ForeignKeyViolation {
                constraint: None,
                message: "x".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn foreign_key_display_names_constraint() {
        let e = Error::ForeignKeyViolation {
            constraint: Some("fk_status_data_devices".into()),
            message: "FOREIGN KEY constraint failed".into(),
        };
        assert!(e.to_string().contains("fk_status_data_devices"));
    }
}
