//! Engine services: relationship management, part-whole management,
//! property inheritance, and parts inheritance.

pub mod changelog;
pub mod error;
pub mod inheritance_service;
pub mod parts_inheritance;
pub mod parts_service;
pub mod relationship_service;

pub use changelog::{ChangeLog, ChangeRecorder, MemoryChangeLog, SYSTEM_ACTOR};
pub use error::OntologyError;
pub use inheritance_service::InheritanceService;
pub use parts_inheritance::PartsInheritanceService;
pub use parts_service::{PartsService, PartsSide};
pub use relationship_service::{RelationKind, RelationshipService};

use std::future::Future;

use crate::db::StoreError;

/// How many times a logical operation is re-run after losing a version
/// check before the conflict is surfaced to the caller.
pub const TXN_MAX_RETRIES: usize = 5;

/// Re-run `op` on version conflicts, up to [`TXN_MAX_RETRIES`] attempts.
/// Every other error passes through unchanged.
pub(crate) async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, OntologyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OntologyError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(OntologyError::Store(StoreError::VersionConflict { node_id, .. }))
                if attempt < TXN_MAX_RETRIES =>
            {
                tracing::debug!(%node_id, attempt, "version conflict, retrying operation");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Validate a non-blank identifier-ish input.
pub(crate) fn require_non_blank(value: &str, what: &str) -> Result<(), OntologyError> {
    if value.trim().is_empty() {
        return Err(OntologyError::validation(format!("{what} must not be blank")));
    }
    Ok(())
}
