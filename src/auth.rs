//! Submission authorization.
//!
//! The gate is injected into the orchestrator so embedders can swap the
//! allow-list for their own policy (open instance, group membership, ...).

use crate::db::Database;
use crate::error::Result;
use crate::types::OwnerScope;
use async_trait::async_trait;

/// Decides whether a scope may submit tasks
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// Returns true if the scope is allowed to submit
    async fn is_authorized(&self, scope: OwnerScope) -> Result<bool>;
}

/// Allow-list gate backed by the task database
///
/// The system-owner scope is always authorized; everyone else must be on the
/// persisted allow-list.
pub struct DbAuthGate {
    db: Database,
    owner_scope: OwnerScope,
}

impl DbAuthGate {
    /// Create a gate over the given database
    pub fn new(db: Database, owner_scope: OwnerScope) -> Self {
        Self { db, owner_scope }
    }
}

#[async_trait]
impl AuthorizationGate for DbAuthGate {
    async fn is_authorized(&self, scope: OwnerScope) -> Result<bool> {
        if scope == self.owner_scope {
            return Ok(true);
        }
        self.db.is_scope_authorized(scope).await
    }
}

/// Gate that authorizes everyone, for open deployments and tests
pub struct AllowAll;

#[async_trait]
impl AuthorizationGate for AllowAll {
    async fn is_authorized(&self, _scope: OwnerScope) -> Result<bool> {
        Ok(true)
    }
}
