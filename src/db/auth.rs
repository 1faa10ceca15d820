//! Authorized-scope allow-list persistence.

use crate::error::{DatabaseError, Error, Result};
use crate::types::OwnerScope;

use super::Database;

impl Database {
    /// Add a scope to the allow-list (idempotent)
    pub async fn add_authorized_scope(&self, scope: OwnerScope) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query("INSERT OR IGNORE INTO authorized_scopes (scope, added_at) VALUES (?, ?)")
            .bind(scope)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to add authorized scope: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Remove a scope from the allow-list
    ///
    /// Returns true if the scope was present.
    pub async fn remove_authorized_scope(&self, scope: OwnerScope) -> Result<bool> {
        let result = sqlx::query("DELETE FROM authorized_scopes WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove authorized scope: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Check whether a scope is on the allow-list
    pub async fn is_scope_authorized(&self, scope: OwnerScope) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM authorized_scopes WHERE scope = ?")
                .bind(scope)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to check scope authorization: {}",
                        e
                    )))
                })?;

        Ok(count > 0)
    }

    /// List all authorized scopes
    pub async fn list_authorized_scopes(&self) -> Result<Vec<OwnerScope>> {
        let scopes = sqlx::query_scalar::<_, OwnerScope>(
            "SELECT scope FROM authorized_scopes ORDER BY scope",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list authorized scopes: {}",
                e
            )))
        })?;

        Ok(scopes)
    }
}
