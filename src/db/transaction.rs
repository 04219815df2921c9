//! Transaction state for a connection.
//!
//! A connection owns at most one `Transaction`, created on the first
//! `begin_transaction` and reused afterwards. Nested `begin` calls are
//! tracked with a level counter: level 0 starts a real transaction, deeper
//! levels use savepoints named `LEVEL<n>`.

use super::handle::DriverHandle;
use super::lock_unpoisoned;
use crate::error::{DbError, DbResult};
use crate::models::IsolationLevel;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct TransactionState {
    level: u32,
    isolation: Option<IsolationLevel>,
    /// Set once the owning connection closed; the transaction is dead.
    connection_closed: bool,
}

/// The transaction singleton of a connection.
#[derive(Debug, Default)]
pub struct Transaction {
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True while at least one `begin` has not been committed or rolled back.
    pub fn is_active(&self) -> bool {
        let state = lock_unpoisoned(&self.state);
        state.level > 0 && !state.connection_closed
    }

    /// Current nesting level (0 when inactive).
    pub fn level(&self) -> u32 {
        lock_unpoisoned(&self.state).level
    }

    /// Isolation level requested by the outermost `begin`.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        lock_unpoisoned(&self.state).isolation
    }

    /// Start the transaction, or a savepoint when one is already running.
    pub async fn begin(
        &self,
        handle: &mut dyn DriverHandle,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        let level = {
            let state = lock_unpoisoned(&self.state);
            if state.connection_closed {
                return Err(DbError::transaction(
                    "The connection owning this transaction has been closed",
                ));
            }
            state.level
        };

        if level == 0 {
            debug!(isolation = ?isolation, "Begin transaction");
            handle.begin(isolation).await?;
            lock_unpoisoned(&self.state).isolation = isolation;
        } else {
            if isolation.is_some() {
                debug!(level, "Isolation level ignored for nested transaction");
            }
            debug!(level, "Set savepoint");
            handle.execute(&format!("SAVEPOINT LEVEL{}", level)).await?;
        }

        lock_unpoisoned(&self.state).level = level + 1;
        Ok(())
    }

    /// Commit the innermost level.
    pub async fn commit(&self, handle: &mut dyn DriverHandle) -> DbResult<()> {
        let level = self.active_level("commit")?;

        if level == 1 {
            debug!("Commit transaction");
            handle.commit().await?;
        } else {
            debug!(level = level - 1, "Release savepoint");
            handle
                .execute(&format!("RELEASE SAVEPOINT LEVEL{}", level - 1))
                .await?;
        }

        self.finish_level(level);
        Ok(())
    }

    /// Roll back the innermost level. Does nothing when inactive.
    pub async fn rollback(&self, handle: &mut dyn DriverHandle) -> DbResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        let level = self.level();

        if level == 1 {
            debug!("Roll back transaction");
            handle.rollback().await?;
        } else {
            debug!(level = level - 1, "Roll back to savepoint");
            handle
                .execute(&format!("ROLLBACK TO SAVEPOINT LEVEL{}", level - 1))
                .await?;
        }

        self.finish_level(level);
        Ok(())
    }

    /// Called by the owning connection when it closes. The server already
    /// discarded the transaction with the socket, so only local state changes.
    pub fn connection_closed(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.level = 0;
        state.isolation = None;
        state.connection_closed = true;
    }

    fn active_level(&self, operation: &str) -> DbResult<u32> {
        let state = lock_unpoisoned(&self.state);
        if state.connection_closed || state.level == 0 {
            return Err(DbError::transaction(format!(
                "Failed to {} transaction: transaction was inactive",
                operation
            )));
        }
        Ok(state.level)
    }

    fn finish_level(&self, level: u32) {
        let mut state = lock_unpoisoned(&self.state);
        state.level = level - 1;
        if state.level == 0 {
            state.isolation = None;
        }
    }
}
