//! Transaction manager consumed interface.
//!
//! Out of scope per spec.md §1 ("transaction manager implementations" are
//! listed as an external collaborator whose interface only is specified
//! here); the Work Package batch algorithm (spec.md §4.4 step 3) only needs
//! begin/commit/rollback around each batch.

use async_trait::async_trait;

use crate::error::Result;

/// An in-flight unit of work opened by [`TransactionManager::begin`].
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens transactions around each Work Package batch.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// A transaction manager with no backing resource: commit/rollback are
/// no-ops. Suitable when the handler itself is the system of record (e.g.
/// an in-memory projection) or for tests.
pub struct NoopTransactionManager;

struct NoopTransaction;

#[async_trait]
impl Transaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for NoopTransactionManager {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction))
    }
}
