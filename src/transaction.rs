//! The [`Transaction`] guard.
use crate::{
    Result,
    connection::Connection,
    engine::{Command, TxHandle},
    result::ResultGroup,
    statement::Statement,
};

/// An RAII transaction scope.
///
/// Created by [`Connection::transaction`], which resolves once `BEGIN`
/// completed. Operations submitted through the guard run inside the
/// transaction and ahead of anything submitted outside it; those wait
/// until the transaction ends.
///
/// Dropping the guard without [`commit`][Transaction::commit] issues a
/// `ROLLBACK`.
///
/// # Example
///
/// ```no_run
/// # async fn app(conn: postwire::Connection) -> postwire::Result<()> {
/// let tx = conn.transaction().await?;
///
/// tx.execute("CREATE TABLE t (id int)").await?;
/// tx.execute("INSERT INTO t VALUES (1)").await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c> {
    conn: &'c Connection,
    handle: TxHandle,
    done: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(conn: &'c Connection, handle: TxHandle) -> Self {
        Self { conn, handle, done: false }
    }

    /// Run a simple query inside the transaction.
    pub async fn execute(&self, sql: &str) -> Result<ResultGroup> {
        self.conn.submit(Command::Query { sql: sql.to_owned() }, Some(&self.handle)).await
    }

    /// Prepare a statement inside the transaction. The statement outlives
    /// the guard, its current portal does not.
    pub async fn prepare(&self, sql: &str) -> Result<Statement<'c>> {
        Statement::prepare(self.conn, sql, &[], Some(&self.handle)).await
    }

    /// The identity tag routing submissions into this transaction.
    pub fn handle(&self) -> &TxHandle {
        &self.handle
    }

    /// Issue `COMMIT` and resolve once it completes.
    pub async fn commit(mut self) -> Result<()> {
        self.done = true;
        self.conn.commit_tx(&self.handle).await
    }

    /// Issue `ROLLBACK` and resolve once it completes.
    pub async fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.conn.rollback_tx(&self.handle).await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.rollback_nowait(&self.handle);
        }
    }
}
