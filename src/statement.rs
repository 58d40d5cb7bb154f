//! Prepared statements.
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    Error, Result,
    connection::Connection,
    engine::{Command, TxHandle},
    protocol::backend::Column,
    result::QueryResult,
};

/// A prepared-statement name, unique within the process.
///
/// Generated from a monotonic counter; the numeric suffix is reused for
/// the statement's portal names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementName {
    name: String,
    suffix: u32,
}

impl StatementName {
    fn next() -> Self {
        static ID: AtomicU32 = AtomicU32::new(1);
        let suffix = ID.fetch_add(1, Ordering::Relaxed);
        Self { name: format!("stmt_{suffix:x}"), suffix }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Portal names are unique per execute: `port_<suffix>_<n>` in hex.
    fn portal(&self, execution: u32) -> String {
        format!("port_{:x}_{execution:x}", self.suffix)
    }
}

/// Lifecycle of a statement, tracked so misuse fails before reaching the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Prepared,
    DescribeStatementInProgress,
    StatementDescribed,
    BindInProgress,
    Bound,
    ExecuteInProgress,
    Executed,
    ClosePortalInProgress,
    CloseInProgress,
    Closed,
}

/// One bind value, already rendered to the text wire format.
#[derive(Debug, Clone)]
pub enum Param {
    Null,
    Value(Bytes),
}

impl Param {
    fn into_wire(self) -> Option<Bytes> {
        match self {
            Self::Null => None,
            Self::Value(value) => Some(value),
        }
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Value(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Value(value.into_bytes().into())
    }
}

macro_rules! param_int {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Param {
            fn from(value: $ty) -> Self {
                let mut buf = itoa::Buffer::new();
                Self::Value(Bytes::copy_from_slice(buf.format(value).as_bytes()))
            }
        }
    )*};
}

param_int!(i16, i32, i64, u32, u64);

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Self::Null,
        }
    }
}

/// A server-side prepared statement.
///
/// Created through [`Connection::prepare`]. Parsing is followed by a
/// statement describe, so parameter types and result columns are known
/// before the first execution. Each execution binds a fresh portal.
#[derive(Debug)]
pub struct Statement<'c> {
    conn: &'c Connection,
    name: StatementName,
    sql: String,
    parameters: Vec<i32>,
    columns: Vec<Column>,
    state: StatementState,
    portal: Option<String>,
    /// Transaction the current portal is scoped to; its end closes the
    /// portal server-side.
    last_tx: Option<TxHandle>,
    executions: u32,
}

impl<'c> Statement<'c> {
    pub(crate) async fn prepare(
        conn: &'c Connection,
        sql: &str,
        param_oids: &[i32],
        tx: Option<&TxHandle>,
    ) -> Result<Statement<'c>> {
        let name = StatementName::next();

        conn.submit(
            Command::Parse {
                statement: name.as_str().to_owned(),
                sql: sql.to_owned(),
                param_oids: param_oids.to_vec(),
            },
            tx,
        )
        .await?;

        let mut stmt = Statement {
            conn,
            name,
            sql: sql.to_owned(),
            parameters: Vec::new(),
            columns: Vec::new(),
            state: StatementState::Prepared,
            portal: None,
            last_tx: tx.cloned(),
            executions: 0,
        };
        stmt.describe(tx).await?;
        Ok(stmt)
    }

    /// Describe the statement, filling the parameter-type catalog and the
    /// column metadata attached to every later result.
    async fn describe(&mut self, tx: Option<&TxHandle>) -> Result<()> {
        self.state = StatementState::DescribeStatementInProgress;
        let described = self
            .conn
            .submit(Command::DescribeStatement { statement: self.name.as_str().to_owned() }, tx)
            .await?
            .into_single();

        self.parameters = described.parameter_oids().unwrap_or_default().to_vec();
        self.columns = described.columns().unwrap_or_default().to_vec();
        self.state = StatementState::StatementDescribed;
        Ok(())
    }

    /// Bind and run the statement, with no row limit.
    pub async fn execute(&mut self, params: &[Param]) -> Result<QueryResult> {
        self.run(params, 0, None).await
    }

    /// Bind and run the statement inside a transaction.
    pub async fn execute_in(&mut self, params: &[Param], tx: &TxHandle) -> Result<QueryResult> {
        self.run(params, 0, Some(tx)).await
    }

    /// Bind and run with a row limit. The backend suspends the portal once
    /// `max_rows` are out; the result carries no completion tag then and a
    /// later execution resumes nothing automatically.
    pub async fn execute_with_limit(
        &mut self,
        params: &[Param],
        max_rows: i32,
        tx: Option<&TxHandle>,
    ) -> Result<QueryResult> {
        self.run(params, max_rows, tx).await
    }

    async fn run(
        &mut self,
        params: &[Param],
        max_rows: i32,
        tx: Option<&TxHandle>,
    ) -> Result<QueryResult> {
        if self.state == StatementState::Closed {
            return Err(Error::misuse("statement is closed"));
        }

        // a portal bound outside any transaction stays open server-side
        // until closed explicitly; transaction-scoped portals die with
        // their transaction
        if let Some(portal) = self.portal.take() {
            if self.last_tx.is_none() {
                self.state = StatementState::ClosePortalInProgress;
                self.conn.submit(Command::ClosePortal { portal }, tx).await?;
            }
        }

        let portal = self.name.portal(self.executions);
        self.executions += 1;

        self.state = StatementState::BindInProgress;
        self.conn
            .submit(
                Command::Bind {
                    portal: portal.clone(),
                    statement: self.name.as_str().to_owned(),
                    param_formats: Vec::new(),
                    params: params.iter().cloned().map(Param::into_wire).collect(),
                    result_formats: Vec::new(),
                },
                tx,
            )
            .await?;
        self.state = StatementState::Bound;

        self.state = StatementState::ExecuteInProgress;
        let group = self
            .conn
            .submit(Command::Execute { portal: portal.clone(), max_rows }, tx)
            .await?;
        self.state = StatementState::Executed;
        self.portal = Some(portal);
        self.last_tx = tx.cloned();

        let mut result = group.into_single();
        if result.columns().is_none() && !self.columns.is_empty() {
            result.set_columns(self.columns.clone());
        }
        Ok(result)
    }

    /// Close the statement server-side.
    pub async fn close(mut self) -> Result<()> {
        if self.state == StatementState::Closed {
            return Err(Error::misuse("statement is closed"));
        }
        self.state = StatementState::CloseInProgress;
        self.conn
            .submit(Command::CloseStatement { statement: self.name.as_str().to_owned() }, None)
            .await?;
        self.state = StatementState::Closed;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter type oids learned from the describe step.
    pub fn parameter_oids(&self) -> &[i32] {
        &self.parameters
    }

    /// Result columns learned from the describe step; empty for
    /// statements returning no rows.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn state(&self) -> StatementState {
        self.state
    }
}
