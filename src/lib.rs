//! Asynchronous PostgreSQL driver.
//!
//! The crate speaks version 3.0 of the frontend/backend protocol. A
//! [`Connection`] serializes every submitted operation onto a single
//! backend session; callers may submit freely and receive completion
//! futures that resolve in submission order.
//!
//! # Examples
//!
//! Simple query:
//!
//! ```no_run
//! use postwire::{Config, Connection};
//!
//! # async fn app() -> postwire::Result<()> {
//! let conn = Connection::connect(Config::from_env()).await?;
//!
//! let group = conn.execute("SELECT 1; SELECT 2").await?;
//! assert_eq!(group.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! Extended query through a prepared statement:
//!
//! ```no_run
//! use postwire::{Config, Connection, Param};
//!
//! # async fn app() -> postwire::Result<()> {
//! let conn = Connection::connect(Config::from_env()).await?;
//!
//! let mut stmt = conn.prepare("SELECT name FROM users WHERE id = $1").await?;
//! let res = stmt.execute(&[Param::from(420)]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Transaction:
//!
//! ```no_run
//! # async fn app(conn: postwire::Connection) -> postwire::Result<()> {
//! let tx = conn.transaction().await?;
//!
//! tx.execute("INSERT INTO foo(id) VALUES (14)").await?;
//!
//! // dropping `tx` without commit rolls the transaction back
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

mod ext;

// Protocol
pub mod protocol;

// Engine
pub mod engine;

// Component
pub mod result;
pub mod statement;

// Connection
pub mod config;
pub mod connection;
pub mod transaction;

mod net;

mod error;

#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use connection::Connection;
#[doc(inline)]
pub use engine::{Command, Engine, TxHandle};
#[doc(inline)]
pub use error::{DbError, Error, ErrorKind, Result};
pub use protocol::backend::Column;
#[doc(inline)]
pub use result::{QueryResult, ResultGroup};
#[doc(inline)]
pub use statement::{Param, Statement};
#[doc(inline)]
pub use transaction::Transaction;
