//! Database session handle used by the gateway.
//!
//! The gateway never talks to a wire protocol directly. It opens a
//! [`Connection`] through a [`Connector`], submits text with
//! [`Connection::run`] and receives results through a [`ResultHandler`]
//! invoked synchronously on the calling thread. [`Connection::cancel`] may be
//! called from any other thread while a run is in progress.
//!
//! [`mssql`] provides the SQL Server implementation.

pub mod driver;
pub mod error;
pub mod mssql;
pub mod types;

pub use driver::{Connection, Connector, LoginParams, ResultHandler};
pub use error::{DbError, SinkError};
pub use mssql::{MssqlConnector, MssqlOptions};
pub use types::{Column, ServerNotice, SqlType, Value};
