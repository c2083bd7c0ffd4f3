//! Handle contract between the gateway and a database driver.

use std::sync::Arc;

use crate::error::{DbError, SinkError};
use crate::types::{Column, ServerNotice, Value};

/// Credentials and identity for opening a handle.
#[derive(Clone)]
pub struct LoginParams {
    pub username: String,
    pub password: String,
    /// Reported to the server as the client application name.
    pub app_name: String,
}

impl std::fmt::Debug for LoginParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginParams")
            .field("username", &self.username)
            .field("password", &"...")
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// Receives the output of a run, synchronously on the thread that called
/// [`Connection::run`].
///
/// Returning an error abandons the run; the driver surfaces it as
/// [`DbError::Handler`].
pub trait ResultHandler {
    /// A new result set starts.
    fn on_table(&mut self, columns: &[Column]) -> Result<(), SinkError>;

    /// One row of the current result set, in column order. `None` is SQL NULL.
    fn on_row(&mut self, row: &[Option<Value>]) -> Result<(), SinkError>;

    /// Server message. Not an error by itself.
    fn on_message(&mut self, notice: &ServerNotice) -> Result<(), SinkError>;

    /// Rows affected by a statement that produced no result set.
    fn on_row_count(&mut self, count: u64) -> Result<(), SinkError>;
}

/// A live, authenticated connection able to run one batch at a time.
pub trait Connection: Send + Sync {
    /// Name of the server this handle is connected to.
    fn server(&self) -> &str;

    /// Submit `sql` and drive it to completion, feeding `handler`.
    fn run(&self, sql: &str, handler: &mut dyn ResultHandler) -> Result<(), DbError>;

    /// Ask an in-flight run to stop. Best-effort and non-blocking; safe to
    /// call from any thread, with or without a run in progress.
    fn cancel(&self);

    /// False once the underlying transport has failed.
    fn is_usable(&self) -> bool;
}

/// Opens handles against a fixed server.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &LoginParams) -> Result<Arc<dyn Connection>, DbError>;
}
