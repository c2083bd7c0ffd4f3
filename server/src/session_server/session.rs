//! Per-connection query session.
//!
//! A `Session` owns the connection's database handle (if logged in) and at
//! most one running [`QueryExecutor`]. Every operation runs on the delivery
//! thread; only `query` hands work to a second thread.
//!
//! State the executor thread needs to observe lives in [`SessionState`] behind
//! one mutex. Handles are identified by a per-session generation number, so an
//! executor can tell whether the handle it was spawned with is still the
//! session's current one. Every event an executor emits is sent while holding
//! that mutex, after checking the generation; `logout` clears the handle under
//! the same mutex, so nothing from a stale run can follow the `logout` event.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use tdsweb_io::ExportError;
use tdsweb_protocol::{InfoMessage, LoginMessage, LogoutMessage, ProtocolError, ServerMessage};
use tdsweb_tds::{
    Column, Connection, Connector, DbError, LoginParams, ResultHandler, ServerNotice, SinkError,
    Value,
};

use crate::session_server::executor::{QueryExecutor, QueryOutcome};
use crate::session_server::outbox::Outbox;
use crate::session_server::sink::{ResultSink, SpreadsheetSink, StreamingSink};

pub const MSG_NO_USERNAME: &str = "Username not provided.";
pub const MSG_NO_PASSWORD: &str = "Password not provided.";
pub const MSG_NO_QUERY: &str = "No query given.";
pub const MSG_NO_DATABASE: &str = "No database given.";
pub const MSG_NOT_LOGGED_IN: &str = "Not logged in.";
pub const MSG_LOGOUT_NOT_LOGGED_IN: &str = "Can't logout as not logged in.";
pub const MSG_ALREADY_RUNNING: &str = "A query is already running.";

const CURRENT_DATABASE_SQL: &str = "SELECT DB_NAME()";
const DATABASES_SQL: &str = "SELECT name FROM sys.databases ORDER BY name";

/// Why a session operation was refused. `Display` is the text of the
/// resulting `error` event.
#[derive(Debug)]
pub enum SessionError {
    /// A required request field is missing.
    Validation(&'static str),
    /// The operation needs a database handle and there is none.
    NotLoggedIn(&'static str),
    /// A query is still running.
    AlreadyRunning,
    /// The server rejected the credentials.
    Authentication(String),
    /// The database failed outside of a query run.
    Database(DbError),
    /// The spreadsheet for an export could not be created.
    Export(ExportError),
    /// The envelope itself could not be dispatched.
    Protocol(ProtocolError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) | Self::NotLoggedIn(msg) => f.write_str(msg),
            Self::AlreadyRunning => f.write_str(MSG_ALREADY_RUNNING),
            Self::Authentication(msg) => f.write_str(msg),
            Self::Database(err) => write!(f, "{err}"),
            Self::Export(err) => write!(f, "{err}"),
            Self::Protocol(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Protocol(err)
    }
}

/// Per-session knobs taken from the gateway settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Client application name reported at login.
    pub app_name: String,
    pub export_filename: String,
    pub export_sheet_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            app_name: "tdsweb".to_string(),
            export_filename: "results.xlsx".to_string(),
            export_sheet_name: "Results".to_string(),
        }
    }
}

/// The session's current handle together with its generation number.
#[derive(Clone)]
pub(crate) struct LiveHandle {
    pub id: u64,
    pub conn: Arc<dyn Connection>,
}

/// State shared between the delivery thread and the executor thread.
#[derive(Default)]
pub(crate) struct SessionState {
    pub handle: Option<LiveHandle>,
    /// True from the moment a query is accepted until its executor has
    /// emitted its final event.
    pub active: bool,
}

impl SessionState {
    /// True if `id` names the session's current handle.
    pub fn is_current(&self, id: u64) -> bool {
        self.handle.as_ref().is_some_and(|h| h.id == id)
    }
}

/// Drop the current handle and announce it. Used by `logout` and by an
/// executor whose handle stopped working.
pub(crate) fn logout_locked(state: &mut SessionState, outbox: &Outbox) -> bool {
    match state.handle.take() {
        Some(handle) => {
            handle.conn.cancel();
            outbox.send(ServerMessage::Logout(LogoutMessage { success: true }));
            true
        }
        None => false,
    }
}

pub(crate) fn info_message(notice: &ServerNotice) -> InfoMessage {
    InfoMessage {
        server: notice.server.clone(),
        message: notice.message.clone(),
        proc_name: notice.proc_name.clone(),
        sql_state: notice.sql_state.clone(),
        msgno: notice.msgno,
        line_number: notice.line_number,
        state: notice.state,
        priv_msg_type: notice.priv_msg_type,
        severity: notice.severity,
        oserr: notice.oserr,
    }
}

pub struct Session {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    outbox: Outbox,
    shared: Arc<Mutex<SessionState>>,
    executor: Option<JoinHandle<QueryOutcome>>,
    /// Cancellation flag of the most recent query.
    cancelled: Arc<AtomicBool>,
    /// Last handle generation handed out.
    generation: u64,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings, outbox: Outbox) -> Self {
        Self {
            connector,
            settings,
            outbox,
            shared: Arc::new(Mutex::new(SessionState::default())),
            executor: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            generation: 0,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.lock().handle.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().active
    }

    /// Open a handle, read the database list and announce the login.
    ///
    /// Any previous handle is replaced without being cancelled.
    pub fn login(&mut self, username: Option<&str>, password: Option<&str>) -> Result<(), SessionError> {
        let username = username.ok_or(SessionError::Validation(MSG_NO_USERNAME))?;
        let password = password.ok_or(SessionError::Validation(MSG_NO_PASSWORD))?;

        let params = LoginParams {
            username: username.to_string(),
            password: password.to_string(),
            app_name: self.settings.app_name.clone(),
        };
        let conn = self.connector.connect(&params).map_err(|err| {
            log::info!("Login failed for user {}: {}", username, err);
            match err {
                DbError::Authentication(msg) => SessionError::Authentication(msg),
                other => SessionError::Database(other),
            }
        })?;

        let database = first_column(&*conn, CURRENT_DATABASE_SQL, &self.outbox)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let databases = first_column(&*conn, DATABASES_SQL, &self.outbox)?;

        self.generation += 1;
        let server = conn.server().to_string();
        let mut state = self.shared.lock();
        state.handle = Some(LiveHandle { id: self.generation, conn });
        self.outbox.send(ServerMessage::Login(LoginMessage {
            success: true,
            server: server.clone(),
            username: username.to_string(),
            database,
            databases,
        }));
        log::info!("User {} logged in to {}", username, server);
        Ok(())
    }

    /// Drop the handle, asking any run on it to stop without waiting for it.
    pub fn logout(&mut self) -> Result<(), SessionError> {
        let mut state = self.shared.lock();
        if !logout_locked(&mut state, &self.outbox) {
            return Err(SessionError::NotLoggedIn(MSG_LOGOUT_NOT_LOGGED_IN));
        }
        log::info!("Logged out");
        Ok(())
    }

    /// Start a query on a background thread. Returns as soon as it is running;
    /// results arrive as events.
    pub fn query(&mut self, text: Option<&str>, export: bool) -> Result<(), SessionError> {
        let text = text.ok_or(SessionError::Validation(MSG_NO_QUERY))?;

        let handle = {
            let mut state = self.shared.lock();
            let handle = state
                .handle
                .clone()
                .ok_or(SessionError::NotLoggedIn(MSG_NOT_LOGGED_IN))?;
            if state.active {
                if !self.executor.as_ref().is_some_and(|t| t.is_finished()) {
                    return Err(SessionError::AlreadyRunning);
                }
                log::error!("Previous query thread exited without releasing the session");
            }
            state.active = true;
            handle
        };

        // The previous executor, if any, has already released the session
        self.reap();

        let sink = if export {
            match SpreadsheetSink::new(&self.settings.export_sheet_name, self.settings.export_filename.clone()) {
                Ok(sink) => ResultSink::Spreadsheet(sink),
                Err(err) => {
                    self.shared.lock().active = false;
                    return Err(SessionError::Export(err));
                }
            }
        } else {
            ResultSink::Streaming(StreamingSink::new(self.outbox.clone()))
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = Arc::clone(&cancelled);

        log::info!("Query started ({} bytes, export: {})", text.len(), export);
        let executor = QueryExecutor::new(
            handle,
            text.to_string(),
            sink,
            cancelled,
            Arc::clone(&self.shared),
            self.outbox.clone(),
        );
        match executor.spawn() {
            Ok(thread) => {
                self.executor = Some(thread);
                Ok(())
            }
            Err(err) => {
                self.shared.lock().active = false;
                Err(SessionError::Database(DbError::Runtime(err.to_string())))
            }
        }
    }

    /// Ask the running query to stop. Does nothing when logged out.
    pub fn cancel(&mut self) {
        let state = self.shared.lock();
        if let Some(handle) = &state.handle {
            self.cancelled.store(true, Ordering::SeqCst);
            handle.conn.cancel();
            log::debug!("Cancel requested");
        }
    }

    /// Switch the current database with `USE`. Refused while a query runs,
    /// since the handle runs one batch at a time.
    pub fn change_database(&mut self, name: Option<&str>) -> Result<(), SessionError> {
        let name = name.ok_or(SessionError::Validation(MSG_NO_DATABASE))?;

        let handle = {
            let state = self.shared.lock();
            let handle = state
                .handle
                .clone()
                .ok_or(SessionError::NotLoggedIn(MSG_NOT_LOGGED_IN))?;
            if state.active {
                return Err(SessionError::AlreadyRunning);
            }
            handle
        };

        let mut forwarder = NoticeForwarder { outbox: &self.outbox };
        match handle.conn.run(&use_statement(name), &mut forwarder) {
            Ok(()) => {
                log::debug!("Changed database to {}", name);
                Ok(())
            }
            Err(err) => {
                if !handle.conn.is_usable() {
                    let mut state = self.shared.lock();
                    if state.is_current(handle.id) {
                        log::warn!("Connection lost while changing database, logging out");
                        logout_locked(&mut state, &self.outbox);
                    }
                }
                Err(SessionError::Database(err))
            }
        }
    }

    pub fn ping(&mut self) {
        self.outbox.send(ServerMessage::Pong(Default::default()));
    }

    /// Wait for the current executor, if any, and return how its query ended.
    pub fn wait_for_query(&mut self) -> Option<QueryOutcome> {
        let thread = self.executor.take()?;
        match thread.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                log::error!("Query thread panicked");
                None
            }
        }
    }

    /// Tear down: drop the handle so nothing more is emitted, stop the run and
    /// wait for the executor to let go of the handle.
    pub fn close(&mut self) {
        let handle = self.shared.lock().handle.take();
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = handle {
            handle.conn.cancel();
        }
        if let Some(outcome) = self.wait_for_query() {
            log::debug!("Query ended during teardown: {:?}", outcome);
        }
    }

    fn reap(&mut self) {
        if let Some(outcome) = self.wait_for_query() {
            log::debug!("Reaped previous query: {:?}", outcome);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// `USE [name]`, with `]` doubled so the name cannot end the identifier.
pub fn use_statement(name: &str) -> String {
    format!("USE [{}]", name.replace(']', "]]"))
}

/// Run `sql` and return the first column of every row as text.
fn first_column(conn: &dyn Connection, sql: &str, outbox: &Outbox) -> Result<Vec<String>, SessionError> {
    let mut collector = FirstColumn { values: Vec::new(), outbox };
    conn.run(sql, &mut collector).map_err(SessionError::Database)?;
    Ok(collector.values)
}

struct FirstColumn<'a> {
    values: Vec<String>,
    outbox: &'a Outbox,
}

impl ResultHandler for FirstColumn<'_> {
    fn on_table(&mut self, _columns: &[Column]) -> Result<(), SinkError> {
        Ok(())
    }

    fn on_row(&mut self, row: &[Option<Value>]) -> Result<(), SinkError> {
        if let Some(Some(Value::Text(text))) = row.first() {
            self.values.push(text.clone());
        }
        Ok(())
    }

    fn on_message(&mut self, notice: &ServerNotice) -> Result<(), SinkError> {
        self.outbox.send(ServerMessage::Message(info_message(notice)));
        Ok(())
    }

    fn on_row_count(&mut self, _count: u64) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards server messages and ignores everything else.
struct NoticeForwarder<'a> {
    outbox: &'a Outbox,
}

impl ResultHandler for NoticeForwarder<'_> {
    fn on_table(&mut self, _columns: &[Column]) -> Result<(), SinkError> {
        Ok(())
    }

    fn on_row(&mut self, _row: &[Option<Value>]) -> Result<(), SinkError> {
        Ok(())
    }

    fn on_message(&mut self, notice: &ServerNotice) -> Result<(), SinkError> {
        self.outbox.send(ServerMessage::Message(info_message(notice)));
        Ok(())
    }

    fn on_row_count(&mut self, _count: u64) -> Result<(), SinkError> {
        Ok(())
    }
}
