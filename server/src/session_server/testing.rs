//! Scripted in-memory database driver for tests.
//!
//! A `ScriptedConnector` hands out `ScriptedConnection`s that answer the login
//! setup queries and `USE`, and replay a registered list of steps for any
//! other query text. Gates let a test hold a run at a known point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use tdsweb_tds::{
    Column, Connection, Connector, DbError, LoginParams, ResultHandler, ServerNotice, SqlType,
    Value,
};

const GATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Most rows a [`Step::RowsUntilCancel`] produces when no cancel arrives.
pub const ENDLESS_ROWS: usize = 1_000_000;

/// A point a scripted run stops at until the test opens it.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    reached: bool,
    open: bool,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.cond.notify_all();
    }

    /// Block until a run has arrived at this gate.
    pub fn wait_reached(&self) {
        let mut state = self.state.lock();
        while !state.reached {
            if self.cond.wait_for(&mut state, GATE_TIMEOUT).timed_out() {
                panic!("gate was never reached");
            }
        }
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.reached = true;
        self.cond.notify_all();
        while !state.open {
            if self.cond.wait_for(&mut state, GATE_TIMEOUT).timed_out() {
                panic!("gate was never opened");
            }
        }
    }
}

/// One step of a scripted run.
#[derive(Clone)]
pub enum Step {
    Table(Vec<Column>),
    Row(Vec<Option<Value>>),
    Message(String),
    RowCount(u64),
    /// Repeat a row until the handle is cancelled.
    RowsUntilCancel(Vec<Option<Value>>),
    Gate(Arc<Gate>),
    /// Fail the run with a server error; the handle stays usable.
    Fail(String),
    /// Fail the run and mark the handle unusable.
    Break,
}

/// Convenience constructors for scripts.
pub fn table(columns: &[(&str, SqlType)]) -> Step {
    Step::Table(columns.iter().map(|(name, ty)| Column::new(*name, *ty)).collect())
}

pub fn row(values: Vec<Option<Value>>) -> Step {
    Step::Row(values)
}

pub fn text(s: &str) -> Option<Value> {
    Some(Value::Text(s.to_string()))
}

pub fn int(n: i64) -> Option<Value> {
    Some(Value::Int(n))
}

struct Shared {
    server: String,
    password: String,
    databases: Vec<String>,
    scripts: Mutex<HashMap<String, Vec<Step>>>,
}

/// Opens scripted handles. Any username is accepted; the password must match.
#[derive(Clone)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
    connections: Arc<Mutex<Vec<Arc<ScriptedConnection>>>>,
}

impl ScriptedConnector {
    pub fn new(server: &str, password: &str, databases: &[&str]) -> Self {
        Self {
            shared: Arc::new(Shared {
                server: server.to_string(),
                password: password.to_string(),
                databases: databases.iter().map(|d| d.to_string()).collect(),
                scripts: Mutex::new(HashMap::new()),
            }),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register the steps replayed when `sql` is run.
    pub fn script(&self, sql: &str, steps: Vec<Step>) {
        self.shared.scripts.lock().insert(sql.to_string(), steps);
    }

    /// Most recently opened handle.
    pub fn last_connection(&self) -> Option<Arc<ScriptedConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, params: &LoginParams) -> Result<Arc<dyn Connection>, DbError> {
        if params.password != self.shared.password {
            return Err(DbError::Authentication(format!("Login failed for user '{}'.", params.username)));
        }
        let current = self.shared.databases.last().cloned().unwrap_or_default();
        let conn = Arc::new(ScriptedConnection {
            shared: Arc::clone(&self.shared),
            current_database: Mutex::new(current),
            cancels: AtomicUsize::new(0),
            usable: AtomicBool::new(true),
        });
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub struct ScriptedConnection {
    shared: Arc<Shared>,
    current_database: Mutex<String>,
    cancels: AtomicUsize,
    usable: AtomicBool,
}

impl ScriptedConnection {
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn current_database(&self) -> String {
        self.current_database.lock().clone()
    }

    fn notice(&self, message: &str) -> ServerNotice {
        ServerNotice {
            server: self.shared.server.clone(),
            message: message.to_string(),
            msgno: 5701,
            state: 2,
            severity: 10,
            ..Default::default()
        }
    }
}

impl Connection for ScriptedConnection {
    fn server(&self) -> &str {
        &self.shared.server
    }

    fn run(&self, sql: &str, handler: &mut dyn ResultHandler) -> Result<(), DbError> {
        if !self.is_usable() {
            return Err(DbError::Io("connection closed".into()));
        }

        if sql == "SELECT DB_NAME()" {
            handler.on_table(&[Column::new("", SqlType::NVarChar)])?;
            handler.on_row(&[Some(Value::Text(self.current_database()))])?;
            return Ok(());
        }
        if sql == "SELECT name FROM sys.databases ORDER BY name" {
            handler.on_table(&[Column::new("name", SqlType::NVarChar)])?;
            let mut names = self.shared.databases.clone();
            names.sort();
            for name in names {
                handler.on_row(&[Some(Value::Text(name))])?;
            }
            return Ok(());
        }
        if let Some(rest) = sql.strip_prefix("USE [").and_then(|s| s.strip_suffix(']')) {
            let name = rest.replace("]]", "]");
            if !self.shared.databases.contains(&name) {
                return Err(DbError::Server {
                    code: 911,
                    message: format!("Database '{}' does not exist.", name),
                });
            }
            *self.current_database.lock() = name.clone();
            handler.on_message(&self.notice(&format!("Changed database context to '{}'.", name)))?;
            return Ok(());
        }

        let steps = self.shared.scripts.lock().get(sql).cloned();
        let Some(steps) = steps else {
            return Err(DbError::Server { code: 2812, message: format!("Unknown script '{}'.", sql) });
        };
        for step in steps {
            match step {
                Step::Table(columns) => handler.on_table(&columns)?,
                Step::Row(values) => handler.on_row(&values)?,
                Step::Message(message) => handler.on_message(&self.notice(&message))?,
                Step::RowCount(count) => handler.on_row_count(count)?,
                Step::RowsUntilCancel(values) => {
                    let start = self.cancel_count();
                    let mut sent = 0;
                    while self.cancel_count() == start && sent < ENDLESS_ROWS {
                        handler.on_row(&values)?;
                        sent += 1;
                    }
                }
                Step::Gate(gate) => gate.pass(),
                Step::Fail(message) => return Err(DbError::Server { code: 50000, message }),
                Step::Break => {
                    self.usable.store(false, Ordering::SeqCst);
                    return Err(DbError::Io("connection reset by peer".into()));
                }
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }
}
