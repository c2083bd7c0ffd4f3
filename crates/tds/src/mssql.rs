//! SQL Server handle over `tiberius`.
//!
//! Each handle owns a current-thread tokio runtime and blocks on it from
//! whichever thread calls [`Connection::run`], so the gateway keeps its plain
//! thread-per-connection model. `tiberius` has no attention signal and does
//! not surface informational tokens or DONE row counts, so:
//!
//! - `cancel` only stops delivery; the batch is drained to its natural end.
//! - `on_message` fires for server errors (with their severity), not for
//!   PRINT/info output, and `on_row_count` never fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use parking_lot::Mutex;
use tiberius::{AuthMethod, Client, ColumnData, ColumnType, Config, EncryptionLevel, FromSql, QueryItem};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::driver::{Connection, Connector, LoginParams, ResultHandler};
use crate::error::DbError;
use crate::types::{Column, ServerNotice, SqlType, Value};

type TdsClient = Client<Compat<TcpStream>>;

/// Where to reach the server.
#[derive(Debug, Clone)]
pub struct MssqlOptions {
    pub host: String,
    pub port: u16,
}

impl Default for MssqlOptions {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 1433 }
    }
}

/// Opens [`MssqlConnection`]s with SQL Server authentication.
#[derive(Debug, Clone)]
pub struct MssqlConnector {
    options: MssqlOptions,
}

impl MssqlConnector {
    pub fn new(options: MssqlOptions) -> Self {
        Self { options }
    }

    fn config(&self, params: &LoginParams) -> Config {
        let mut config = Config::new();
        config.host(&self.options.host);
        config.port(self.options.port);
        config.authentication(AuthMethod::sql_server(&params.username, &params.password));
        config.application_name(&params.app_name);
        config.encryption(EncryptionLevel::NotSupported);
        config
    }
}

impl Connector for MssqlConnector {
    fn connect(&self, params: &LoginParams) -> Result<Arc<dyn Connection>, DbError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::Runtime(e.to_string()))?;

        let config = self.config(params);
        let addr = config.get_addr();

        let client = runtime.block_on(async {
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| DbError::Io(format!("failed to connect to {}: {}", addr, e)))?;
            tcp.set_nodelay(true).ok();

            Client::connect(config, tcp.compat_write()).await.map_err(login_error)
        })?;

        log::debug!("Opened SQL Server handle to {} as {}", addr, params.username);

        Ok(Arc::new(MssqlConnection {
            client: Mutex::new(client),
            runtime,
            server: self.options.host.clone(),
            cancel_requested: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }))
    }
}

/// Rejected logins arrive as server error tokens.
fn login_error(err: tiberius::error::Error) -> DbError {
    match err {
        tiberius::error::Error::Server(token) => DbError::Authentication(token.message().to_string()),
        other => DbError::from(other),
    }
}

/// One authenticated SQL Server session.
pub struct MssqlConnection {
    // Dropped before the runtime that owns its socket registration.
    client: Mutex<TdsClient>,
    runtime: Runtime,
    server: String,
    cancel_requested: AtomicBool,
    broken: AtomicBool,
}

impl Connection for MssqlConnection {
    fn server(&self) -> &str {
        &self.server
    }

    fn run(&self, sql: &str, handler: &mut dyn ResultHandler) -> Result<(), DbError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(DbError::Io("connection is closed".to_string()));
        }
        self.cancel_requested.store(false, Ordering::SeqCst);

        let mut client = self.client.lock();
        let result = self
            .runtime
            .block_on(drive(&mut *client, sql, handler, &self.cancel_requested));

        if let Err(ref e) = result {
            if e.is_fatal() {
                log::debug!("SQL Server handle to {} is no longer usable: {}", self.server, e);
                self.broken.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn is_usable(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

async fn drive(
    client: &mut TdsClient,
    sql: &str,
    handler: &mut dyn ResultHandler,
    cancel: &AtomicBool,
) -> Result<(), DbError> {
    let mut stream = match client.simple_query(sql).await {
        Ok(stream) => stream,
        Err(e) => return Err(report(e, handler)),
    };

    let mut draining = false;
    loop {
        let item = match stream.try_next().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => return Err(report(e, handler)),
        };

        if cancel.load(Ordering::SeqCst) {
            if !draining {
                log::debug!("Cancel requested, draining remaining results");
                draining = true;
            }
            continue;
        }

        match item {
            QueryItem::Metadata(meta) => {
                let columns: Vec<Column> = meta
                    .columns()
                    .iter()
                    .map(|col| Column::new(col.name(), sql_type(col.column_type())))
                    .collect();
                handler.on_table(&columns)?;
            }
            QueryItem::Row(row) => {
                let values: Vec<Option<Value>> = row.cells().map(|(col, data)| decode(col.column_type(), data)).collect();
                handler.on_row(&values)?;
            }
        }
    }

    Ok(())
}

/// Forward a server error token as a message before turning it into an error.
fn report(err: tiberius::error::Error, handler: &mut dyn ResultHandler) -> DbError {
    if let tiberius::error::Error::Server(token) = &err {
        let notice = ServerNotice {
            server: token.server().to_string(),
            message: token.message().to_string(),
            proc_name: token.procedure().to_string(),
            sql_state: String::new(),
            msgno: token.code() as i32,
            line_number: token.line() as i32,
            state: i16::from(token.state()),
            priv_msg_type: 0,
            severity: token.class(),
            oserr: 0,
        };
        if let Err(e) = handler.on_message(&notice) {
            log::debug!("Dropped server message: {}", e);
        }
    }
    DbError::from(err)
}

impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error;
        match err {
            Error::Io { message, .. } => DbError::Io(message),
            Error::Server(token) => DbError::Server {
                code: token.code(),
                message: token.message().to_string(),
            },
            Error::Routing { host, port } => {
                DbError::Io(format!("server requested routing to {}:{}", host, port))
            }
            other => DbError::Protocol(other.to_string()),
        }
    }
}

fn sql_type(column_type: ColumnType) -> SqlType {
    #[allow(unreachable_patterns)]
    match column_type {
        ColumnType::Null => SqlType::Null,
        ColumnType::Bit | ColumnType::Bitn => SqlType::Bit,
        ColumnType::Int1 => SqlType::TinyInt,
        ColumnType::Int2 => SqlType::SmallInt,
        ColumnType::Int4 | ColumnType::Intn => SqlType::Int,
        ColumnType::Int8 => SqlType::BigInt,
        ColumnType::Float4 => SqlType::Real,
        ColumnType::Float8 | ColumnType::Floatn => SqlType::Float,
        ColumnType::Money => SqlType::Money,
        ColumnType::Money4 => SqlType::SmallMoney,
        ColumnType::Decimaln => SqlType::Decimal,
        ColumnType::Numericn => SqlType::Numeric,
        ColumnType::Datetime | ColumnType::Datetimen => SqlType::DateTime,
        ColumnType::Datetime4 => SqlType::SmallDateTime,
        ColumnType::Datetime2 => SqlType::DateTime2,
        ColumnType::DatetimeOffsetn => SqlType::DateTimeOffset,
        ColumnType::Daten => SqlType::Date,
        ColumnType::Timen => SqlType::Time,
        ColumnType::Guid => SqlType::UniqueIdentifier,
        ColumnType::BigChar => SqlType::Char,
        ColumnType::BigVarChar => SqlType::VarChar,
        ColumnType::Text => SqlType::Text,
        ColumnType::NChar => SqlType::NChar,
        ColumnType::NVarchar => SqlType::NVarChar,
        ColumnType::NText => SqlType::NText,
        ColumnType::BigBinary => SqlType::Binary,
        ColumnType::BigVarBin => SqlType::VarBinary,
        ColumnType::Image => SqlType::Image,
        ColumnType::Xml => SqlType::Xml,
        ColumnType::Udt => SqlType::Udt,
        ColumnType::SSVariant => SqlType::SqlVariant,
        // tiberius may grow wire types we have not classified yet.
        _ => SqlType::SqlVariant,
    }
}

/// Convert one cell. Money arrives as a float and is sent as four-place text.
fn decode(column_type: ColumnType, data: &ColumnData<'static>) -> Option<Value> {
    match data {
        ColumnData::F64(v) if matches!(column_type, ColumnType::Money | ColumnType::Money4) => {
            v.as_ref().map(|v| Value::Text(format!("{:.4}", v)))
        }
        ColumnData::U8(v) => v.as_ref().map(|v| Value::Int(i64::from(*v))),
        ColumnData::I16(v) => v.as_ref().map(|v| Value::Int(i64::from(*v))),
        ColumnData::I32(v) => v.as_ref().map(|v| Value::Int(i64::from(*v))),
        ColumnData::I64(v) => v.as_ref().map(|v| Value::Int(*v)),
        ColumnData::F32(v) => v.as_ref().map(|v| Value::Float(f64::from(*v))),
        ColumnData::F64(v) => v.as_ref().map(|v| Value::Float(*v)),
        ColumnData::Bit(v) => v.as_ref().map(|v| Value::Bool(*v)),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Text(hex(b))),
        ColumnData::Numeric(v) => v.as_ref().map(|n| Value::Text(n.to_string())),
        ColumnData::Xml(v) => v.as_ref().map(|x| Value::Text(x.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) => {
            NaiveDateTime::from_sql(data).ok().flatten().map(Value::DateTime)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data).ok().flatten().map(Value::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data).ok().flatten().map(Value::Time),
        ColumnData::DateTime2(_) => NaiveDateTime::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| Value::Text(dt.to_rfc3339())),
    }
}

/// `0x`-prefixed upper-case hex, the way SSMS displays binary columns.
fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}
