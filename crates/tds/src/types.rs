// Result-set model shared by every driver and every sink.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Column types as declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Null,
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Money,
    SmallMoney,
    Decimal,
    Numeric,
    DateTime,
    SmallDateTime,
    DateTime2,
    DateTimeOffset,
    Date,
    Time,
    UniqueIdentifier,
    Char,
    VarChar,
    Text,
    NChar,
    NVarChar,
    NText,
    Binary,
    VarBinary,
    Image,
    Xml,
    Udt,
    SqlVariant,
}

impl SqlType {
    /// Type name as a client would write it in T-SQL.
    pub fn name(self) -> &'static str {
        match self {
            SqlType::Null => "null",
            SqlType::Bit => "bit",
            SqlType::TinyInt => "tinyint",
            SqlType::SmallInt => "smallint",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Real => "real",
            SqlType::Float => "float",
            SqlType::Money => "money",
            SqlType::SmallMoney => "smallmoney",
            SqlType::Decimal => "decimal",
            SqlType::Numeric => "numeric",
            SqlType::DateTime => "datetime",
            SqlType::SmallDateTime => "smalldatetime",
            SqlType::DateTime2 => "datetime2",
            SqlType::DateTimeOffset => "datetimeoffset",
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::UniqueIdentifier => "uniqueidentifier",
            SqlType::Char => "char",
            SqlType::VarChar => "varchar",
            SqlType::Text => "text",
            SqlType::NChar => "nchar",
            SqlType::NVarChar => "nvarchar",
            SqlType::NText => "ntext",
            SqlType::Binary => "binary",
            SqlType::VarBinary => "varbinary",
            SqlType::Image => "image",
            SqlType::Xml => "xml",
            SqlType::Udt => "udt",
            SqlType::SqlVariant => "sql_variant",
        }
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self { name: name.into(), sql_type }
    }
}

/// A non-null field, already shaped by its wire type.
///
/// Integer-family types become `Int`, `datetime`/`smalldatetime` become
/// `DateTime`, `date` and `time` keep their own variants, floating types
/// become `Float`, `bit` becomes `Bool`. Everything else arrives as the
/// server's string form in `Text`. SQL NULL is `None` at the row level.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
}

/// Informational or error message raised by the server during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerNotice {
    pub server: String,
    pub message: String,
    pub proc_name: String,
    pub sql_state: String,
    pub msgno: i32,
    pub line_number: i32,
    pub state: i16,
    pub priv_msg_type: u8,
    pub severity: u8,
    pub oserr: i32,
}
