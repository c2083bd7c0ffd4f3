//! Result sinks: where a query's result sets go.
//!
//! A streaming sink turns every callback into an outbound event. A spreadsheet
//! sink accumulates rows into an in-memory workbook that is encoded once, when
//! the query finishes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::SubsecRound;

use tdsweb_io::{CellStyle, CellValue, ExportError, SpreadsheetBuilder};
use tdsweb_protocol::{
    ColumnInfo, FieldValue, QueryFinishedMessage, RowCountMessage, RowMessage, ServerMessage,
    TableMessage, XLSX_MIME,
};
use tdsweb_tds::{Column, SinkError, Value};

use crate::session_server::outbox::Outbox;

/// Text written to a spreadsheet cell for SQL NULL.
pub const SPREADSHEET_NULL: &str = "NULL";

/// Destination for the result sets of one query.
pub enum ResultSink {
    Streaming(StreamingSink),
    Spreadsheet(SpreadsheetSink),
}

impl ResultSink {
    pub fn on_table(&mut self, columns: &[Column]) -> Result<(), SinkError> {
        match self {
            ResultSink::Streaming(sink) => {
                sink.on_table(columns);
                Ok(())
            }
            ResultSink::Spreadsheet(sink) => sink.on_table(columns).map_err(sink_error),
        }
    }

    pub fn on_row(&mut self, row: &[Option<Value>]) -> Result<(), SinkError> {
        match self {
            ResultSink::Streaming(sink) => {
                sink.on_row(row);
                Ok(())
            }
            ResultSink::Spreadsheet(sink) => sink.on_row(row).map_err(sink_error),
        }
    }

    pub fn on_row_count(&mut self, count: u64) {
        match self {
            ResultSink::Streaming(sink) => sink.on_row_count(count),
            // Nothing to show in a sheet
            ResultSink::Spreadsheet(_) => {}
        }
    }

    /// Build the `query_finished` payload. Consumes the sink, so a workbook
    /// is encoded at most once.
    pub fn finish(self) -> Result<QueryFinishedMessage, ExportError> {
        match self {
            ResultSink::Streaming(_) => Ok(QueryFinishedMessage::default()),
            ResultSink::Spreadsheet(sink) => sink.finish(),
        }
    }

    pub fn is_spreadsheet(&self) -> bool {
        matches!(self, ResultSink::Spreadsheet(_))
    }
}

fn sink_error(err: ExportError) -> SinkError {
    SinkError(err.to_string())
}

/// Emits one event per callback.
pub struct StreamingSink {
    outbox: Outbox,
}

impl StreamingSink {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    fn on_table(&mut self, columns: &[Column]) {
        let columns = columns
            .iter()
            .map(|c| ColumnInfo { name: c.name.clone(), kind: c.sql_type.name().to_string() })
            .collect();
        self.outbox.send(ServerMessage::Table(TableMessage { columns }));
    }

    fn on_row(&mut self, row: &[Option<Value>]) {
        let columns = row.iter().map(|v| v.as_ref().map(field_value)).collect();
        self.outbox.send(ServerMessage::Row(RowMessage { columns }));
    }

    fn on_row_count(&mut self, count: u64) {
        self.outbox.send(ServerMessage::RowCount(RowCountMessage { count }));
    }
}

/// Collects every result set onto one sheet.
///
/// Each result set starts with a bold header row; successive result sets are
/// separated by one blank row.
pub struct SpreadsheetSink {
    builder: SpreadsheetBuilder,
    filename: String,
    tables: usize,
}

impl SpreadsheetSink {
    pub fn new(sheet_name: &str, filename: impl Into<String>) -> Result<Self, ExportError> {
        let mut builder = SpreadsheetBuilder::new();
        builder.add_sheet(sheet_name)?;
        Ok(Self { builder, filename: filename.into(), tables: 0 })
    }

    fn on_table(&mut self, columns: &[Column]) -> Result<(), ExportError> {
        if self.tables > 0 {
            self.builder.add_row()?;
        }
        self.tables += 1;

        self.builder.add_row()?;
        for column in columns {
            self.builder.add_cell(&CellValue::Text(column.name.clone()), CellStyle::Header)?;
        }
        Ok(())
    }

    fn on_row(&mut self, row: &[Option<Value>]) -> Result<(), ExportError> {
        self.builder.add_row()?;
        for field in row {
            let cell = match field {
                Some(value) => cell_value(value),
                None => CellValue::Text(SPREADSHEET_NULL.to_string()),
            };
            self.builder.add_cell(&cell, CellStyle::Plain)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<QueryFinishedMessage, ExportError> {
        let bytes = self.builder.serialize()?;
        Ok(QueryFinishedMessage {
            mime: Some(XLSX_MIME.to_string()),
            filename: Some(self.filename),
            data: Some(STANDARD.encode(bytes)),
        })
    }
}

/// Wire form of a non-null field. Dates and times carry whole seconds.
pub fn field_value(value: &Value) -> FieldValue {
    match value {
        Value::Int(n) => FieldValue::Integer(*n),
        Value::Float(f) => FieldValue::Float(*f),
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::DateTime(dt) => FieldValue::DateTime(dt.trunc_subsecs(0)),
        Value::Date(d) => FieldValue::Date(*d),
        Value::Time(t) => FieldValue::Time(t.trunc_subsecs(0)),
        Value::Text(s) => FieldValue::Text(s.clone()),
    }
}

/// Spreadsheet form of a non-null field.
pub fn cell_value(value: &Value) -> CellValue {
    match value {
        Value::Int(n) => CellValue::Integer(*n),
        Value::Float(f) => CellValue::Number(*f),
        Value::Bool(b) => CellValue::Boolean(*b),
        Value::DateTime(dt) => CellValue::DateTime(*dt),
        Value::Date(d) => CellValue::Date(*d),
        Value::Time(t) => CellValue::Time(*t),
        Value::Text(s) => CellValue::Text(s.clone()),
    }
}
