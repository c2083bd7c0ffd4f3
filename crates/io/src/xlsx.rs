// Excel export of query results (xlsx only)
//
// Rows are appended in the order the server delivers them. The workbook lives
// in memory and is serialized once, when the query finishes.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook as XlsxWorkbook, XlsxError};

/// Largest integer magnitude Excel stores without losing digits (15 significant digits).
const EXCEL_MAX_EXACT_INTEGER: i64 = 999_999_999_999_999;

/// Years Excel can store as dates.
const EXCEL_YEARS: std::ops::RangeInclusive<i32> = 1900..=9999;

const DATETIME_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";
const DATE_FORMAT: &str = "yyyy-mm-dd";
const TIME_FORMAT: &str = "hh:mm:ss";

/// A value to place in one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Integer(i64),
    Number(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
}

/// Presentation of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellStyle {
    #[default]
    Plain,
    /// Bold, used for column headers.
    Header,
}

#[derive(Debug)]
pub enum ExportError {
    /// A row was requested before any sheet was added.
    NoSheet,
    /// A cell was written before any row was opened.
    NoRow,
    /// The sheet has no room for another row or column.
    OutOfBounds { row: u32, col: u16 },
    /// Error reported by the xlsx writer.
    Xlsx(String),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSheet => write!(f, "no sheet to write to"),
            Self::NoRow => write!(f, "no row to write to"),
            Self::OutOfBounds { row, col } => write!(f, "cell ({row}, {col}) is outside the sheet"),
            Self::Xlsx(msg) => write!(f, "xlsx error: {msg}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<XlsxError> for ExportError {
    fn from(err: XlsxError) -> Self {
        ExportError::Xlsx(err.to_string())
    }
}

/// Builds a workbook one row at a time.
///
/// `serialize` consumes the builder, so the bytes can only be taken once.
pub struct SpreadsheetBuilder {
    workbook: XlsxWorkbook,
    /// Index of the sheet rows are appended to.
    sheet: Option<usize>,
    sheet_count: usize,
    /// Row currently being filled, if any.
    row: Option<u32>,
    /// Next free column in the current row.
    col: u16,
    header_format: Format,
    plain_format: Format,
    datetime_format: Format,
    date_format: Format,
    time_format: Format,
}

impl SpreadsheetBuilder {
    pub fn new() -> Self {
        Self {
            workbook: XlsxWorkbook::new(),
            sheet: None,
            sheet_count: 0,
            row: None,
            col: 0,
            header_format: Format::new().set_bold(),
            plain_format: Format::new(),
            datetime_format: Format::new().set_num_format(DATETIME_FORMAT),
            date_format: Format::new().set_num_format(DATE_FORMAT),
            time_format: Format::new().set_num_format(TIME_FORMAT),
        }
    }

    /// Add a sheet and make it the target of subsequent rows.
    pub fn add_sheet(&mut self, name: &str) -> Result<(), ExportError> {
        // The sheet exists even if naming it fails
        let index = self.sheet_count;
        self.sheet_count += 1;
        self.workbook
            .add_worksheet()
            .set_name(name)
            .map_err(|e| ExportError::Xlsx(format!("Failed to create sheet '{}': {}", name, e)))?;

        self.sheet = Some(index);
        self.row = None;
        self.col = 0;
        Ok(())
    }

    /// Open the next row on the current sheet. A row with no cells stays blank.
    pub fn add_row(&mut self) -> Result<(), ExportError> {
        if self.sheet.is_none() {
            return Err(ExportError::NoSheet);
        }
        let next = match self.row {
            Some(row) => row.checked_add(1).ok_or(ExportError::OutOfBounds { row, col: 0 })?,
            None => 0,
        };
        self.row = Some(next);
        self.col = 0;
        Ok(())
    }

    /// Append a cell to the current row.
    pub fn add_cell(&mut self, value: &CellValue, style: CellStyle) -> Result<(), ExportError> {
        let sheet_index = self.sheet.ok_or(ExportError::NoSheet)?;
        let row = self.row.ok_or(ExportError::NoRow)?;
        let col = self.col;

        let base = match style {
            CellStyle::Plain => &self.plain_format,
            CellStyle::Header => &self.header_format,
        };
        let worksheet = self.workbook.worksheet_from_index(sheet_index)?;

        match value {
            CellValue::Integer(n) => {
                // Past 15 digits Excel silently rounds; keep the exact digits as text
                if n.unsigned_abs() > EXCEL_MAX_EXACT_INTEGER as u64 {
                    worksheet.write_string_with_format(row, col, n.to_string(), base)?;
                } else {
                    worksheet.write_number_with_format(row, col, *n as f64, base)?;
                }
            }
            CellValue::Number(n) => {
                worksheet.write_number_with_format(row, col, *n, base)?;
            }
            CellValue::Boolean(b) => {
                worksheet.write_boolean_with_format(row, col, *b, base)?;
            }
            CellValue::DateTime(dt) if !EXCEL_YEARS.contains(&dt.year()) => {
                worksheet.write_string_with_format(row, col, dt.format("%Y-%m-%d %H:%M:%S").to_string(), base)?;
            }
            CellValue::Date(d) if !EXCEL_YEARS.contains(&d.year()) => {
                worksheet.write_string_with_format(row, col, d.format("%Y-%m-%d").to_string(), base)?;
            }
            CellValue::DateTime(dt) => {
                let excel = ExcelDateTime::from_ymd(dt.year() as u16, dt.month() as u8, dt.day() as u8)?
                    .and_hms(dt.hour() as u16, dt.minute() as u8, dt.second())?;
                let format = with_style(&self.datetime_format, style);
                worksheet.write_datetime_with_format(row, col, &excel, &format)?;
            }
            CellValue::Date(d) => {
                let excel = ExcelDateTime::from_ymd(d.year() as u16, d.month() as u8, d.day() as u8)?;
                let format = with_style(&self.date_format, style);
                worksheet.write_datetime_with_format(row, col, &excel, &format)?;
            }
            CellValue::Time(t) => {
                let excel = ExcelDateTime::from_hms(t.hour() as u16, t.minute() as u8, t.second())?;
                let format = with_style(&self.time_format, style);
                worksheet.write_datetime_with_format(row, col, &excel, &format)?;
            }
            CellValue::Text(s) => {
                worksheet.write_string_with_format(row, col, s, base)?;
            }
        }

        self.col = col.checked_add(1).ok_or(ExportError::OutOfBounds { row, col })?;
        Ok(())
    }

    /// Encode the workbook as xlsx bytes.
    pub fn serialize(mut self) -> Result<Vec<u8>, ExportError> {
        self.workbook
            .save_to_buffer()
            .map_err(|e| ExportError::Xlsx(format!("Failed to save XLSX: {}", e)))
    }
}

impl Default for SpreadsheetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn with_style(format: &Format, style: CellStyle) -> Format {
    match style {
        CellStyle::Plain => format.clone(),
        CellStyle::Header => format.clone().set_bold(),
    }
}
