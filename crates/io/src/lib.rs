// Query result export

pub mod xlsx;

pub use xlsx::{CellStyle, CellValue, ExportError, SpreadsheetBuilder};
