//! Batch encoder for ClickHouse bulk inserts
//!
//! Turns buffered rows into an `INSERT` statement plus a data body. Values are
//! never interpolated into the statement; they travel in the body in one of
//! two ClickHouse input formats:
//!
//! ```text
//! JSONCompactEachRow                      Values
//! ──────────────────                      ──────
//! INSERT INTO `t` (`a`, `b`)              INSERT INTO `t` (`a`, `b`) VALUES
//!   FORMAT JSONCompactEachRow
//! [1,"x"]                                 (1, 'x'), (2, 'y\'s')
//! [2,"y's"]
//! ```
//!
//! Identifiers are always backtick-quoted with escaping, so table and column
//! names taken from ingested records cannot break out of the statement.

use crate::error::EncodeError;
use crate::record::{Value, non_finite_literal};
use bytes::Bytes;
use std::fmt::Write as _;
use std::str::FromStr;

/// Data format used for the bulk-insert body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchFormat {
    /// One JSON array per row
    #[default]
    JsonCompactEachRow,
    /// SQL literal tuples
    Values,
}

impl BatchFormat {
    /// Name used in the configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchFormat::JsonCompactEachRow => "json",
            BatchFormat::Values => "values",
        }
    }
}

impl FromStr for BatchFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "jsoncompacteachrow" => Ok(BatchFormat::JsonCompactEachRow),
            "values" => Ok(BatchFormat::Values),
            other => Err(format!("{other} (expected 'json' or 'values')")),
        }
    }
}

/// One encoded bulk insert
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPayload {
    /// Destination table
    pub table: String,
    /// Column names, aligned with every row
    pub columns: Vec<String>,
    /// Body format
    pub format: BatchFormat,
    /// `INSERT` statement (no values)
    pub statement: String,
    /// Encoded rows
    pub body: Bytes,
    /// Number of rows in `body`
    pub rows: usize,
}

/// Quote an identifier with backticks
///
/// ```
/// use kasa_gateway::encode::quote_identifier;
///
/// assert_eq!(quote_identifier("events"), "`events`");
/// assert_eq!(quote_identifier("we`ird"), "`we\\`ird`");
/// ```
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('`');
    for c in name.chars() {
        match c {
            '`' => quoted.push_str("\\`"),
            '\\' => quoted.push_str("\\\\"),
            c => quoted.push(c),
        }
    }
    quoted.push('`');
    quoted
}

/// Encode a value as a ClickHouse SQL literal
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => match non_finite_literal(*f) {
            Some(literal) => literal.to_string(),
            None => format!("{f:?}"),
        },
        Value::String(s) => quote_string(s),
    }
}

fn quote_string(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '\0' => quoted.push_str("\\0"),
            c if c.is_control() && (c as u32) < 0x80 => {
                let _ = write!(quoted, "\\x{:02x}", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Build the bulk-insert payload for one table
///
/// Groups are written in order and never reordered. Encoding stops at the
/// first group whose width differs from `fields`, so a payload always holds
/// every group it was given.
pub fn encode<I, G>(
    table: &str,
    fields: &[String],
    groups: I,
    format: BatchFormat,
) -> Result<BatchPayload, EncodeError>
where
    I: IntoIterator<Item = G>,
    G: AsRef<[Value]>,
{
    let columns = fields
        .iter()
        .map(|f| quote_identifier(f))
        .collect::<Vec<_>>()
        .join(", ");

    let mut statement = format!("INSERT INTO {} ({columns})", quote_identifier(table));
    let mut body: Vec<u8> = Vec::new();
    let mut rows = 0;

    let check_width = |row: usize, values: &[Value]| {
        if values.len() == fields.len() {
            Ok(())
        } else {
            Err(EncodeError::RowWidth {
                row,
                expected: fields.len(),
                got: values.len(),
            })
        }
    };

    match format {
        BatchFormat::JsonCompactEachRow => {
            statement.push_str(" FORMAT JSONCompactEachRow");
            for group in groups {
                let row = group.as_ref();
                check_width(rows, row)?;
                serde_json::to_writer(&mut body, row).map_err(|e| EncodeError::Serialize {
                    row: rows,
                    reason: e.to_string(),
                })?;
                body.push(b'\n');
                rows += 1;
            }
        }
        BatchFormat::Values => {
            statement.push_str(" VALUES");
            for group in groups {
                let row = group.as_ref();
                check_width(rows, row)?;
                if rows > 0 {
                    body.extend_from_slice(b", ");
                }
                let literals: Vec<String> = row.iter().map(sql_literal).collect();
                body.push(b'(');
                body.extend_from_slice(literals.join(", ").as_bytes());
                body.push(b')');
                rows += 1;
            }
        }
    }

    Ok(BatchPayload {
        table: table.to_string(),
        columns: fields.to_vec(),
        format,
        statement,
        body: Bytes::from(body),
        rows,
    })
}
