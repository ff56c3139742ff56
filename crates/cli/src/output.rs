//! Rendering of delivered interrupt payloads

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::{self, Write};

/// How `listen` prints each delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `0x1 0xff ` per byte, one line per delivery
    #[default]
    Hex,
    /// Space separated decimal bytes, one line per delivery
    Decimal,
    /// Bytes written unchanged, no separators
    Raw,
}

/// Text rendering of one delivery, newline included
///
/// Returns `None` for [`OutputFormat::Raw`], which is written as bytes.
pub fn format_delivery(format: OutputFormat, data: &[u8]) -> Option<String> {
    let mut line = String::with_capacity(data.len() * 5 + 1);
    match format {
        OutputFormat::Hex => {
            for byte in data {
                let _ = write!(line, "{:#x} ", byte);
            }
        }
        OutputFormat::Decimal => {
            let parts: Vec<String> = data.iter().map(u8::to_string).collect();
            line.push_str(&parts.join(" "));
        }
        OutputFormat::Raw => return None,
    }
    line.push('\n');
    Some(line)
}

/// Write one delivery to `out`
pub fn write_delivery<W: Write>(out: &mut W, format: OutputFormat, data: &[u8]) -> io::Result<()> {
    match format_delivery(format, data) {
        Some(line) => out.write_all(line.as_bytes())?,
        None => out.write_all(data)?,
    }
    out.flush()
}
