use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rvpu_frame::Primitive;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PrimitiveOutput<'a> {
    index: usize,
    code: u32,
    name: &'a str,
    payload_size: usize,
    payload: String,
}

/// One line of JSON per primitive, or one table for all of them.
pub fn print_primitives(prims: &[Primitive], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for (index, prim) in prims.iter().enumerate() {
                let out = PrimitiveOutput {
                    index,
                    code: prim.code,
                    name: prim.name(),
                    payload_size: prim.len(),
                    payload: payload_preview(prim.payload.as_ref()),
                };
                println!(
                    "{}",
                    serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "CODE", "NAME", "SIZE", "PAYLOAD"]);
            for (index, prim) in prims.iter().enumerate() {
                table.add_row(vec![
                    index.to_string(),
                    prim.code.to_string(),
                    prim.name().to_string(),
                    prim.len().to_string(),
                    payload_preview(prim.payload.as_ref()),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (index, prim) in prims.iter().enumerate() {
                println!(
                    "#{index} code={} ({}) size={} payload={}",
                    prim.code,
                    prim.name(),
                    prim.len(),
                    payload_preview(prim.payload.as_ref())
                );
            }
        }
    }
}

/// Print a command report: the serialized value as JSON, or `rows` as a
/// two-column table or an indented listing.
pub fn print_report<T: Serialize>(
    title: &str,
    value: &T,
    rows: &[(&str, String)],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in rows {
                table.add_row(vec![field.to_string(), value.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{title}:");
            let width = rows.iter().map(|(field, _)| field.len()).max().unwrap_or(0);
            for (field, value) in rows {
                println!("  {field:<width$}  {value}");
            }
        }
    }
}

/// UTF-8 payloads verbatim, binary ones as hex up to 32 bytes.
pub fn payload_preview(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    match std::str::from_utf8(payload) {
        Ok(text) if !text.contains('\0') => text.to_string(),
        _ => {
            let hex: String = payload
                .iter()
                .take(32)
                .map(|byte| format!("{byte:02x}"))
                .collect();
            if payload.len() > 32 {
                format!("{hex}... <binary {} bytes>", payload.len())
            } else {
                hex
            }
        }
    }
}

pub fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
