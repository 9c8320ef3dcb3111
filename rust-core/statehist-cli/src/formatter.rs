// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! Output formatters for inspection results.
//!
//! - **Text**: one line per record, aligned for reading in a terminal.
//! - **JSON**: pretty-printed, for piping into other tools.

use std::fmt;

use serde::Serialize;
use statehist_core::{Quark, StateInterval};

/// Available output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown format '{other}'. Valid formats: text, json")),
        }
    }
}

/// An interval together with the path of its attribute.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalRow {
    pub path: String,
    #[serde(flatten)]
    pub interval: StateInterval,
}

impl fmt::Display for IntervalRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iv = &self.interval;
        write!(f, "{:<40} [{}, {}] {}", self.path, iv.start, iv.end, iv.value)
    }
}

/// Render `rows` one per line, or as a JSON array.
pub fn format_rows<T: Serialize + fmt::Display>(rows: &[T], format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(rows)?,
        OutputFormat::Text => rows.iter().map(|r| format!("{r}\n")).collect(),
    })
}

/// Render `quark -> path` pairs.
pub fn format_quarks(rows: &[(Quark, String)], format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => {
            let objects: Vec<_> = rows
                .iter()
                .map(|(quark, path)| serde_json::json!({ "quark": quark, "path": path }))
                .collect();
            serde_json::to_string_pretty(&objects)?
        }
        OutputFormat::Text => rows
            .iter()
            .map(|(quark, path)| format!("{quark:>8}  {path}\n"))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use statehist_core::StateValue;

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("csv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_row_json_is_flat() {
        let row = IntervalRow {
            path: "cpu/status".into(),
            interval: StateInterval::new(0, 9, 3, StateValue::Int(1)),
        };
        let json = format_rows(&[row], OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["path"], "cpu/status");
        assert_eq!(parsed[0]["quark"], 3);
        assert_eq!(parsed[0]["start"], 0);
    }

    #[test]
    fn test_quarks_text() {
        let text = format_quarks(&[(0, "a".into()), (12, "a/b".into())], OutputFormat::Text).unwrap();
        assert_eq!(text, "       0  a\n      12  a/b\n");
    }
}
