// File: src/errors.rs
//
// Embedder-facing rendering of task failures.
// A task failure is a structured traceback list (error condition first,
// then one location record per unwound frame); TracebackReport turns it
// into a readable multi-line diagnostic.

use crate::ident::{ident_name, ids};
use crate::value::Value;
use colored::Colorize;
use std::fmt;

/// Pretty-printer for a traceback list captured inside a catch handler.
///
/// The wrapped value is the list described in the error protocol: element 0
/// is the `[kind, explanation, arg]` condition, element 1 the initial
/// location, and the remaining elements are per-frame records appended as
/// the error crossed frames.
pub struct TracebackReport<'a> {
    traceback: &'a Value,
}

impl<'a> TracebackReport<'a> {
    pub fn new(traceback: &'a Value) -> Self {
        TracebackReport { traceback }
    }
}

fn write_condition(f: &mut fmt::Formatter, condition: &[Value]) -> fmt::Result {
    let kind = condition.first().map(|v| v.to_string()).unwrap_or_default();
    let explanation = match condition.get(1) {
        Some(Value::Str(s)) => s.to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    writeln!(f, "{}: {}", kind.red().bold(), explanation.bold())?;
    match condition.get(2) {
        Some(Value::Int(0)) | None => Ok(()),
        Some(arg) => {
            let note = format!("note: error argument {}", arg);
            writeln!(f, "   {} {}", "=".bright_cyan(), note.bright_cyan())
        }
    }
}

fn location_line(record: &[Value]) -> String {
    match record.first() {
        Some(Value::Symbol(sym)) if *sym == ids().opcode_id || *sym == ids().function_id => {
            let site = if *sym == ids().opcode_id { "opcode" } else { "function" };
            let name = record.get(1).map(|v| v.to_string()).unwrap_or_default();
            format!("in {} {}", site, name)
        }
        Some(Value::Symbol(sym)) if *sym == ids().method_id => {
            format!(
                "thrown from {}, line {}",
                method_site(&record[1..]),
                record.get(4).map(|v| v.to_string()).unwrap_or_default()
            )
        }
        // Per-frame record: [kind, name_or_0, this, definer, line].
        Some(Value::Error(kind)) => {
            format!(
                "~{} in {}, line {}",
                ident_name(*kind),
                method_site(&record[1..]),
                record.get(4).map(|v| v.to_string()).unwrap_or_default()
            )
        }
        _ => String::from("in unknown location"),
    }
}

fn method_site(info: &[Value]) -> String {
    let name = match info.first() {
        Some(Value::Symbol(sym)) => ident_name(*sym).to_string(),
        _ => String::from("<eval>"),
    };
    let this = info.get(1).map(|v| v.to_string()).unwrap_or_default();
    let definer = info.get(2).map(|v| v.to_string()).unwrap_or_default();
    if this == definer {
        format!("{}.{}()", this, name)
    } else {
        format!("{}.{}() (defined on {})", this, name, definer)
    }
}

impl fmt::Display for TracebackReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let frames = match self.traceback {
            Value::List(frames) => frames,
            other => return writeln!(f, "{}: {}", "malformed traceback".red().bold(), other),
        };
        match frames.first() {
            Some(Value::List(condition)) => write_condition(f, condition)?,
            _ => writeln!(f, "{}", "malformed traceback".red().bold())?,
        }
        for frame in frames.iter().skip(1) {
            if let Value::List(record) = frame {
                let line = format!("  --> {}", location_line(record));
                writeln!(f, "{}", line.bright_blue())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::ident;
    use crate::value::Value;

    fn sample_traceback() -> Value {
        let condition = Value::list(vec![
            Value::Error(ident("range")),
            Value::string("Index (4) is greater than length (3)"),
            Value::Int(0),
        ]);
        let location = Value::list(vec![
            Value::Symbol(ids().opcode_id),
            Value::Symbol(ident("INDEX")),
        ]);
        let frame = Value::list(vec![
            Value::Error(ident("range")),
            Value::Symbol(ident("lookup")),
            Value::Dbref(7),
            Value::Dbref(2),
            Value::Int(14),
        ]);
        Value::list(vec![condition, location, frame])
    }

    #[test]
    fn report_carries_kind_explanation_and_frames() {
        let tb = sample_traceback();
        let text = TracebackReport::new(&tb).to_string();
        assert!(text.contains("~range"));
        assert!(text.contains("Index (4) is greater than length (3)"));
        assert!(text.contains("INDEX"));
        assert!(text.contains("lookup"));
        assert!(text.contains("line 14"));
    }

    #[test]
    fn malformed_traceback_does_not_panic() {
        let text = TracebackReport::new(&Value::Int(3)).to_string();
        assert!(text.contains("malformed traceback"));
    }
}
