//! Parser for the dot-syntax pipeline source.
//!
//! Two statement forms, terminated by `;` or end of line:
//!
//! ```text
//! ds1 [type=http method=GET url="http://example.com/price"];
//! ds1 -> ds1_parse -> ds1_multiply;
//! ```
//!
//! Option keys are case-insensitive (normalized to lowercase); values may
//! be bare tokens or double-quoted with `\"` escapes. A `digraph { ... }`
//! wrapper and `//` / `#` comments are tolerated. `type` is required on
//! every node; `timeout` is a duration literal such as `250ms` or `1m30s`.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{DagError, Pipeline, TaskNode};
use crate::task::TaskType;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("malformed statement: {0}")]
    Malformed(String),
    #[error("task \"{0}\" is missing a type attribute")]
    MissingType(String),
    #[error("task \"{dot_id}\" has unknown type \"{task_type}\"")]
    UnknownTaskType { dot_id: String, task_type: String },
    #[error("invalid duration literal \"{0}\"")]
    BadDuration(String),
    #[error("task \"{dot_id}\": invalid option {key}: {message}")]
    InvalidOption {
        dot_id: String,
        key: &'static str,
        message: String,
    },
    #[error(transparent)]
    Graph(#[from] DagError),
}

pub fn parse(source: &str) -> Result<Pipeline, ParseError> {
    let mut nodes: Vec<TaskNode> = Vec::new();
    let mut edges: Vec<(String, String)> = Vec::new();

    for statement in split_statements(source) {
        let statement = statement.trim();
        if statement.is_empty() || statement == "{" || statement == "}" {
            continue;
        }
        if statement.starts_with("digraph") {
            continue;
        }

        if statement.contains("->") {
            let mut chain = Vec::new();
            for part in statement.split("->") {
                let name = part.trim();
                if name.is_empty() || !is_identifier(name) {
                    return Err(ParseError::Malformed(statement.to_string()));
                }
                chain.push(name.to_string());
            }
            for pair in chain.windows(2) {
                edges.push((pair[0].clone(), pair[1].clone()));
            }
            continue;
        }

        nodes.push(parse_node(statement)?);
    }

    Ok(Pipeline::new(nodes, &edges)?)
}

fn parse_node(statement: &str) -> Result<TaskNode, ParseError> {
    let (name, attrs) = match statement.find('[') {
        Some(open) => {
            let close = statement
                .rfind(']')
                .ok_or_else(|| ParseError::Malformed(statement.to_string()))?;
            if close < open {
                return Err(ParseError::Malformed(statement.to_string()));
            }
            (
                statement[..open].trim(),
                parse_attrs(&statement[open + 1..close], statement)?,
            )
        }
        None => (statement.trim(), BTreeMap::new()),
    };

    if name.is_empty() || !is_identifier(name) {
        return Err(ParseError::Malformed(statement.to_string()));
    }

    let mut options = attrs;
    let task_type = match options.remove("type") {
        Some(tag) => TaskType::parse(&tag).ok_or_else(|| ParseError::UnknownTaskType {
            dot_id: name.to_string(),
            task_type: tag,
        })?,
        None => return Err(ParseError::MissingType(name.to_string())),
    };
    let timeout = match options.remove("timeout") {
        Some(literal) => Some(parse_duration(&literal)?),
        None => None,
    };

    Ok(TaskNode {
        dot_id: name.to_string(),
        task_type,
        timeout,
        options,
    })
}

fn parse_attrs(body: &str, statement: &str) -> Result<BTreeMap<String, String>, ParseError> {
    let malformed = || ParseError::Malformed(statement.to_string());
    let mut attrs = BTreeMap::new();
    let mut chars = body.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while matches!(chars.peek(), Some(c) if *c != '=' && !c.is_whitespace()) {
            key.push(chars.next().expect("peeked"));
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') || key.is_empty() {
            return Err(malformed());
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            loop {
                let ch = chars.next().ok_or_else(malformed)?;
                if escaped {
                    value.push(ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    break;
                } else {
                    value.push(ch);
                }
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace() && *c != ',') {
                value.push(chars.next().expect("peeked"));
            }
        }

        attrs.insert(key.to_ascii_lowercase(), value);
    }

    Ok(attrs)
}

/// Split the source into statements at `;` or newline, honouring quoted
/// strings and bracketed attribute lists. Comments run to end of line.
fn split_statements(source: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut in_comment = false;
    let mut bracket_depth = 0usize;
    let mut previous = '\0';

    for ch in source.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
                previous = '\0';
                statements.push(std::mem::take(&mut current));
            }
            continue;
        }
        if in_quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            previous = ch;
            continue;
        }
        match ch {
            '"' => {
                in_quote = true;
                current.push(ch);
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                bracket_depth = bracket_depth.saturating_sub(1);
                current.push(ch);
            }
            '#' => in_comment = true,
            '/' if previous == '/' => {
                current.pop();
                in_comment = true;
            }
            ';' => statements.push(std::mem::take(&mut current)),
            '\n' if bracket_depth == 0 => statements.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
        previous = ch;
    }
    statements.push(current);
    statements
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a Go-style duration literal: one or more `<number><unit>`
/// segments, units `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(text: &str) -> Result<Duration, ParseError> {
    let s = text.trim();
    let bad = || ParseError::BadDuration(text.to_string());
    if s.is_empty() {
        return Err(bad());
    }

    let bytes = s.as_bytes();
    let mut total_nanos = 0f64;
    let mut i = 0;
    while i < s.len() {
        let start = i;
        while i < s.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let number: f64 = s[start..i].parse().map_err(|_| bad())?;

        let unit_start = i;
        while i < s.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let nanos_per_unit = match &s[unit_start..i] {
            "ns" => 1f64,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return Err(bad()),
        };
        total_nanos += number * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
