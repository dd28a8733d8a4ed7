//! Minimal dotenv reading and editing.

use std::collections::BTreeMap;

/// Parse `KEY=value` lines. Comments, blank lines and malformed lines are
/// skipped; an `export ` prefix and matching surrounding quotes are dropped.
/// Later assignments win.
pub fn parse(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, value) = split_assignment(line)?;
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

/// Set `key` to `value`, replacing the first assignment or appending one.
pub fn set(contents: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| match split_assignment(line) {
            Some((existing, _)) if existing == key && !replaced => {
                replaced = true;
                format!("{key}={value}")
            }
            _ => line.to_string(),
        })
        .collect();
    if !replaced {
        lines.push(format!("{key}={value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
