//! Reader and writer for `.properties` files.
//!
//! Dotted keys nest (`redis.host=x` becomes `{"redis": {"host": "x"}}`) and
//! nested tables flatten back to dotted keys on write. All values are
//! strings.

use serde_json::{Map, Value};

use super::value::as_string;
use crate::error::StoreError;

pub fn parse(content: &str) -> Result<Map<String, Value>, StoreError> {
    let mut map = Map::new();
    let mut lines = content.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let mut logical = line.trim_start().to_string();
        if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
            continue;
        }
        while ends_with_continuation(&logical) {
            logical.pop();
            match lines.next() {
                Some((_, next)) => logical.push_str(next.trim_start()),
                None => break,
            }
        }

        let (key, value) = split_pair(&logical);
        let key = unescape(key.trim_end());
        if key.is_empty() {
            return Err(StoreError::Properties {
                line: idx + 1,
                message: "empty key".to_string(),
            });
        }
        insert_path(&mut map, &key, Value::String(unescape(value.trim_start())));
    }

    Ok(map)
}

pub fn write(values: &Map<String, Value>) -> String {
    let mut pairs = Vec::new();
    flatten("", values, &mut pairs);

    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(&key);
        out.push_str(" = ");
        out.push_str(&escape(&value));
        out.push('\n');
    }
    out
}

fn flatten(prefix: &str, values: &Map<String, Value>, out: &mut Vec<(String, String)>) {
    for (key, value) in values {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(child) => flatten(&full, child, out),
            Value::Array(items) => {
                let joined: Vec<String> = items.iter().map(as_string).collect();
                out.push((full, joined.join(",")));
            }
            other => out.push((full, as_string(other))),
        }
    }
}

fn insert_path(map: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, tail)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, tail, value);
            }
        }
    }
}

// An odd number of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_pair(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..idx], &line[idx + 1..]),
            c if c.is_whitespace() => {
                let rest = line[idx..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (&line[..idx], rest);
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}
