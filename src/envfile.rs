//! Reader for `env.d` style files: one `KEY="value"` assignment per line.

use std::collections::BTreeMap;

/// Parses every assignment in `content`. Blank lines and `#` comments are
/// skipped; a matching pair of surrounding quotes is stripped from values.
/// Later assignments of the same key win.
pub fn parse(content: &str) -> BTreeMap<String, String> {
    content.lines().filter_map(parse_line).collect()
}

/// Value of the last assignment to `key`, if any.
pub fn lookup(content: &str, key: &str) -> Option<String> {
    content
        .lines()
        .filter_map(parse_line)
        .filter(|(k, _)| k == key)
        .last()
        .map(|(_, v)| v)
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
