//! Scanner for the comma-delimited `key: value` parameter line.
//!
//! Values end at the first unescaped `,` outside any `"..."`, `{...}` or
//! `[...]` span. Open spans are tracked on an explicit stack of expected
//! closing delimiters, so nesting depth costs heap, not call stack.

use crate::error::MetadataError;

/// Iterator over `(lower-cased key, raw trimmed value)` pairs of one line.
pub struct KeyValuePairs<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> KeyValuePairs<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }
}

impl<'a> Iterator for KeyValuePairs<'a> {
    type Item = Result<(String, &'a str), MetadataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = next_key_value_pair(self.line, &mut self.pos);
        if matches!(item, Some(Err(_))) {
            // Stop after the first structural error
            self.pos = self.line.len();
        }
        item
    }
}

/// Read the pair starting at `*pos` and advance past its terminating comma.
///
/// Returns `None` once only whitespace and separators remain.
pub fn next_key_value_pair<'a>(
    line: &'a str,
    pos: &mut usize,
) -> Option<Result<(String, &'a str), MetadataError>> {
    let rest = &line[*pos..];
    let skipped = rest.len() - rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',').len();
    let start = *pos + skipped;
    if start >= line.len() {
        *pos = line.len();
        return None;
    }

    let key_end = match line[start..].find(|c: char| c == ':' || c == ',') {
        Some(offset) if line.as_bytes()[start + offset] == b':' => start + offset,
        _ => {
            *pos = line.len();
            return Some(Err(MetadataError::format(format!(
                "expected ':' after key '{}'",
                line[start..].split(',').next().unwrap_or("").trim()
            ))));
        }
    };

    let key = line[start..key_end].trim();
    if key.is_empty() {
        *pos = line.len();
        return Some(Err(MetadataError::format("empty key")));
    }

    let value_start = key_end + 1;
    let value_end = match scan_value(line, value_start) {
        Ok(end) => end,
        Err(e) => {
            *pos = line.len();
            return Some(Err(e.with_key(key)));
        }
    };

    *pos = if value_end < line.len() { value_end + 1 } else { line.len() };
    Some(Ok((key.to_lowercase(), line[value_start..value_end].trim())))
}

struct SpanError {
    expected: char,
}

impl SpanError {
    fn with_key(self, key: &str) -> MetadataError {
        MetadataError::format(format!(
            "unterminated span in value of '{}': expected '{}'",
            key, self.expected
        ))
    }
}

/// Byte offset of the comma ending the value that starts at `from`, or the line length.
fn scan_value(line: &str, from: usize) -> Result<usize, SpanError> {
    let mut stack: Vec<char> = Vec::new();
    let mut escaped = false;

    for (offset, c) in line[from..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match stack.last().copied() {
            Some('"') => match c {
                '\\' => escaped = true,
                '"' => {
                    stack.pop();
                }
                _ => {}
            },
            top => match c {
                '\\' => escaped = true,
                '"' => stack.push('"'),
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' => {
                    if top == Some(c) {
                        stack.pop();
                    } else if let Some(expected) = top {
                        return Err(SpanError { expected });
                    }
                    // A stray closer outside any span is literal text
                }
                ',' if stack.is_empty() => return Ok(from + offset),
                _ => {}
            },
        }
    }

    match stack.last() {
        Some(&expected) => Err(SpanError { expected }),
        None => Ok(line.len()),
    }
}

/// Strip one pair of surrounding double quotes and unescape `\"` and `\\`.
pub fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some(next @ ('"' | '\\')) => out.push(next),
                        Some(next) => {
                            out.push('\\');
                            out.push(next);
                        }
                        None => out.push('\\'),
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    }
}
