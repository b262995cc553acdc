//! Hash-list grammars: `{"name": "hash", ...}` and `name: hash, name2: hash2`.

use crate::error::MetadataError;

/// Parse `{"name": "hash", "name2": "hash2"}` into ordered `(name, hash)` pairs.
///
/// Whitespace around every token is allowed; anything else out of place is
/// a format error naming what was expected.
pub fn parse_hash_list(input: &str) -> Result<Vec<(String, String)>, MetadataError> {
    let mut cursor = Cursor::new(input);
    let mut entries = Vec::new();

    cursor.skip_ws();
    cursor.expect('{')?;
    cursor.skip_ws();

    if cursor.eat('}') {
        cursor.skip_ws();
        cursor.expect_end()?;
        return Ok(entries);
    }

    loop {
        cursor.skip_ws();
        let name = cursor.quoted()?;
        cursor.skip_ws();
        cursor.expect(':')?;
        cursor.skip_ws();
        let hash = cursor.quoted()?;
        entries.push((name, hash));

        cursor.skip_ws();
        if cursor.eat(',') {
            continue;
        }
        if cursor.eat('}') {
            break;
        }
        return Err(cursor.error("',' or '}'"));
    }

    cursor.skip_ws();
    cursor.expect_end()?;
    Ok(entries)
}

/// Parse the unquoted body of `Lora hashes` / `TI hashes`: `name: hash, name2: hash2`.
pub fn parse_name_hash_pairs(input: &str) -> Result<Vec<(String, String)>, MetadataError> {
    input
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (name, hash) = part
                .rsplit_once(':')
                .ok_or_else(|| MetadataError::format(format!("missing ':' in '{}'", part.trim())))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(MetadataError::format(format!("missing name in '{}'", part.trim())));
            }
            Ok((name.to_string(), parse_hex_hash(name, hash)?))
        })
        .collect()
}

/// Validate a hexadecimal model hash and normalize it to lower case.
///
/// Short (AutoV1/AutoV2) hashes must fit a 64-bit integer; full-length
/// digests are accepted as long as every character is a hex digit.
pub fn parse_hex_hash(key: &str, value: &str) -> Result<String, MetadataError> {
    let hash = value.trim();
    let digits_ok = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
    let valid = digits_ok && (hash.len() > 16 || u64::from_str_radix(hash, 16).is_ok());
    if !valid {
        return Err(MetadataError::invalid(key, value));
    }
    Ok(hash.to_ascii_lowercase())
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), MetadataError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("'{}'", expected)))
        }
    }

    fn expect_end(&self) -> Result<(), MetadataError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(self.error("end of hash list"))
        }
    }

    fn quoted(&mut self) -> Result<String, MetadataError> {
        if !self.eat('"') {
            return Err(self.error("'\"'"));
        }
        let input = self.input;
        let mut out = String::new();
        let mut chars = input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(out);
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                _ => out.push(c),
            }
        }
        self.pos = self.input.len();
        Err(self.error("closing '\"'"))
    }

    fn error(&self, expected: &str) -> MetadataError {
        let found = match self.peek() {
            Some(c) => format!("'{}'", c),
            None => "end of input".to_string(),
        };
        MetadataError::format(format!(
            "hash list: expected {} at offset {}, found {}",
            expected, self.pos, found
        ))
    }
}
