//! Byte-level cursor shared by the object parser and the xref reader.

#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    pub(crate) fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub(crate) fn peek_n(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos + n).copied()
    }

    pub(crate) fn consume(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Advance while `f` holds and return the consumed bytes.
    pub(crate) fn consume_while<F: Fn(u8) -> bool>(&mut self, f: F) -> &'a [u8] {
        let bytes: &'a [u8] = self.bytes;
        let start = self.pos;
        while let Some(&b) = bytes.get(self.pos) {
            if !f(b) {
                break;
            }
            self.pos += 1;
        }
        &bytes[start..self.pos]
    }

    pub(crate) fn skip_ws_and_comments(&mut self) {
        loop {
            self.consume_while(is_whitespace);
            if self.peek() != Some(b'%') {
                break;
            }
            while let Some(b) = self.consume() {
                if b == b'\n' || b == b'\r' {
                    break;
                }
            }
        }
    }

    pub(crate) fn starts_with(&self, kw: &[u8]) -> bool {
        self.bytes
            .get(self.pos..)
            .is_some_and(|rest| rest.starts_with(kw))
    }

    /// Consume `kw` if it appears at the cursor.
    pub(crate) fn consume_keyword(&mut self, kw: &[u8]) -> bool {
        if self.starts_with(kw) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    /// Like [`consume_keyword`](Self::consume_keyword), but only when the
    /// keyword is not the prefix of a longer regular token.
    pub(crate) fn consume_token(&mut self, kw: &[u8]) -> bool {
        if !self.starts_with(kw) {
            return false;
        }
        match self.bytes.get(self.pos + kw.len()) {
            Some(&b) if is_regular(b) => false,
            _ => {
                self.pos += kw.len();
                true
            }
        }
    }

    /// Read an unsigned decimal integer token.
    pub(crate) fn read_unsigned(&mut self) -> Option<u64> {
        let digits = self.consume_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }
}

pub(crate) fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\x00' | b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

pub(crate) fn is_delim(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

pub(crate) fn is_regular(b: u8) -> bool {
    !is_whitespace(b) && !is_delim(b)
}

pub(crate) fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::Cursor;

    #[test]
    fn comments_are_whitespace() {
        let mut c = Cursor::new(b"  % a comment\r\n\t%another\n  obj", 0);
        c.skip_ws_and_comments();
        assert!(c.starts_with(b"obj"));
    }

    #[test]
    fn token_does_not_match_prefix() {
        let mut c = Cursor::new(b"streamer", 0);
        assert!(!c.consume_token(b"stream"));
        let mut c = Cursor::new(b"stream\n", 0);
        assert!(c.consume_token(b"stream"));
        assert_eq!(c.pos, 6);
    }
}
