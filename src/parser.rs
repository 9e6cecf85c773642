use std::fmt::Display;

use tracing::{trace, warn};

use crate::lexer::{hex_val, is_regular, is_whitespace, Cursor};
use crate::object::{Dictionary, Object, ObjectId, Stream, StringFormat, MAX_OBJECT_NUMBER};
use crate::{AttachError, Result};

const MAX_PARSE_DEPTH: usize = 64;

/// Looks up the value of an indirect `/Length` while a stream is being read.
pub(crate) type LengthResolver<'r> = &'r dyn Fn(ObjectId) -> Option<usize>;

pub(crate) fn malformed(offset: usize, msg: impl Display) -> AttachError {
    AttachError::MalformedDocument(format!("{msg} at byte offset {offset}"))
}

pub(crate) struct Parser<'a, 'r> {
    cur: Cursor<'a>,
    lengths: Option<LengthResolver<'r>>,
}

impl<'a, 'r> Parser<'a, 'r> {
    pub(crate) fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { cur: Cursor::new(bytes, pos), lengths: None }
    }

    pub(crate) fn with_lengths(mut self, lengths: LengthResolver<'r>) -> Self {
        self.lengths = Some(lengths);
        self
    }

    pub(crate) fn position(&self) -> usize {
        self.cur.pos
    }

    pub(crate) fn skip_ws_and_comments(&mut self) {
        self.cur.skip_ws_and_comments();
    }

    pub(crate) fn consume_token(&mut self, kw: &[u8]) -> bool {
        self.cur.consume_token(kw)
    }

    pub(crate) fn read_unsigned(&mut self) -> Option<u64> {
        self.cur.read_unsigned()
    }

    pub(crate) fn parse_object(&mut self) -> Result<Object> {
        self.parse_object_with_depth(0)
    }

    pub(crate) fn parse_dict(&mut self) -> Result<Dictionary> {
        self.cur.skip_ws_and_comments();
        if !self.cur.starts_with(b"<<") {
            return Err(malformed(self.cur.pos, "expected dictionary"));
        }
        self.parse_dict_with_depth(0)
    }

    fn parse_object_with_depth(&mut self, depth: usize) -> Result<Object> {
        if depth >= MAX_PARSE_DEPTH {
            return Err(malformed(self.cur.pos, "object nesting too deep"));
        }
        self.cur.skip_ws_and_comments();
        let start = self.cur.pos;
        let b = self
            .cur
            .peek()
            .ok_or_else(|| malformed(start, "unexpected end of file"))?;
        let obj = match b {
            b'/' => Object::Name(self.parse_name()),
            b'<' if self.cur.peek_n(1) == Some(b'<') => {
                let dict = self.parse_dict_with_depth(depth + 1)?;
                if self.at_stream_keyword() {
                    let content = self.parse_stream_body(&dict)?;
                    Object::Stream(Stream::new(dict, content))
                } else {
                    Object::Dictionary(dict)
                }
            }
            b'<' => Object::String(self.parse_hex_string()?, StringFormat::Hexadecimal),
            b'(' => Object::String(self.parse_literal_string()?, StringFormat::Literal),
            b'[' => Object::Array(self.parse_array_with_depth(depth + 1)?),
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.parse_number_or_ref()?,
            _ if self.cur.consume_token(b"true") => Object::Boolean(true),
            _ if self.cur.consume_token(b"false") => Object::Boolean(false),
            _ if self.cur.consume_token(b"null") => Object::Null,
            _ => return Err(malformed(start, format!("unexpected byte 0x{b:02x}"))),
        };
        Ok(obj)
    }

    fn parse_number_or_ref(&mut self) -> Result<Object> {
        let start = self.cur.pos;
        let token = self
            .cur
            .consume_while(|b| matches!(b, b'+' | b'-' | b'.' | b'0'..=b'9'));
        let text = std::str::from_utf8(token).map_err(|_| malformed(start, "invalid number"))?;

        if text.bytes().all(|b| b.is_ascii_digit()) {
            let after_first = self.cur.pos;
            self.cur.skip_ws_and_comments();
            if let Some(gen) = self.cur.read_unsigned() {
                self.cur.skip_ws_and_comments();
                if self.cur.consume_token(b"R") {
                    if let (Ok(num), Ok(gen)) = (text.parse::<u32>(), u16::try_from(gen)) {
                        return Ok(Object::Reference((num, gen)));
                    }
                }
            }
            self.cur.pos = after_first;
        }

        if let Ok(i) = text.parse::<i64>() {
            return Ok(Object::Integer(i));
        }
        match text.parse::<f64>() {
            Ok(r) => Ok(Object::Real(r)),
            // Producers occasionally write "-" or "." for zero.
            Err(_) if matches!(text, "-" | "+" | "." | "-." | "+.") => Ok(Object::Integer(0)),
            Err(_) => Err(malformed(start, format!("invalid number '{text}'"))),
        }
    }

    fn parse_array_with_depth(&mut self, depth: usize) -> Result<Vec<Object>> {
        let start = self.cur.pos;
        self.cur.consume();
        let mut out = Vec::new();
        loop {
            self.cur.skip_ws_and_comments();
            if self.cur.peek() == Some(b']') {
                self.cur.consume();
                return Ok(out);
            }
            if self.cur.eof() {
                return Err(malformed(start, "unterminated array"));
            }
            out.push(self.parse_object_with_depth(depth + 1)?);
        }
    }

    fn parse_dict_with_depth(&mut self, depth: usize) -> Result<Dictionary> {
        let start = self.cur.pos;
        self.cur.consume_keyword(b"<<");
        let mut dict = Dictionary::new();
        loop {
            self.cur.skip_ws_and_comments();
            if self.cur.consume_keyword(b">>") {
                return Ok(dict);
            }
            match self.cur.peek() {
                None => return Err(malformed(start, "unterminated dictionary")),
                Some(b'/') => {}
                Some(b) => {
                    return Err(malformed(
                        self.cur.pos,
                        format!("expected name key in dictionary, found byte 0x{b:02x}"),
                    ))
                }
            }
            let key = self.parse_name();
            self.cur.skip_ws_and_comments();
            if self.cur.starts_with(b">>") {
                warn!(
                    domain = "pdf.parser",
                    kind = "dict_missing_value",
                    offset = self.cur.pos,
                    key = %String::from_utf8_lossy(&key),
                    "Dictionary key without value"
                );
                dict.set(key, Object::Null);
                continue;
            }
            let value = self.parse_object_with_depth(depth + 1)?;
            dict.set(key, value);
        }
    }

    fn parse_name(&mut self) -> Vec<u8> {
        self.cur.consume();
        let raw = self.cur.consume_while(is_regular);
        decode_name(raw)
    }

    fn parse_literal_string(&mut self) -> Result<Vec<u8>> {
        let start = self.cur.pos;
        self.cur.consume();
        let mut depth = 1;
        let mut out = Vec::new();
        while let Some(b) = self.cur.consume() {
            match b {
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push(b);
                }
                b'\\' => {
                    let Some(next) = self.cur.consume() else { break };
                    match next {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'\r' => {
                            if self.cur.peek() == Some(b'\n') {
                                self.cur.consume();
                            }
                        }
                        b'\n' => {}
                        b'0'..=b'7' => {
                            let mut val = u32::from(next - b'0');
                            for _ in 0..2 {
                                match self.cur.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        val = val * 8 + u32::from(d - b'0');
                                        self.cur.consume();
                                    }
                                    _ => break,
                                }
                            }
                            out.push((val & 0xff) as u8);
                        }
                        // Unknown escapes drop the backslash.
                        other => out.push(other),
                    }
                }
                _ => out.push(b),
            }
        }
        Err(malformed(start, "unterminated literal string"))
    }

    fn parse_hex_string(&mut self) -> Result<Vec<u8>> {
        let start = self.cur.pos;
        self.cur.consume();
        let mut nibbles = Vec::new();
        loop {
            match self.cur.consume() {
                None => return Err(malformed(start, "unterminated hex string")),
                Some(b'>') => break,
                Some(b) if is_whitespace(b) => {}
                Some(b) => match hex_val(b) {
                    Some(v) => nibbles.push(v),
                    None => return Err(malformed(self.cur.pos - 1, "invalid hex digit")),
                },
            }
        }
        if nibbles.len() % 2 == 1 {
            nibbles.push(0);
        }
        Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
    }

    fn at_stream_keyword(&self) -> bool {
        let mut probe = self.cur.clone();
        probe.skip_ws_and_comments();
        probe.consume_token(b"stream")
    }

    fn parse_stream_body(&mut self, dict: &Dictionary) -> Result<Vec<u8>> {
        self.cur.skip_ws_and_comments();
        self.cur.consume_token(b"stream");
        // The keyword is followed by CRLF or LF; a lone CR is tolerated.
        if self.cur.peek() == Some(b'\r') {
            self.cur.consume();
        }
        if self.cur.peek() == Some(b'\n') {
            self.cur.consume();
        }
        let bytes = self.cur.bytes;
        let data_start = self.cur.pos;

        let declared = match dict.get(b"Length") {
            Some(Object::Integer(n)) if *n >= 0 => usize::try_from(*n).ok(),
            Some(Object::Reference(id)) => self.lengths.and_then(|resolve| resolve(*id)),
            _ => None,
        };

        if let Some(len) = declared {
            if let Some(end) = data_start.checked_add(len).filter(|end| *end <= bytes.len()) {
                let mut probe = Cursor::new(bytes, end);
                probe.consume_while(is_whitespace);
                if probe.consume_keyword(b"endstream") {
                    self.cur.pos = probe.pos;
                    return Ok(bytes[data_start..end].to_vec());
                }
            }
        }

        let Some(rel) = memchr::memmem::find(&bytes[data_start..], b"endstream") else {
            return Err(malformed(data_start, "stream without endstream"));
        };
        let mut end = data_start + rel;
        if end > data_start && bytes[end - 1] == b'\n' {
            end -= 1;
        }
        if end > data_start && bytes[end - 1] == b'\r' {
            end -= 1;
        }
        warn!(
            domain = "pdf.parser",
            kind = "stream_length_mismatch",
            offset = data_start,
            declared = ?declared,
            actual = end - data_start,
            "Stream /Length does not match data, recovered from endstream"
        );
        self.cur.pos = data_start + rel + b"endstream".len();
        Ok(bytes[data_start..end].to_vec())
    }
}

pub(crate) fn decode_name(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'#' && i + 2 < raw.len() {
            if let (Some(h), Some(l)) = (hex_val(raw[i + 1]), hex_val(raw[i + 2])) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

/// Parse `N G obj ... endobj` at `offset`.
///
/// Returns the object id, the object and the offset just past `endobj`.
pub(crate) fn parse_indirect_object_at(
    bytes: &[u8],
    offset: usize,
    lengths: Option<LengthResolver<'_>>,
) -> Result<(ObjectId, Object, usize)> {
    let mut p = Parser::new(bytes, offset);
    if let Some(lengths) = lengths {
        p = p.with_lengths(lengths);
    }
    p.skip_ws_and_comments();
    let header = p.position();
    let num = p
        .read_unsigned()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| malformed(header, "expected object number"))?;
    if num > MAX_OBJECT_NUMBER {
        return Err(malformed(header, format!("object number {num} is out of range")));
    }
    p.skip_ws_and_comments();
    let gen = p
        .read_unsigned()
        .and_then(|g| u16::try_from(g).ok())
        .ok_or_else(|| malformed(header, "expected generation number"))?;
    p.skip_ws_and_comments();
    if !p.consume_token(b"obj") {
        return Err(malformed(header, "missing obj keyword"));
    }
    let object = p.parse_object()?;
    p.skip_ws_and_comments();
    if !p.consume_token(b"endobj") {
        warn!(
            domain = "pdf.parser",
            kind = "missing_endobj",
            obj = num,
            gen = gen,
            offset = p.position(),
            "Indirect object without endobj"
        );
    }
    trace!(domain = "pdf.parser", obj = num, gen = gen, offset = header, "Parsed indirect object");
    Ok(((num, gen), object, p.position()))
}

/// Find every `N G obj` header in `bytes`, in file order.
pub(crate) fn scan_object_headers(bytes: &[u8]) -> Vec<(ObjectId, usize)> {
    let mut out = Vec::new();
    for hit in memchr::memmem::find_iter(bytes, b"obj") {
        if hit >= 3 && &bytes[hit - 3..hit] == b"end" {
            continue;
        }
        if bytes.get(hit + 3).is_some_and(|b| is_regular(*b)) {
            continue;
        }
        let mut i = hit;
        let ws_end = i;
        while i > 0 && is_whitespace(bytes[i - 1]) {
            i -= 1;
        }
        if i == ws_end {
            continue;
        }
        let gen_end = i;
        while i > 0 && bytes[i - 1].is_ascii_digit() {
            i -= 1;
        }
        if i == gen_end {
            continue;
        }
        let gen_start = i;
        while i > 0 && is_whitespace(bytes[i - 1]) {
            i -= 1;
        }
        if i == gen_start {
            continue;
        }
        let num_end = i;
        while i > 0 && bytes[i - 1].is_ascii_digit() {
            i -= 1;
        }
        if i == num_end || (i > 0 && is_regular(bytes[i - 1])) {
            continue;
        }
        let num = std::str::from_utf8(&bytes[i..num_end]).ok().and_then(|s| s.parse().ok());
        let gen = std::str::from_utf8(&bytes[gen_start..gen_end])
            .ok()
            .and_then(|s| s.parse().ok());
        if let (Some(num), Some(gen)) = (num, gen) {
            if num > MAX_OBJECT_NUMBER {
                continue;
            }
            out.push(((num, gen), i));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Object {
        Parser::new(data, 0).parse_object().unwrap()
    }

    #[test]
    fn parses_reference_inside_dictionary() {
        let obj = parse(b"<< /Type /Catalog /Pages 2 0 R /Count 3 >>");
        let dict = obj.as_dict().unwrap();
        assert!(dict.has_type(b"Catalog"));
        assert_eq!(dict.get(b"Pages"), Some(&Object::Reference((2, 0))));
        assert_eq!(dict.get(b"Count"), Some(&Object::Integer(3)));
    }

    #[test]
    fn integers_not_followed_by_r_stay_integers() {
        let obj = parse(b"[0 0 612 792]");
        assert_eq!(
            obj.as_array().unwrap(),
            &[Object::Integer(0), Object::Integer(0), Object::Integer(612), Object::Integer(792)]
        );
    }

    #[test]
    fn literal_string_escapes() {
        let obj = parse(b"(Hi\\nWorld \\(x\\) \\101\\\n!)");
        assert_eq!(obj.as_str().unwrap(), b"Hi\nWorld (x) A!");
    }

    #[test]
    fn balanced_parentheses_need_no_escape() {
        let obj = parse(b"(a (b) c)");
        assert_eq!(obj.as_str().unwrap(), b"a (b) c");
    }

    #[test]
    fn hex_string_with_whitespace_and_odd_length() {
        let obj = parse(b"<48 65 6C6C 6F7>");
        assert_eq!(obj, Object::String(b"Hello\x70".to_vec(), StringFormat::Hexadecimal));
    }

    #[test]
    fn name_escapes_are_decoded() {
        assert_eq!(parse(b"/application#2Fxml"), Object::name("application/xml"));
    }

    #[test]
    fn reals_and_signs() {
        assert_eq!(parse(b"-3.5"), Object::Real(-3.5));
        assert_eq!(parse(b".25"), Object::Real(0.25));
        assert_eq!(parse(b"+7"), Object::Integer(7));
    }

    #[test]
    fn stream_uses_declared_length() {
        let data = b"1 0 obj\n<< /Length 5 >>\nstream\r\nab\ncd\nendstream\nendobj\n";
        let (id, obj, end) = parse_indirect_object_at(data, 0, None).unwrap();
        assert_eq!(id, (1, 0));
        assert_eq!(obj.as_stream().unwrap().content, b"ab\ncd");
        assert_eq!(end, data.len() - 1);
    }

    #[test]
    fn stream_with_wrong_length_is_recovered() {
        let data = b"4 0 obj\n<< /Length 99 >>\nstream\nabc\nendstream\nendobj";
        let (_, obj, _) = parse_indirect_object_at(data, 0, None).unwrap();
        assert_eq!(obj.as_stream().unwrap().content, b"abc");
    }

    #[test]
    fn stream_with_indirect_length() {
        let data = b"4 0 obj\n<< /Length 9 0 R >>\nstream\nendstreamX\nendstream\nendobj";
        let resolve = |id: ObjectId| (id == (9, 0)).then_some(10);
        let (_, obj, _) = parse_indirect_object_at(data, 0, Some(&resolve)).unwrap();
        assert_eq!(obj.as_stream().unwrap().content, b"endstreamX");
    }

    #[test]
    fn missing_value_and_unterminated_input() {
        let obj = parse(b"<< /A >>");
        assert_eq!(obj.as_dict().unwrap().get(b"A"), Some(&Object::Null));
        assert!(Parser::new(b"<< /A 1", 0).parse_object().is_err());
        assert!(Parser::new(b"(abc", 0).parse_object().is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let data = vec![b'['; 200];
        let err = Parser::new(&data, 0).parse_object().unwrap_err();
        assert!(matches!(err, AttachError::MalformedDocument(_)));
    }

    #[test]
    fn scan_finds_headers_but_not_endobj() {
        let data = b"%PDF-1.4\n1 0 obj<<>>endobj\n 12 3 obj\n(x)\nendobj\nfoo1 0 obj";
        let found = scan_object_headers(data);
        assert_eq!(found, vec![((1, 0), 9), ((12, 3), 28)]);
    }

    #[test]
    fn object_numbers_past_limit_are_rejected() {
        let data = b"8388608 0 obj\n42\nendobj\n";
        assert!(matches!(
            parse_indirect_object_at(data, 0, None),
            Err(AttachError::MalformedDocument(_))
        ));
        assert!(scan_object_headers(data).is_empty());

        let (id, _, _) = parse_indirect_object_at(b"8388607 0 obj 1 endobj", 0, None).unwrap();
        assert_eq!(id, (MAX_OBJECT_NUMBER, 0));
    }
}
