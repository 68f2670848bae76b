//! Streaming recursive-descent JSON scanner.
//!
//! The tokenizer does not build values.  It walks the grammar one byte at a
//! time over a [`ByteReader`] and drives the structural callbacks of a
//! [`TokenSink`]; [`crate::Reader`] layers value materialization on top.
use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::io::ByteReader;
use crate::{Result, RpcError};

/// Structural events produced by the tokenizer.
///
/// All callbacks default to no-ops so a sink only implements what it cares
/// about.  A callback returning an error aborts the scan of the current value.
pub trait TokenSink {
    fn object_begin(&mut self) -> Result<()> {
        Ok(())
    }
    fn object_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn array_begin(&mut self) -> Result<()> {
        Ok(())
    }
    fn array_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn pair_begin(&mut self) -> Result<()> {
        Ok(())
    }
    fn pair_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn string_begin(&mut self) -> Result<()> {
        Ok(())
    }
    fn string_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn number_begin(&mut self) -> Result<()> {
        Ok(())
    }
    fn number_end(&mut self) -> Result<()> {
        Ok(())
    }
    /// One character of string or number content.
    fn char_token(&mut self, _c: char) -> Result<()> {
        Ok(())
    }
    fn bool_token(&mut self, _b: bool) -> Result<()> {
        Ok(())
    }
    fn null_token(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct Tokenizer<R> {
    src: ByteReader<R>,
}

impl<R: AsyncRead + Unpin + Send> Tokenizer<R> {
    pub fn new(src: ByteReader<R>) -> Self {
        Self { src }
    }

    /// Scan exactly one JSON value, driving `sink`.
    ///
    /// Returns `Ok(false)` when the stream ends before the first token of a
    /// value (a clean boundary) and `Ok(true)` after a complete value.  End
    /// of stream anywhere inside a value is [`RpcError::UnexpectedEof`],
    /// except in a number's optional trailing parts, which have no
    /// terminator character and close at end of stream.
    pub async fn next_value<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<bool> {
        self.skip_space().await?;
        if self.src.peek().await?.is_none() {
            return Ok(false);
        }
        self.read_value(sink).await?;
        Ok(true)
    }

    async fn skip_space(&mut self) -> Result<()> {
        while let Some(b) = self.src.peek().await? {
            if matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                self.src.next_byte().await?;
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn next_or_eof(&mut self) -> Result<u8> {
        self.src.next_byte().await?.ok_or(RpcError::UnexpectedEof)
    }

    fn unexpected(&self, found: u8, expected: &'static str) -> RpcError {
        RpcError::Parse {
            found: found as char,
            expected,
            offset: self.src.offset(),
        }
    }

    async fn expect(&mut self, want: u8, expected: &'static str) -> Result<()> {
        let b = self.next_or_eof().await?;
        if b != want {
            return Err(self.unexpected(b, expected));
        }
        Ok(())
    }

    async fn read_value<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        self.skip_space().await?;
        let c = self.src.peek().await?.ok_or(RpcError::UnexpectedEof)?;
        match c {
            b'{' => self.read_object(sink).await,
            b'[' => self.read_array(sink).await,
            b'"' => self.read_string(sink).await,
            b't' => {
                self.read_literal(b"true").await?;
                sink.bool_token(true)
            }
            b'f' => {
                self.read_literal(b"false").await?;
                sink.bool_token(false)
            }
            b'n' => {
                self.read_literal(b"null").await?;
                sink.null_token()
            }
            _ => self.read_number(sink).await,
        }
    }

    /// Boxed indirection for the object/array -> value recursion.
    fn read_value_boxed<'a, S: TokenSink + Send>(
        &'a mut self,
        sink: &'a mut S,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.read_value(sink))
    }

    async fn read_object<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        sink.object_begin()?;
        self.expect(b'{', "'{'").await?;
        self.skip_space().await?;
        if self.src.peek().await? != Some(b'}') {
            loop {
                self.read_pair(sink).await?;
                self.skip_space().await?;
                if self.src.peek().await? == Some(b'}') {
                    break;
                }
                self.expect(b',', "',' or '}'").await?;
                self.skip_space().await?;
            }
        }
        self.expect(b'}', "'}'").await?;
        sink.object_end()
    }

    async fn read_pair<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        sink.pair_begin()?;
        self.read_string(sink).await?;
        self.skip_space().await?;
        self.expect(b':', "':'").await?;
        self.read_value_boxed(sink).await?;
        sink.pair_end()
    }

    async fn read_array<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        sink.array_begin()?;
        self.expect(b'[', "'['").await?;
        self.skip_space().await?;
        if self.src.peek().await? != Some(b']') {
            loop {
                self.read_value_boxed(sink).await?;
                self.skip_space().await?;
                if self.src.peek().await? == Some(b']') {
                    break;
                }
                self.expect(b',', "',' or ']'").await?;
                self.skip_space().await?;
            }
        }
        self.expect(b']', "']'").await?;
        sink.array_end()
    }

    async fn read_literal(&mut self, text: &'static [u8]) -> Result<()> {
        for &want in text {
            let b = self.next_or_eof().await?;
            if b != want {
                return Err(self.unexpected(b, "a literal (true, false or null)"));
            }
        }
        Ok(())
    }

    async fn read_string<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        sink.string_begin()?;
        self.expect(b'"', "'\"'").await?;
        loop {
            let b = self.next_or_eof().await?;
            match b {
                b'"' => break,
                b'\\' => {
                    let c = self.read_escape().await?;
                    sink.char_token(c)?;
                }
                0x00..=0x7f => sink.char_token(b as char)?,
                _ => {
                    let c = self.read_utf8_tail(b).await?;
                    sink.char_token(c)?;
                }
            }
        }
        sink.string_end()
    }

    async fn read_escape(&mut self) -> Result<char> {
        let b = self.next_or_eof().await?;
        Ok(match b {
            b'b' => '\u{8}',
            b'f' => '\u{c}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'"' => '"',
            b'\\' => '\\',
            b'/' => '/',
            b'u' => return self.read_unicode_escape().await,
            other => return Err(self.unexpected(other, "one of b f n r t u \" \\ /")),
        })
    }

    async fn read_hex4(&mut self) -> Result<u16> {
        let mut v: u16 = 0;
        for _ in 0..4 {
            let b = self.next_or_eof().await?;
            let d = (b as char)
                .to_digit(16)
                .ok_or_else(|| self.unexpected(b, "a hex digit"))?;
            v = (v << 4) | d as u16;
        }
        Ok(v)
    }

    /// `\uXXXX`, already past the `u`.  UTF-16 surrogate pairs are combined
    /// into a single code point; lone surrogates are a parse failure.
    async fn read_unicode_escape(&mut self) -> Result<char> {
        let first = self.read_hex4().await?;
        if (0xd800..=0xdbff).contains(&first) {
            self.expect(b'\\', "'\\' introducing a low surrogate escape")
                .await?;
            self.expect(b'u', "'u' introducing a low surrogate escape")
                .await?;
            let second = self.read_hex4().await?;
            if !(0xdc00..=0xdfff).contains(&second) {
                return Err(RpcError::Parse {
                    found: '\u{fffd}',
                    expected: "a low surrogate completing the pair",
                    offset: self.src.offset(),
                });
            }
            let cp = 0x10000 + (((first as u32 - 0xd800) << 10) | (second as u32 - 0xdc00));
            char::from_u32(cp).ok_or(RpcError::Parse {
                found: '\u{fffd}',
                expected: "a Unicode scalar value",
                offset: self.src.offset(),
            })
        } else {
            char::from_u32(first as u32).ok_or(RpcError::Parse {
                found: '\u{fffd}',
                expected: "a Unicode scalar value, not a lone surrogate",
                offset: self.src.offset(),
            })
        }
    }

    async fn read_utf8_tail(&mut self, first: u8) -> Result<char> {
        let extra = match first {
            0xc0..=0xdf => 1,
            0xe0..=0xef => 2,
            0xf0..=0xf7 => 3,
            _ => return Err(self.unexpected(first, "a UTF-8 lead byte")),
        };
        let mut buf = [first, 0, 0, 0];
        for i in 0..extra {
            let b = self.next_or_eof().await?;
            if b & 0xc0 != 0x80 {
                return Err(self.unexpected(b, "a UTF-8 continuation byte"));
            }
            buf[1 + i] = b;
        }
        let s = std::str::from_utf8(&buf[..1 + extra]).map_err(|_| RpcError::Parse {
            found: first as char,
            expected: "a valid UTF-8 sequence",
            offset: self.src.offset(),
        })?;
        s.chars()
            .next()
            .ok_or_else(|| RpcError::bug("decoded UTF-8 sequence was empty"))
    }

    async fn read_number<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        sink.number_begin()?;
        if self.src.peek().await? == Some(b'-') {
            self.advance_into(sink).await?;
        }
        match self.src.peek().await? {
            Some(b'0') => {
                self.advance_into(sink).await?;
            }
            Some(b'1'..=b'9') => {
                self.advance_into(sink).await?;
                while matches!(self.src.peek().await?, Some(b'0'..=b'9')) {
                    self.advance_into(sink).await?;
                }
            }
            Some(other) => return Err(self.unexpected(other, "a digit")),
            None => return Err(RpcError::UnexpectedEof),
        }
        if self.src.peek().await? == Some(b'.') {
            self.advance_into(sink).await?;
            self.trailing_digits(sink).await?;
        }
        if matches!(self.src.peek().await?, Some(b'e' | b'E')) {
            self.advance_into(sink).await?;
            if matches!(self.src.peek().await?, Some(b'+' | b'-')) {
                self.advance_into(sink).await?;
            }
            self.trailing_digits(sink).await?;
        }
        sink.number_end()
    }

    /// Digits in a number's optional trailing parts.  End of stream here is a
    /// natural closure of the number; a non-digit character is not.
    async fn trailing_digits<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        match self.src.peek().await? {
            None => return Ok(()),
            Some(b'0'..=b'9') => {}
            Some(other) => return Err(self.unexpected(other, "a digit")),
        }
        while matches!(self.src.peek().await?, Some(b'0'..=b'9')) {
            self.advance_into(sink).await?;
        }
        Ok(())
    }

    async fn advance_into<S: TokenSink + Send>(&mut self, sink: &mut S) -> Result<()> {
        let b = self.next_or_eof().await?;
        sink.char_token(b as char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<String>,
    }

    impl TokenSink for RecordingSink {
        fn object_begin(&mut self) -> Result<()> {
            self.events.push("{".into());
            Ok(())
        }
        fn object_end(&mut self) -> Result<()> {
            self.events.push("}".into());
            Ok(())
        }
        fn array_begin(&mut self) -> Result<()> {
            self.events.push("[".into());
            Ok(())
        }
        fn array_end(&mut self) -> Result<()> {
            self.events.push("]".into());
            Ok(())
        }
        fn pair_begin(&mut self) -> Result<()> {
            self.events.push("(".into());
            Ok(())
        }
        fn pair_end(&mut self) -> Result<()> {
            self.events.push(")".into());
            Ok(())
        }
        fn string_begin(&mut self) -> Result<()> {
            self.events.push("s<".into());
            Ok(())
        }
        fn string_end(&mut self) -> Result<()> {
            self.events.push(">s".into());
            Ok(())
        }
        fn number_begin(&mut self) -> Result<()> {
            self.events.push("n<".into());
            Ok(())
        }
        fn number_end(&mut self) -> Result<()> {
            self.events.push(">n".into());
            Ok(())
        }
        fn char_token(&mut self, c: char) -> Result<()> {
            self.events.push(c.to_string());
            Ok(())
        }
        fn bool_token(&mut self, b: bool) -> Result<()> {
            self.events.push(b.to_string());
            Ok(())
        }
        fn null_token(&mut self) -> Result<()> {
            self.events.push("null".into());
            Ok(())
        }
    }

    fn tokenizer(input: &[u8]) -> Tokenizer<&[u8]> {
        Tokenizer::new(ByteReader::new(input, CancellationToken::new()))
    }

    #[tokio::test]
    async fn structural_event_order() {
        let mut t = tokenizer(br#"{"a": [1, true]}"#);
        let mut sink = RecordingSink::default();
        assert!(t.next_value(&mut sink).await.unwrap());
        assert_eq!(
            sink.events,
            vec![
                "{", "(", "s<", "a", ">s", "[", "n<", "1", ">n", "true", "]", ")", "}"
            ]
        );
    }

    #[tokio::test]
    async fn clean_boundary_versus_truncation() {
        let mut sink = RecordingSink::default();

        let mut t = tokenizer(b"   ");
        assert!(!t.next_value(&mut sink).await.unwrap());

        let mut t = tokenizer(br#"{"a": 1"#);
        assert!(matches!(
            t.next_value(&mut sink).await,
            Err(RpcError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn number_closes_at_end_of_stream() {
        let mut sink = RecordingSink::default();
        let mut t = tokenizer(b"4711");
        assert!(t.next_value(&mut sink).await.unwrap());
        assert_eq!(sink.events.last().unwrap(), ">n");
    }

    #[tokio::test]
    async fn rejects_unknown_escape() {
        let mut sink = RecordingSink::default();
        let mut t = tokenizer(br#""\x""#);
        assert!(matches!(
            t.next_value(&mut sink).await,
            Err(RpcError::Parse { found: 'x', .. })
        ));
    }

    #[tokio::test]
    async fn reports_offset_of_bad_character() {
        let mut sink = RecordingSink::default();
        let mut t = tokenizer(b"[1, x]");
        match t.next_value(&mut sink).await {
            Err(RpcError::Parse {
                found, offset, ..
            }) => {
                assert_eq!(found, 'x');
                assert_eq!(offset, 4);
            }
            other => panic!("expected a parse failure, got {other:?}"),
        }
    }
}
