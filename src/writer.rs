//! Encodes [`JsonValue`] trees onto a byte stream.
//!
//! Each call to [`Writer::write_value`] encodes one complete value and
//! flushes it before returning, so a value is never left half-delivered in
//! the output buffer.  Output is ASCII-only: everything outside printable
//! ASCII is emitted as a `\uXXXX` escape.
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::io::ByteWriter;
use crate::{Result, RpcError};

fn encode_char(c: char, out: &mut Vec<u8>) -> Result<()> {
    match c {
        '"' => out.extend_from_slice(b"\\\""),
        '\\' => out.extend_from_slice(b"\\\\"),
        '\u{8}' => out.extend_from_slice(b"\\b"),
        '\u{c}' => out.extend_from_slice(b"\\f"),
        '\n' => out.extend_from_slice(b"\\n"),
        '\r' => out.extend_from_slice(b"\\r"),
        '\t' => out.extend_from_slice(b"\\t"),
        '\u{20}'..='\u{7e}' => out.push(c as u8),
        '\u{0}'..='\u{1f}' => {
            return Err(RpcError::Encode {
                reason: format!("control character U+{:04X} in string", c as u32),
            });
        }
        c if (c as u32) <= 0xffff => {
            out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
        }
        c => {
            return Err(RpcError::Encode {
                reason: format!("code point U+{:X} is outside the Basic Multilingual Plane", c as u32),
            });
        }
    }
    Ok(())
}

fn encode_string(s: &str, out: &mut Vec<u8>) -> Result<()> {
    out.push(b'"');
    for c in s.chars() {
        encode_char(c, out)?;
    }
    out.push(b'"');
    Ok(())
}

fn encode_value(value: &JsonValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        JsonValue::String(s) => encode_string(s, out)?,
        JsonValue::Bool(true) => out.extend_from_slice(b"true"),
        JsonValue::Bool(false) => out.extend_from_slice(b"false"),
        JsonValue::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        JsonValue::Null => out.extend_from_slice(b"null"),
        JsonValue::Object(map) => {
            out.push(b'{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                encode_string(key, out)?;
                out.push(b':');
                encode_value(item, out)?;
            }
            out.push(b'}');
        }
        JsonValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                encode_value(item, out)?;
            }
            out.push(b']');
        }
    }
    Ok(())
}

/// Encode a value into a byte vector.
pub fn to_vec(value: &JsonValue) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_value(value, &mut out)?;
    Ok(out)
}

/// Encode a value into a string.
pub fn to_string(value: &JsonValue) -> Result<String> {
    let bytes = to_vec(value)?;
    String::from_utf8(bytes).map_err(|_| RpcError::bug("encoder produced non-ASCII output"))
}

/// Streaming JSON encoder over an `AsyncWrite`.
pub struct Writer<W> {
    out: ByteWriter<W>,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(inner: W, cancel: CancellationToken) -> Self {
        Self {
            out: ByteWriter::new(inner, cancel),
        }
    }

    /// Encode one value and flush it to the transport.
    ///
    /// Encoding happens fully in memory before any byte reaches the
    /// transport, so an unencodable value leaves nothing on the wire.
    pub async fn write_value(&mut self, value: &JsonValue) -> Result<()> {
        let bytes = to_vec(value)?;
        self.out.write(&bytes).await?;
        self.out.flush().await
    }

    /// Encode any serializable type by reducing it to a [`JsonValue`] first.
    pub async fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| RpcError::Encode {
            reason: e.to_string(),
        })?;
        self.write_value(&value).await
    }

    /// Flush and close the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.out.shutdown().await
    }
}
