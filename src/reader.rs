//! Materializes tokenizer events into [`JsonValue`] trees.
//!
//! A [`Reader`] repeatedly pulls one top-level value at a time off a byte
//! stream, which is how a connection iterates the back-to-back message stream
//! a peer produces.  Objects carrying the reserved `__jsonclass__` field are
//! handed to a registered revival hook instead of surfacing as plain maps.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value as JsonValue};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::io::ByteReader;
use crate::tokenizer::{TokenSink, Tokenizer};
use crate::{Result, RpcError};

/// Reserved object field that marks a value for class revival.  Its value is
/// `[tag, ...positional-args]`.
pub const CLASS_KEY: &str = "__jsonclass__";

type Constructor =
    Arc<dyn Fn(Vec<JsonValue>, Map<String, JsonValue>) -> Result<JsonValue> + Send + Sync>;

/// Map from class tag to revival constructor.
///
/// When a decoded object contains a well-formed `__jsonclass__` field whose
/// tag is registered here, the constructor receives the positional arguments
/// and the object's remaining fields and produces the revived value.  Objects
/// with an unregistered tag pass through as plain maps.
#[derive(Default, Clone)]
pub struct ClassRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, constructor: F)
    where
        F: Fn(Vec<JsonValue>, Map<String, JsonValue>) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.constructors.insert(tag.into(), Arc::new(constructor));
    }

    fn constructor(&self, tag: &str) -> Option<Constructor> {
        self.constructors.get(tag).cloned()
    }
}

enum Frame {
    Array(Vec<JsonValue>),
    Object(Map<String, JsonValue>),
    Pair {
        key: Option<String>,
        value: Option<JsonValue>,
    },
    Text(String),
    Number(String),
}

/// Stack machine translating tokenizer events into a single value.
struct ValueBuilder<'a> {
    classes: &'a ClassRegistry,
    stack: Vec<Frame>,
    root: Option<JsonValue>,
}

impl<'a> ValueBuilder<'a> {
    fn new(classes: &'a ClassRegistry) -> Self {
        Self {
            classes,
            stack: Vec::new(),
            root: None,
        }
    }

    fn push_value(&mut self, value: JsonValue) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Array(items)) => items.push(value),
            Some(Frame::Pair { key, value: slot }) => match (key.as_ref(), value) {
                (None, JsonValue::String(s)) => *key = Some(s),
                (None, other) => {
                    return Err(RpcError::bug(format!(
                        "object key decoded as non-string value {other}"
                    )));
                }
                (Some(_), v) => *slot = Some(v),
            },
            Some(Frame::Object(_)) => {
                return Err(RpcError::bug("value delivered to an object outside a pair"));
            }
            Some(Frame::Text(_) | Frame::Number(_)) => {
                return Err(RpcError::bug("value delivered inside a scalar token"));
            }
            None => self.root = Some(value),
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Frame> {
        self.stack
            .pop()
            .ok_or_else(|| RpcError::bug("token stack underflow"))
    }

    /// Apply the `__jsonclass__` hook, or return the map unchanged when the
    /// field is absent, malformed, or names an unregistered tag.
    fn revive(&self, mut map: Map<String, JsonValue>) -> Result<JsonValue> {
        let constructor = match map.get(CLASS_KEY) {
            Some(JsonValue::Array(items)) => match items.first() {
                Some(JsonValue::String(tag)) => self.classes.constructor(tag),
                _ => None,
            },
            _ => None,
        };
        let Some(constructor) = constructor else {
            return Ok(JsonValue::Object(map));
        };
        let Some(JsonValue::Array(mut items)) = map.remove(CLASS_KEY) else {
            return Err(RpcError::bug("revival marker changed shape during decode"));
        };
        items.remove(0);
        constructor(items, map)
    }

    fn finish(self) -> Result<JsonValue> {
        if !self.stack.is_empty() {
            return Err(RpcError::bug("token stack not empty after a value"));
        }
        self.root
            .ok_or_else(|| RpcError::bug("no value produced by a completed parse"))
    }
}

impl TokenSink for ValueBuilder<'_> {
    fn object_begin(&mut self) -> Result<()> {
        self.stack.push(Frame::Object(Map::new()));
        Ok(())
    }

    fn object_end(&mut self) -> Result<()> {
        let Frame::Object(map) = self.pop()? else {
            return Err(RpcError::bug("object end without an object frame"));
        };
        let value = self.revive(map)?;
        self.push_value(value)
    }

    fn array_begin(&mut self) -> Result<()> {
        self.stack.push(Frame::Array(Vec::new()));
        Ok(())
    }

    fn array_end(&mut self) -> Result<()> {
        let Frame::Array(items) = self.pop()? else {
            return Err(RpcError::bug("array end without an array frame"));
        };
        self.push_value(JsonValue::Array(items))
    }

    fn pair_begin(&mut self) -> Result<()> {
        self.stack.push(Frame::Pair {
            key: None,
            value: None,
        });
        Ok(())
    }

    fn pair_end(&mut self) -> Result<()> {
        let Frame::Pair { key, value } = self.pop()? else {
            return Err(RpcError::bug("pair end without a pair frame"));
        };
        let (Some(key), Some(value)) = (key, value) else {
            return Err(RpcError::bug("incomplete pair at pair end"));
        };
        match self.stack.last_mut() {
            // last write wins on duplicate keys
            Some(Frame::Object(map)) => {
                map.insert(key, value);
                Ok(())
            }
            _ => Err(RpcError::bug("pair outside an object")),
        }
    }

    fn string_begin(&mut self) -> Result<()> {
        self.stack.push(Frame::Text(String::new()));
        Ok(())
    }

    fn string_end(&mut self) -> Result<()> {
        let Frame::Text(text) = self.pop()? else {
            return Err(RpcError::bug("string end without a string frame"));
        };
        self.push_value(JsonValue::String(text))
    }

    fn number_begin(&mut self) -> Result<()> {
        self.stack.push(Frame::Number(String::new()));
        Ok(())
    }

    fn number_end(&mut self) -> Result<()> {
        let Frame::Number(lexeme) = self.pop()? else {
            return Err(RpcError::bug("number end without a number frame"));
        };
        let number = parse_number(&lexeme)?;
        self.push_value(JsonValue::Number(number))
    }

    fn char_token(&mut self, c: char) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Text(s) | Frame::Number(s)) => {
                s.push(c);
                Ok(())
            }
            _ => Err(RpcError::bug("character outside a string or number")),
        }
    }

    fn bool_token(&mut self, b: bool) -> Result<()> {
        self.push_value(JsonValue::Bool(b))
    }

    fn null_token(&mut self) -> Result<()> {
        self.push_value(JsonValue::Null)
    }
}

/// A lexeme with a fraction or exponent is a float, everything else an
/// integer.
fn parse_number(lexeme: &str) -> Result<Number> {
    let invalid = || RpcError::InvalidNumber {
        lexeme: lexeme.to_string(),
    };
    if lexeme.contains(['.', 'e', 'E']) {
        let f: f64 = lexeme.parse().map_err(|_| invalid())?;
        return Number::from_f64(f).ok_or_else(invalid);
    }
    if let Ok(i) = lexeme.parse::<i64>() {
        return Ok(Number::from(i));
    }
    if let Ok(u) = lexeme.parse::<u64>() {
        return Ok(Number::from(u));
    }
    // magnitude beyond 64 bits, keep it as a float
    let f: f64 = lexeme.parse().map_err(|_| invalid())?;
    Number::from_f64(f).ok_or_else(invalid)
}

/// Streaming JSON decoder with class revival.
pub struct Reader<R> {
    tokenizer: Tokenizer<R>,
    classes: ClassRegistry,
}

impl<R: AsyncRead + Unpin + Send> Reader<R> {
    pub fn new(src: R, cancel: CancellationToken) -> Self {
        Self::with_classes(src, cancel, ClassRegistry::new())
    }

    pub fn with_classes(src: R, cancel: CancellationToken, classes: ClassRegistry) -> Self {
        Self {
            tokenizer: Tokenizer::new(ByteReader::new(src, cancel)),
            classes,
        }
    }

    /// Decode the next top-level value.  `None` means the stream ended
    /// cleanly between values.
    pub async fn read_value(&mut self) -> Result<Option<JsonValue>> {
        let mut builder = ValueBuilder::new(&self.classes);
        if !self.tokenizer.next_value(&mut builder).await? {
            return Ok(None);
        }
        builder.finish().map(Some)
    }
}

/// Decode a single value from an in-memory string.
pub async fn from_str(text: &str) -> Result<JsonValue> {
    Reader::new(text.as_bytes(), CancellationToken::new())
        .read_value()
        .await?
        .ok_or(RpcError::UnexpectedEof)
}
