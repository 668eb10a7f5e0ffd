use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::ErrorKind;

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap` so iteration (and therefore
/// encoding) always yields keys in ascending byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("{num_remaining} unconsumed bytes after value")]
    UnconsumedContents { num_remaining: usize },
    #[error("unterminated structure")]
    InsufficientContents,
    #[error("unsupported tag {value:#04x} at {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("integer at {pos} has leading zeros")]
    IntegerWithLeadingZeros { pos: usize },
    #[error("integer at {pos} has no digits")]
    EmptyInteger { pos: usize },
    #[error("illegal integer literal at {pos}")]
    IllegalInteger { pos: usize },
    #[error("expected 'e' at {pos}")]
    UnterminatedValue { pos: usize },
    #[error("illegal string length at {pos}")]
    IllegalStringLength { pos: usize },
    #[error("expected ':' at {pos}")]
    StringMissingSeparator { pos: usize },
    #[error("dictionary key must be a byte string, found {value}")]
    IllegalDictionaryKeyType { value: String },
    #[error("dictionary key {name} has no value")]
    DanglingDictionaryKey { name: String },
    #[error("duplicate dictionary key {name}")]
    DuplicateDictionaryKey { name: String },
    #[error("nesting too deep at {pos}")]
    NestingTooDeep { pos: usize },
}

impl BencodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BencodeError::IllegalDictionaryKeyType { .. } => ErrorKind::Type,
            _ => ErrorKind::Syntax,
        }
    }
}

type Result<T> = std::result::Result<T, BencodeError>;

/// Deepest list/dictionary nesting the parser will descend into.
pub const MAX_DEPTH: usize = 512;

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02X}", byte)?;
    }
    Ok(())
}

fn is_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte))
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    if is_printable(bytes) {
        // printable ASCII is always valid UTF-8
        write!(f, "{}", String::from_utf8_lossy(bytes))
    } else {
        write_bytes(bytes, f)
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Decodes the whole buffer as exactly one value.
impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let (value, next) = decode(bytes, 0)?;
        if next != bytes.len() {
            Err(BencodeError::UnconsumedContents { num_remaining: bytes.len() - next })
        } else {
            Ok(value)
        }
    }
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        let mut v = Vec::new();
        value.encode_into(&mut v);
        v
    }
}

impl BencodeValue {
    pub fn encode(&self) -> Vec<u8> {
        Vec::from(self)
    }

    fn encode_into(&self, v: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => v.extend(format!("i{}e", i).as_bytes()),
            BencodeValue::ByteString(bytes) => encode_byte_string(bytes, v),
            BencodeValue::List(elements) => {
                v.push(b'l');
                for element in elements {
                    element.encode_into(v);
                }
                v.push(b'e');
            }
            BencodeValue::Dictionary(items) => {
                v.push(b'd');
                for (key, value) in items {
                    encode_byte_string(key, v);
                    value.encode_into(v);
                }
                v.push(b'e');
            }
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }

    /// Renders the value as JSON. Byte strings become (lossy) UTF-8 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::ByteString(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            BencodeValue::List(elements) => {
                serde_json::Value::Array(elements.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dictionary(items) => serde_json::Value::Object(
                items
                    .iter()
                    .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

fn encode_byte_string(bytes: &[u8], v: &mut Vec<u8>) {
    v.extend(format!("{}:", bytes.len()).as_bytes());
    v.extend_from_slice(bytes);
}

/// Decodes one value starting at `offset`, returning it together with the
/// offset of the first byte after it.
pub fn decode(buffer: &[u8], offset: usize) -> Result<(BencodeValue, usize)> {
    let mut parser = BencodeParser { contents: buffer, pos: offset, depth: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

pub fn encode(value: &BencodeValue) -> Vec<u8> {
    value.encode()
}

#[derive(Debug)]
struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> BencodeParser<'a> {
    fn parse_value(&mut self) -> Result<BencodeValue> {
        let first = self.peek()?;
        match first {
            b'i' => self.parse_integer(),
            b'l' => self.nested(Self::parse_list),
            b'd' => self.nested(Self::parse_dictionary),
            b'0'..=b'9' => self.parse_string(),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first }),
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<BencodeValue>) -> Result<BencodeValue> {
        if self.depth == MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep { pos: self.pos });
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    /// Advances over a run of ASCII digits and returns them.
    fn take_digits(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        Ok(&self.contents[start..self.pos])
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let digits = self.take_digits()?;
        if digits.is_empty() {
            return Err(BencodeError::EmptyInteger { pos: start });
        }
        if digits[0] == b'0' {
            if digits.len() > 1 {
                return Err(BencodeError::IntegerWithLeadingZeros { pos: start });
            }
            if negative {
                return Err(BencodeError::IllegalInteger { pos: start });
            }
        }
        let literal = &self.contents[start..self.pos];
        let value = std::str::from_utf8(literal)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::IllegalInteger { pos: start })?;
        self.expect_end()?;
        self.pos += 1;
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<BencodeValue> {
        let start = self.pos;
        let digits = self.take_digits()?;
        let length = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::IllegalStringLength { pos: start })?;
        if self.peek()? != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        self.pos += 1;
        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.contents.len())
            .ok_or(BencodeError::InsufficientContents)?;
        let bytes = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(BencodeValue::ByteString(bytes))
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut values: Vec<BencodeValue> = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.parse_value()? {
                BencodeValue::ByteString(bytes) => bytes,
                other => return Err(BencodeError::IllegalDictionaryKeyType { value: other.to_string() }),
            };
            let name = || String::from_utf8_lossy(&key).into_owned();
            if self.peek()? == b'e' {
                return Err(BencodeError::DanglingDictionaryKey { name: name() });
            }
            if map.contains_key(&key) {
                return Err(BencodeError::DuplicateDictionaryKey { name: name() });
            }
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn peek(&self) -> Result<u8> {
        self.contents.get(self.pos).copied().ok_or(BencodeError::InsufficientContents)
    }

    fn expect_end(&self) -> Result<()> {
        if self.peek()? != b'e' {
            Err(BencodeError::UnterminatedValue { pos: self.pos })
        } else {
            Ok(())
        }
    }
}
