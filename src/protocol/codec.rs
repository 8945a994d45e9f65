//! Length-prefixed text codec for message payloads
//!
//! Grammar:
//! - present scalar: `<len>|<value>` where `len` is the character count of `value`
//! - absent value: `-`
//! - sequence: `<count>|` followed by the concatenated item encodings
//!
//! Records have no framing of their own: a record is the concatenation of its
//! fields, written and read in declaration order.

use thiserror::Error;

/// Separator between a length (or count) prefix and what follows it
pub const VALUE_SEPARATOR: char = '|';

/// Marker for an absent value
pub const ENCODED_NULL: char = '-';

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("Missing '|' after length prefix in {0:?}")]
    MissingSeparator(String),

    #[error("Invalid length prefix: {0:?}")]
    InvalidLength(String),

    #[error("Value too short: expected {expected} characters, found {found}")]
    ShortValue { expected: usize, found: usize },

    #[error("Unexpected null value")]
    UnexpectedNull,

    #[error("Cannot parse {value:?} as {target}")]
    InvalidValue { value: String, target: &'static str },

    #[error("Sequence item {0} is null")]
    NullSequenceItem(usize),

    #[error("Unexpected trailing data: {0:?}")]
    TrailingData(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A value with a hand-written wire encoding
pub trait Encode {
    /// Append this value's encoding to `enc`
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()>;

    /// Whether this value encodes as the null marker
    fn is_null(&self) -> bool {
        false
    }
}

/// A value with a hand-written wire decoding
pub trait Decode: Sized {
    /// Consume exactly this value's encoding from the front of `dec`
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self>;
}

/// Accumulates encoded values into a payload string
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: String,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Encode one value of any encodable type
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) -> CodecResult<()> {
        value.encode(self)
    }

    /// Write a present scalar as `<len>|<value>`
    pub fn put_scalar(&mut self, value: &str) {
        self.buf.push_str(&value.chars().count().to_string());
        self.buf.push(VALUE_SEPARATOR);
        self.buf.push_str(value);
    }

    /// Write the null marker
    pub fn put_null(&mut self) {
        self.buf.push(ENCODED_NULL);
    }

    /// Write a sequence header and every item.
    ///
    /// Null items are rejected before anything is written.
    pub fn put_seq<T: Encode>(&mut self, items: &[T]) -> CodecResult<()> {
        if let Some(index) = items.iter().position(|item| item.is_null()) {
            return Err(CodecError::NullSequenceItem(index));
        }

        // Encode into a scratch buffer so a failing item leaves `self` untouched
        let mut scratch = Encoder::new();
        scratch.buf.push_str(&items.len().to_string());
        scratch.buf.push(VALUE_SEPARATOR);
        for item in items {
            item.encode(&mut scratch)?;
        }
        self.buf.push_str(&scratch.buf);
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// Cursor over an encoded payload.
///
/// Every read consumes its prefix of the input and leaves the rest for the
/// next read, so a multi-field body is decoded one value at a time.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    /// The not yet consumed part of the input
    pub fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Whether the next value is the null marker
    pub fn peek_null(&self) -> bool {
        self.remaining().starts_with(ENCODED_NULL)
    }

    /// Decode one value of any decodable type
    pub fn get<T: Decode>(&mut self) -> CodecResult<T> {
        T::decode(self)
    }

    /// Fail unless the whole input has been consumed
    pub fn finish(&self) -> CodecResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingData(self.remaining().to_string()))
        }
    }

    /// Consume the null marker if it is next
    pub fn take_null(&mut self) -> bool {
        if self.peek_null() {
            self.pos += ENCODED_NULL.len_utf8();
            true
        } else {
            false
        }
    }

    /// Read a `<n>|` prefix and return `n`
    pub fn read_count(&mut self) -> CodecResult<usize> {
        let rest = self.remaining();
        if rest.is_empty() {
            return Err(CodecError::Truncated("length prefix"));
        }

        let sep = rest
            .find(VALUE_SEPARATOR)
            .ok_or_else(|| CodecError::MissingSeparator(rest.to_string()))?;
        let digits = &rest[..sep];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::InvalidLength(digits.to_string()));
        }
        let count = digits
            .parse::<usize>()
            .map_err(|_| CodecError::InvalidLength(digits.to_string()))?;

        self.pos += sep + VALUE_SEPARATOR.len_utf8();
        Ok(count)
    }

    /// Read a scalar; `None` for the null marker
    pub fn read_scalar(&mut self) -> CodecResult<Option<&'a str>> {
        if self.take_null() {
            return Ok(None);
        }

        let len = self.read_count()?;
        let rest = self.remaining();
        let end = match rest.char_indices().nth(len) {
            Some((idx, _)) => idx,
            None => {
                let found = rest.chars().count();
                if found < len {
                    return Err(CodecError::ShortValue { expected: len, found });
                }
                rest.len()
            }
        };

        self.pos += end;
        Ok(Some(&rest[..end]))
    }

    /// Read a scalar that must be present
    pub fn read_str(&mut self) -> CodecResult<&'a str> {
        self.read_scalar()?.ok_or(CodecError::UnexpectedNull)
    }

    /// Read a sequence of items that must be present
    pub fn read_seq<T: Decode>(&mut self) -> CodecResult<Vec<T>> {
        if self.peek_null() {
            return Err(CodecError::UnexpectedNull);
        }
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

/// Encode a single value into a fresh payload string
pub fn encode<T: Encode + ?Sized>(value: &T) -> CodecResult<String> {
    let mut enc = Encoder::new();
    value.encode(&mut enc)?;
    Ok(enc.finish())
}

/// Decode a single value that must span the whole input
pub fn decode<T: Decode>(input: &str) -> CodecResult<T> {
    let mut dec = Decoder::new(input);
    let value = T::decode(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

macro_rules! scalar_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
                    enc.put_scalar(&self.to_string());
                    Ok(())
                }
            }

            impl Decode for $ty {
                fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
                    let raw = dec.read_str()?;
                    raw.parse::<$ty>().map_err(|_| CodecError::InvalidValue {
                        value: raw.to_string(),
                        target: stringify!($ty),
                    })
                }
            }
        )*
    };
}

scalar_codec!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);

impl Encode for str {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put_scalar(self);
        Ok(())
    }
}

impl Encode for String {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put_scalar(self);
        Ok(())
    }
}

impl Decode for String {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        dec.read_str().map(str::to_string)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        (**self).encode(enc)
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        match self {
            Some(value) => value.encode(enc),
            None => {
                enc.put_null();
                Ok(())
            }
        }
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        if dec.take_null() {
            Ok(None)
        } else {
            T::decode(dec).map(Some)
        }
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put_seq(self)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put_seq(self)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        dec.read_seq()
    }
}
