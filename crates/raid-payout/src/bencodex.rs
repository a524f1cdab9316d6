//! bencodex: canonical nested binary dictionary encoding
//!
//! grammar:
//! - null `n`, true `t`, false `f`
//! - integer `i<decimal>e`
//! - binary `<len>:<bytes>`
//! - text `u<len>:<utf8>` (len counts bytes)
//! - list `l<values>e`
//! - dict `d<key value>...e`
//!
//! dictionary keys are binary or text. binary keys sort before text keys and
//! each group sorts by raw bytes, which is exactly the derived `Ord` of
//! [`Key`]. encoding a decoded value therefore reproduces the input bytes.

use crate::error::{PayoutError, Result};
use std::collections::BTreeMap;

/// dictionary key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Binary(Vec<u8>),
    Text(String),
}

impl Key {
    pub fn bin(bytes: impl Into<Vec<u8>>) -> Self {
        Key::Binary(bytes.into())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Key::Text(s.into())
    }
}

pub type Dict = BTreeMap<Key, Value>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i128),
    Binary(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Binary(bytes.into())
    }

    /// build a dict from text keys
    pub fn text_dict<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Key::Text(k.into()), v))
                .collect(),
        )
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// lookup by text key (dicts only)
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(&Key::Text(key.to_string()))
    }

    /// lookup by binary key (dicts only)
    pub fn get_bin(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(&Key::Binary(key.to_vec()))
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(true) => out.push(b't'),
        Value::Bool(false) => out.push(b'f'),
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Binary(b) => encode_binary(b, out),
        Value::Text(t) => encode_text(t, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            // BTreeMap iteration is already canonical key order
            for (k, v) in dict {
                match k {
                    Key::Binary(b) => encode_binary(b, out),
                    Key::Text(t) => encode_text(t, out),
                }
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_binary(b: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

fn encode_text(t: &str, out: &mut Vec<u8>) {
    out.push(b'u');
    out.extend_from_slice(t.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(t.as_bytes());
}

/// strict decode: trailing bytes, unsorted or duplicate keys are rejected
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { buf: bytes, pos: 0 };
    let value = decoder.value()?;
    if decoder.pos != bytes.len() {
        return Err(PayoutError::Decoding(format!(
            "{} trailing bytes after value",
            bytes.len() - decoder.pos
        )));
    }
    Ok(value)
}

/// shortest decimal form only: no `+`, no `-0`, no leading zeros
fn canonical_digits(digits: &[u8], signed: bool) -> Option<&str> {
    let magnitude = match digits {
        [b'-', rest @ ..] if signed => {
            if rest == b"0" {
                return None;
            }
            rest
        }
        _ => digits,
    };
    match magnitude {
        [] => None,
        [b'0', _, ..] => None,
        m if m.iter().all(u8::is_ascii_digit) => std::str::from_utf8(digits).ok(),
        _ => None,
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn err(&self, msg: &str) -> PayoutError {
        PayoutError::Decoding(format!("{} at offset {}", msg, self.pos))
    }

    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.err("unexpected end of input"))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(self.err(&format!("expected '{}'", byte as char)));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'n' => {
                self.pos += 1;
                Ok(Value::Null)
            }
            b't' => {
                self.pos += 1;
                Ok(Value::Bool(true))
            }
            b'f' => {
                self.pos += 1;
                Ok(Value::Bool(false))
            }
            b'i' => {
                self.pos += 1;
                let digits = self.take_until(b'e')?;
                let i = canonical_digits(digits, true)
                    .and_then(|s| s.parse::<i128>().ok())
                    .ok_or_else(|| self.err("invalid integer"))?;
                self.expect(b'e')?;
                Ok(Value::Integer(i))
            }
            b'u' => {
                self.pos += 1;
                Ok(Value::Text(self.text_body()?))
            }
            b'0'..=b'9' => Ok(Value::Binary(self.binary_body()?)),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = Dict::new();
                let mut last: Option<Key> = None;
                while self.peek()? != b'e' {
                    let key = match self.peek()? {
                        b'u' => {
                            self.pos += 1;
                            Key::Text(self.text_body()?)
                        }
                        b'0'..=b'9' => Key::Binary(self.binary_body()?),
                        _ => return Err(self.err("invalid dictionary key")),
                    };
                    if let Some(prev) = &last {
                        if *prev >= key {
                            return Err(self.err("dictionary keys out of order"));
                        }
                    }
                    let value = self.value()?;
                    last = Some(key.clone());
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            other => Err(self.err(&format!("unexpected byte 0x{:02x}", other))),
        }
    }

    fn take_until(&mut self, end: u8) -> Result<&'a [u8]> {
        let buf = self.buf;
        let start = self.pos;
        let rel = buf[start..]
            .iter()
            .position(|b| *b == end)
            .ok_or_else(|| self.err("unterminated token"))?;
        self.pos = start + rel;
        Ok(&buf[start..start + rel])
    }

    fn length_prefix(&mut self) -> Result<usize> {
        let digits = self.take_until(b':')?;
        let len = canonical_digits(digits, false)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.err("invalid length prefix"))?;
        self.pos += 1;
        if self.buf.len() - self.pos < len {
            return Err(self.err("length exceeds input"));
        }
        Ok(len)
    }

    fn binary_body(&mut self) -> Result<Vec<u8>> {
        let len = self.length_prefix()?;
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn text_body(&mut self) -> Result<String> {
        let bytes = self.binary_body()?;
        String::from_utf8(bytes).map_err(|_| self.err("text is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(encode(&Value::Null), b"n");
        assert_eq!(encode(&Value::Bool(true)), b"t");
        assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
        assert_eq!(encode(&Value::binary(b"abc".to_vec())), b"3:abc");
        assert_eq!(encode(&Value::text("héllo")), "u6:héllo".as_bytes());
    }

    #[test]
    fn test_binary_keys_sort_before_text_keys() {
        let mut dict = Dict::new();
        dict.insert(Key::text("a"), Value::Integer(1));
        dict.insert(Key::bin(b"b".to_vec()), Value::Integer(2));
        dict.insert(Key::bin(b"S".to_vec()), Value::Integer(3));
        let bytes = encode(&Value::Dict(dict));
        assert_eq!(bytes, b"d1:Si3e1:bi2eu1:ai1ee");
    }

    #[test]
    fn test_decode_reencodes_identically() {
        let bytes = b"d1:al1:xu1:yni7eeu4:metadu1:kteu1:zfe".to_vec();
        let value = decode(&bytes).unwrap();
        assert_eq!(encode(&value), bytes);
    }

    #[test]
    fn test_decode_rejects_unsorted_keys() {
        assert!(decode(b"du1:bi1eu1:ai2ee").is_err());
        assert!(decode(b"du1:ai1e1:bi2ee").is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_and_truncated() {
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"l").is_err());
    }

    #[test]
    fn test_decode_rejects_non_canonical_numbers() {
        for input in [&b"i007e"[..], b"i-0e", b"i+7e", b"i-07e", b"ie", b"i-e"] {
            assert!(
                matches!(decode(input), Err(PayoutError::Decoding(_))),
                "{:?}",
                String::from_utf8_lossy(input)
            );
        }
        for input in [&b"03:abc"[..], b"u03:abc", b"du01:ai1ee"] {
            assert!(decode(input).is_err(), "{:?}", String::from_utf8_lossy(input));
        }
        assert!(decode(b"+3:abc").is_err());

        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"i-10e").unwrap(), Value::Integer(-10));
        assert_eq!(decode(b"0:").unwrap(), Value::Binary(Vec::new()));
        assert_eq!(encode(&decode(b"10:abcdefghij").unwrap()), b"10:abcdefghij");
    }

    #[test]
    fn test_accessors() {
        let value = decode(b"d1:ni2eu4:typeu3:fooe").unwrap();
        assert_eq!(value.get_bin(b"n").and_then(Value::as_integer), Some(2));
        assert_eq!(value.get("type").and_then(Value::as_text), Some("foo"));
        assert!(value.get("missing").is_none());
    }
}
