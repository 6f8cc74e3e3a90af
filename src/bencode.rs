//! A minimal bencode value type.
//!
//! `serde_bencode` handles the metainfo file well because its shape is
//! known up front, but a tracker's announce response is looser: the
//! `peers` key may be either a single string of packed 6-byte entries (BEP
//! 23's compact form) or a list of dictionaries, depending on the tracker.
//! Decoding into this untyped [`Value`] first and inspecting the shape
//! afterwards avoids needing two parallel `serde` structs for the same
//! field.

use std::collections::BTreeMap;

use crate::error::*;

/// A decoded bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Bencode dictionary keys are themselves bencoded byte strings; we keep
    /// them in a sorted map both because that's how they must appear on the
    /// wire and because it gives predictable iteration order.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

/// Decodes a single bencoded value from the start of `buf`, returning the
/// value and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Value, usize)> {
    if buf.is_empty() {
        return Err(bencode_err("unexpected end of input"));
    }
    match buf[0] {
        b'i' => decode_int(buf),
        b'l' => decode_list(buf),
        b'd' => decode_dict(buf),
        b'0'..=b'9' => decode_bytes(buf),
        other => Err(bencode_err(&format!("unexpected token '{}'", other as char))),
    }
}

fn bencode_err(msg: &str) -> Error {
    Error::InvalidMetainfo(format!("bencode: {}", msg))
}

fn decode_int(buf: &[u8]) -> Result<(Value, usize)> {
    let end = find(buf, b'e')?;
    let text = std::str::from_utf8(&buf[1..end])
        .map_err(|_| bencode_err("non-utf8 integer"))?;
    let n: i64 = text
        .parse()
        .map_err(|_| bencode_err("invalid integer"))?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytes(buf: &[u8]) -> Result<(Value, usize)> {
    let colon = find(buf, b':')?;
    let len_text = std::str::from_utf8(&buf[..colon])
        .map_err(|_| bencode_err("non-utf8 string length"))?;
    let len: usize = len_text
        .parse()
        .map_err(|_| bencode_err("invalid string length"))?;
    let start = colon + 1;
    let end = start + len;
    if end > buf.len() {
        return Err(bencode_err("string length exceeds input"));
    }
    Ok((Value::Bytes(buf[start..end].to_vec()), end))
}

fn decode_list(buf: &[u8]) -> Result<(Value, usize)> {
    let mut pos = 1;
    let mut items = Vec::new();
    loop {
        if pos >= buf.len() {
            return Err(bencode_err("unterminated list"));
        }
        if buf[pos] == b'e' {
            pos += 1;
            break;
        }
        let (value, consumed) = decode(&buf[pos..])?;
        items.push(value);
        pos += consumed;
    }
    Ok((Value::List(items), pos))
}

fn decode_dict(buf: &[u8]) -> Result<(Value, usize)> {
    let mut pos = 1;
    let mut map = BTreeMap::new();
    loop {
        if pos >= buf.len() {
            return Err(bencode_err("unterminated dict"));
        }
        if buf[pos] == b'e' {
            pos += 1;
            break;
        }
        let (key, consumed) = decode_bytes(&buf[pos..])?;
        pos += consumed;
        let key = match key {
            Value::Bytes(b) => b,
            _ => unreachable!(),
        };
        let (value, consumed) = decode(&buf[pos..])?;
        pos += consumed;
        map.insert(key, value);
    }
    Ok((Value::Dict(map), pos))
}

fn find(buf: &[u8], needle: u8) -> Result<usize> {
    buf.iter()
        .position(|&b| b == needle)
        .ok_or_else(|| bencode_err("missing delimiter"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_int() {
        let (value, consumed) = decode(b"i42e").unwrap();
        assert_eq!(value, Value::Int(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn decodes_negative_int() {
        let (value, _) = decode(b"i-7e").unwrap();
        assert_eq!(value, Value::Int(-7));
    }

    #[test]
    fn decodes_bytes() {
        let (value, consumed) = decode(b"4:spam").unwrap();
        assert_eq!(value, Value::Bytes(b"spam".to_vec()));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn decodes_list() {
        let (value, _) = decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec())
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let (value, _) = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get(&b"cow"[..]).unwrap().as_bytes(), Some(&b"moo"[..]));
        assert_eq!(dict.get(&b"spam"[..]).unwrap().as_bytes(), Some(&b"eggs"[..]));
    }

    #[test]
    fn decodes_tracker_response_with_compact_peers() {
        let body = b"d8:intervali900e5:peers12:\x7F\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let (value, _) = decode(body).unwrap();
        assert_eq!(value.get("interval").unwrap().as_int(), Some(900));
        assert_eq!(value.get("peers").unwrap().as_bytes().unwrap().len(), 12);
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"4:sp").is_err());
    }
}
