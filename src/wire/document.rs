//! The key/value document carried in a message body (§3). Value types:
//! 64-bit int, double, UTF-8 string, byte string, bool, null, nested
//! document, ordered list. Wire ordering is preserved (a `Vec` of pairs,
//! not a `HashMap`) but is not semantically meaningful to consumers, per
//! spec.
//!
//! The concrete wire format is MessagePack via `rmp-serde` + `serde` (the
//! serializer is specified in the abstract — "any serializer supporting the
//! value types listed ... is acceptable" — this crate's pick is grounded on
//! `examples/drewcrawford-exfiltrate`, the pack member that depends on the
//! same crate pair for its own message bodies).

use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Result;

/// A single value in a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Null,
    Doc(Vec<(String, Document)>),
    List(Vec<Document>),
}

impl Document {
    /// Builds an empty document body (used for zero-length message bodies).
    pub fn empty_doc() -> Self {
        Document::Doc(Vec::new())
    }

    pub fn as_doc(&self) -> Option<&[(String, Document)]> {
        match self {
            Document::Doc(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a key in a `Doc` value. Returns `None` if this isn't a
    /// `Doc` or the key is absent.
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.as_doc()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Document::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Document::Float(f) => Some(*f),
            Document::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Document::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Document::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Document]> {
        match self {
            Document::List(l) => Some(l),
            _ => None,
        }
    }

    /// Builder helper: sets `key` to `value` on a `Doc`, in place,
    /// replacing any existing entry with the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Document>) {
        let key = key.into();
        let entries = match self {
            Document::Doc(entries) => entries,
            _ => {
                *self = Document::Doc(Vec::new());
                match self {
                    Document::Doc(entries) => entries,
                    _ => unreachable!(),
                }
            }
        };
        let value = value.into();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
    }
}

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Document {
            fn from(v: $ty) -> Self {
                Document::$variant(v.into())
            }
        }
    };
}

impl_from!(Int, i64);
impl_from!(Int, i32);
impl_from!(Int, u32);
impl_from!(Float, f64);
impl_from!(Str, String);
impl_from!(Bytes, Vec<u8>);
impl_from!(Bool, bool);

impl From<&str> for Document {
    fn from(v: &str) -> Self {
        Document::Str(v.to_string())
    }
}

impl From<Vec<Document>> for Document {
    fn from(v: Vec<Document>) -> Self {
        Document::List(v)
    }
}

/// A builder for `Doc` values with a fluent call chain, used by message
/// constructors.
#[derive(Debug, Default, Clone)]
pub struct DocBuilder(Vec<(String, Document)>);

impl DocBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Document>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Document {
        Document::Doc(self.0)
    }
}

/// Encodes a document body to bytes.
pub fn encode_body(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.serialize(&mut rmp_serde::Serializer::new(&mut buf))?;
    Ok(buf)
}

/// Decodes a document body from bytes. An empty slice decodes to the empty
/// document (header `length == 0` case, §4.2).
pub fn decode_body(bytes: &[u8]) -> Result<Document> {
    if bytes.is_empty() {
        return Ok(Document::empty_doc());
    }
    let mut de = rmp_serde::Deserializer::new(bytes);
    Ok(Document::deserialize(&mut de)?)
}

impl Serialize for Document {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Document::Int(i) => serializer.serialize_i64(*i),
            Document::Float(f) => serializer.serialize_f64(*f),
            Document::Str(s) => serializer.serialize_str(s),
            Document::Bytes(b) => serializer.serialize_bytes(b),
            Document::Bool(b) => serializer.serialize_bool(*b),
            Document::Null => serializer.serialize_unit(),
            Document::Doc(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Document::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DocumentVisitor)
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = Document;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a document value (int, float, string, bytes, bool, null, map, or sequence)")
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<Self::Value, E> {
        Ok(Document::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(Document::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(Document::Int(v as i64))
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(Document::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(Document::Str(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<Self::Value, E> {
        Ok(Document::Str(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        Ok(Document::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E> {
        Ok(Document::Bytes(v))
    }

    fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
        Ok(Document::Null)
    }

    fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
        Ok(Document::Null)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Document::List(items))
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::new();
        while let Some((k, v)) = map.next_entry::<String, Document>()? {
            entries.push((k, v));
        }
        Ok(Document::Doc(entries))
    }
}

impl std::ops::Index<&str> for Document {
    type Output = Document;

    fn index(&self, key: &str) -> &Document {
        self.get(key)
            .unwrap_or_else(|| panic!("document has no field {key:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_value_kinds() {
        let doc = DocBuilder::new()
            .field("i", 42i64)
            .field("f", 1.5f64)
            .field("s", "hello")
            .field("b", Document::Bytes(vec![1, 2, 3]))
            .field("t", true)
            .field("n", Document::Null)
            .field("list", Document::List(vec![Document::Int(1), Document::Int(2)]))
            .field(
                "nested",
                DocBuilder::new().field("inner", "value").build(),
            )
            .build();
        let encoded = encode_body(&doc).unwrap();
        let decoded = decode_body(&encoded).unwrap();
        assert_eq!(decoded.get("i").unwrap().as_i64(), Some(42));
        assert_eq!(decoded.get("f").unwrap().as_f64(), Some(1.5));
        assert_eq!(decoded.get("s").unwrap().as_str(), Some("hello"));
        assert_eq!(decoded.get("b").unwrap().as_bytes(), Some(&[1, 2, 3][..]));
        assert_eq!(decoded.get("t").unwrap().as_bool(), Some(true));
        assert_eq!(decoded.get("n").unwrap(), &Document::Null);
        assert_eq!(decoded.get("list").unwrap().as_list().unwrap().len(), 2);
        assert_eq!(
            decoded.get("nested").unwrap().get("inner").unwrap().as_str(),
            Some("value")
        );
    }

    #[test]
    fn empty_bytes_decode_to_empty_document() {
        let doc = decode_body(&[]).unwrap();
        assert_eq!(doc, Document::empty_doc());
    }
}
