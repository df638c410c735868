/*!
Object graph codec.

[`PickleCodec`] reads and writes the pickle opcode stream (protocols 2
through 5) over a [`Value`] graph. Shared lists, dicts and objects are
memoized, so identity and cycles survive a round trip.

Symbols the archive names are checked against the [`TypeCatalog`]; anything
missing is handed to a [`SymbolResolver`] during decoding.
*/

pub(crate) mod de;
pub(crate) mod opcodes;
pub(crate) mod ser;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use crate::compat::SymbolResolver;
use crate::symbol::TypeCatalog;
use crate::value::Value;
use crate::{PersistError, Result};

/// Lowest protocol the codec reads and writes.
pub const LOWEST_PROTOCOL: u8 = 2;

/// Highest protocol the codec reads and writes; the default for `persist`.
pub const HIGHEST_PROTOCOL: u8 = 5;

/// Deepest container nesting the codec writes or accepts from an archive.
pub const MAX_NESTING_DEPTH: usize = 512;

/// How legacy 8-bit string opcodes (`BINSTRING`, `SHORT_BINSTRING`) are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringDecoding {
    Ascii,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "latin-1")]
    Latin1,
    /// Keep the raw bytes instead of producing a string.
    Bytes,
}

impl StringDecoding {
    /// Attempts `restore` makes by default, in order.
    pub const DEFAULT_LADDER: [StringDecoding; 3] =
        [StringDecoding::Ascii, StringDecoding::Utf8, StringDecoding::Latin1];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Utf8 => "utf-8",
            Self::Latin1 => "latin-1",
            Self::Bytes => "bytes",
        }
    }

    /// Decode one legacy string payload. `None` when the bytes do not fit the encoding.
    pub(crate) fn decode(&self, raw: Vec<u8>) -> Option<Value> {
        match self {
            Self::Ascii => raw
                .is_ascii()
                .then(|| Value::Str(raw.iter().map(|&b| b as char).collect())),
            Self::Utf8 => String::from_utf8(raw).ok().map(Value::Str),
            Self::Latin1 => Some(Value::Str(raw.iter().map(|&b| b as char).collect())),
            Self::Bytes => Some(Value::Bytes(raw)),
        }
    }
}

impl fmt::Display for StringDecoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StringDecoding {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ascii" => Ok(Self::Ascii),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            "bytes" => Ok(Self::Bytes),
            other => Err(PersistError::validation(format!(
                "Unknown string decoding '{other}'"
            ))),
        }
    }
}

/// Per-attempt decoding knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub strings: StringDecoding,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            strings: StringDecoding::Ascii,
        }
    }
}

impl DecodeOptions {
    pub fn with_strings(strings: StringDecoding) -> Self {
        Self { strings }
    }
}

/// Serializes value graphs to bytes and back.
pub trait ObjectCodec: Send + Sync {
    /// Highest protocol this codec produces.
    fn highest_protocol(&self) -> u8;

    /// Write `value` to `writer` using `protocol`.
    fn serialize(&self, value: &Value, writer: &mut dyn Write, protocol: u8) -> Result<()>;

    /// Read one archive from `reader`, consulting `resolver` for symbols
    /// missing from the catalog.
    fn deserialize(
        &self,
        reader: &mut dyn Read,
        resolver: &dyn SymbolResolver,
        options: &DecodeOptions,
    ) -> Result<Value>;
}

/// Pickle opcode codec over a [`TypeCatalog`].
#[derive(Debug, Clone)]
pub struct PickleCodec {
    catalog: Arc<TypeCatalog>,
}

impl PickleCodec {
    pub fn new(catalog: Arc<TypeCatalog>) -> Self {
        Self { catalog }
    }

    /// A codec over the current tabular layout.
    pub fn tabular() -> Self {
        Self::new(Arc::new(TypeCatalog::tabular()))
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }
}

impl Default for PickleCodec {
    fn default() -> Self {
        Self::tabular()
    }
}

impl ObjectCodec for PickleCodec {
    fn highest_protocol(&self) -> u8 {
        HIGHEST_PROTOCOL
    }

    fn serialize(&self, value: &Value, writer: &mut dyn Write, protocol: u8) -> Result<()> {
        if !(LOWEST_PROTOCOL..=HIGHEST_PROTOCOL).contains(&protocol) {
            return Err(PersistError::UnsupportedProtocol {
                requested: i32::from(protocol),
                lowest: LOWEST_PROTOCOL,
                highest: HIGHEST_PROTOCOL,
            });
        }
        ser::Pickler::new(writer, protocol).dump(value)
    }

    fn deserialize(
        &self,
        reader: &mut dyn Read,
        resolver: &dyn SymbolResolver,
        options: &DecodeOptions,
    ) -> Result<Value> {
        de::Unpickler::new(reader, &self.catalog, resolver, *options).load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::{default_registry, NoLegacySymbols};
    use crate::symbol::SymbolRef;
    use crate::value::Object;
    use crate::ErrorKind;

    fn roundtrip(value: &Value, protocol: u8) -> Value {
        let codec = PickleCodec::tabular();
        let mut bytes = Vec::new();
        codec.serialize(value, &mut bytes, protocol).unwrap();
        codec
            .deserialize(&mut bytes.as_slice(), &NoLegacySymbols, &DecodeOptions::default())
            .unwrap()
    }

    fn sample_frame() -> Value {
        let index = Value::object(
            Object::new(SymbolRef::new("tabular.core.indexes.range", "RangeIndex"))
                .with_state(Value::record(vec![
                    ("start", Value::Int(0)),
                    ("stop", Value::Int(3)),
                    ("step", Value::Int(1)),
                ])),
        );
        Value::object(
            Object::new(SymbolRef::new("tabular.core.frame", "DataFrame")).with_state(
                Value::record(vec![
                    ("index", index),
                    ("columns", Value::list(vec![Value::str("price"), Value::str("qty")])),
                    (
                        "data",
                        Value::record(vec![
                            (
                                "price",
                                Value::list(vec![
                                    Value::Float(1.25),
                                    Value::Float(-3.5),
                                    Value::Float(1e300),
                                ]),
                            ),
                            (
                                "qty",
                                Value::list(vec![
                                    Value::Int(0),
                                    Value::Int(-1),
                                    Value::Int(i64::MAX),
                                ]),
                            ),
                        ]),
                    ),
                    ("flags", Value::Tuple(vec![Value::Bool(true), Value::None])),
                    ("raw", Value::Bytes(vec![0, 159, 255])),
                    ("empty_raw", Value::Bytes(Vec::new())),
                ]),
            ),
        )
    }

    #[test]
    fn test_roundtrip_every_protocol() {
        let frame = sample_frame();
        for protocol in LOWEST_PROTOCOL..=HIGHEST_PROTOCOL {
            assert_eq!(roundtrip(&frame, protocol), frame, "protocol {protocol}");
        }
    }

    #[test]
    fn test_shared_identity_preserved() {
        let shared = Value::list(vec![Value::Int(7)]);
        let outer = Value::Tuple(vec![shared.clone(), shared.clone()]);
        for protocol in LOWEST_PROTOCOL..=HIGHEST_PROTOCOL {
            let restored = roundtrip(&outer, protocol);
            let items = restored.items().unwrap();
            assert!(items[0].ptr_eq(&items[1]), "protocol {protocol}");
        }
    }

    #[test]
    fn test_cycle_preserved() {
        let list = Value::list(vec![Value::str("head")]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        let restored = roundtrip(&list, HIGHEST_PROTOCOL);
        let items = restored.items().unwrap();
        assert!(items[1].ptr_eq(&restored));
    }

    #[test]
    fn test_reduce_object_roundtrip() {
        let call = Value::object(Object::call(
            SymbolRef::new("tabular.core.indexes.base", "_new_Index"),
            vec![
                Value::Global(SymbolRef::new("tabular.core.indexes.base", "Index")),
                Value::record(vec![("data", Value::list(vec![Value::Int(1)]))]),
            ],
        ));
        assert_eq!(roundtrip(&call, 2), call);
        assert_eq!(roundtrip(&call, 5), call);
    }

    #[test]
    fn test_large_values() {
        let long_text = "x".repeat(70_000);
        let many = Value::list((0..2_500).map(Value::Int).collect());
        let value = Value::Tuple(vec![Value::Str(long_text), many, Value::Int(i64::MIN)]);
        assert_eq!(roundtrip(&value, 4), value);
    }

    #[test]
    fn test_unsupported_protocol() {
        let codec = PickleCodec::tabular();
        let err = codec.serialize(&Value::None, &mut Vec::new(), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_unknown_class_without_resolver() {
        let codec = PickleCodec::tabular();
        let object = Value::object(Object::new(SymbolRef::new("tabular.gone", "Widget")));
        let mut bytes = Vec::new();
        codec.serialize(&object, &mut bytes, 5).unwrap();

        let err = codec
            .deserialize(&mut bytes.as_slice(), &NoLegacySymbols, &DecodeOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvableSymbol);
        assert_eq!(
            err.legacy_reference(),
            Some(&SymbolRef::new("tabular.gone", "Widget"))
        );
    }

    #[test]
    fn test_legacy_redirect_through_registry() {
        let codec = PickleCodec::tabular();
        let object = Value::object(
            Object::new(SymbolRef::new("tabular.core.series", "TimeSeries"))
                .with_state(Value::record(vec![("name", Value::str("t"))])),
        );
        let mut bytes = Vec::new();
        codec.serialize(&object, &mut bytes, 2).unwrap();

        let restored = codec
            .deserialize(
                &mut bytes.as_slice(),
                default_registry().as_ref(),
                &DecodeOptions::default(),
            )
            .unwrap();
        assert_eq!(
            restored.class(),
            Some(SymbolRef::new("tabular.core.series", "Series"))
        );
    }

    #[test]
    fn test_string_decoding_parse_and_label() {
        assert_eq!("UTF8".parse::<StringDecoding>().unwrap(), StringDecoding::Utf8);
        assert_eq!("latin_1".parse::<StringDecoding>().unwrap(), StringDecoding::Latin1);
        assert!("ebcdic".parse::<StringDecoding>().is_err());
        assert_eq!(StringDecoding::Utf8.to_string(), "utf-8");
    }

    #[test]
    fn test_string_decoding_rules() {
        let raw = "café".as_bytes().to_vec();
        assert!(StringDecoding::Ascii.decode(raw.clone()).is_none());
        assert_eq!(StringDecoding::Utf8.decode(raw.clone()), Some(Value::str("café")));
        assert_eq!(
            StringDecoding::Latin1.decode(vec![0xff]),
            Some(Value::str("\u{ff}"))
        );
        assert_eq!(StringDecoding::Bytes.decode(raw.clone()), Some(Value::Bytes(raw)));
    }
}
