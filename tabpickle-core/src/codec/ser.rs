use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::io::Write;

use super::opcodes::*;
use super::MAX_NESTING_DEPTH;
use crate::symbol::{builtins, SymbolRef};
use crate::value::{Construction, DictEntries, Object, Shared, Value};
use crate::{PersistError, Result};

const BATCH_SIZE: usize = 1000;

pub(crate) struct Pickler<'w> {
    writer: &'w mut dyn Write,
    protocol: u8,
    memo: HashMap<usize, u32>,
    /// Objects whose constructor arguments are being written.
    building: HashSet<usize>,
    /// Containers currently open.
    depth: usize,
}

impl<'w> Pickler<'w> {
    pub(crate) fn new(writer: &'w mut dyn Write, protocol: u8) -> Self {
        Self {
            writer,
            protocol,
            memo: HashMap::new(),
            building: HashSet::new(),
            depth: 0,
        }
    }

    pub(crate) fn dump(mut self, value: &Value) -> Result<()> {
        self.writer.write_all(&[PROTO, self.protocol])?;
        self.save(value)?;
        self.writer.write_u8(STOP)?;
        Ok(())
    }

    fn save(&mut self, value: &Value) -> Result<()> {
        if let Some(id) = value.node_id() {
            if let Some(&index) = self.memo.get(&id) {
                return self.write_get(index);
            }
        }

        match value {
            Value::None => self.writer.write_u8(NONE)?,
            Value::Bool(true) => self.writer.write_u8(NEWTRUE)?,
            Value::Bool(false) => self.writer.write_u8(NEWFALSE)?,
            Value::Int(i) => self.save_int(*i)?,
            Value::Float(f) => {
                self.writer.write_u8(BINFLOAT)?;
                self.writer.write_f64::<BigEndian>(*f)?;
            }
            Value::Str(s) => self.save_str(s)?,
            Value::Bytes(b) => self.save_bytes(b)?,
            Value::Tuple(items) => self.nested(|p| p.save_tuple(items))?,
            Value::List(items) => self.nested(|p| p.save_list(value, items))?,
            Value::Dict(entries) => self.nested(|p| p.save_dict(value, entries))?,
            Value::Object(object) => self.nested(|p| p.save_object(value, object))?,
            Value::Global(symbol) => self.save_global(symbol)?,
        }
        Ok(())
    }

    /// Write one container level, refusing graphs nested past the limit.
    fn nested<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.depth == MAX_NESTING_DEPTH {
            return Err(PersistError::serialization(format!(
                "value nests containers deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let written = write(self);
        self.depth -= 1;
        written
    }

    fn save_list(&mut self, value: &Value, items: &Shared<Vec<Value>>) -> Result<()> {
        self.writer.write_u8(EMPTY_LIST)?;
        self.memoize(value)?;
        let items = items.borrow();
        for batch in items.chunks(BATCH_SIZE) {
            if let [item] = batch {
                self.save(item)?;
                self.writer.write_u8(APPEND)?;
            } else {
                self.writer.write_u8(MARK)?;
                for item in batch {
                    self.save(item)?;
                }
                self.writer.write_u8(APPENDS)?;
            }
        }
        Ok(())
    }

    fn save_dict(&mut self, value: &Value, entries: &Shared<DictEntries>) -> Result<()> {
        self.writer.write_u8(EMPTY_DICT)?;
        self.memoize(value)?;
        let entries = entries.borrow();
        for batch in entries.chunks(BATCH_SIZE) {
            if let [(key, item)] = batch {
                self.save(key)?;
                self.save(item)?;
                self.writer.write_u8(SETITEM)?;
            } else {
                self.writer.write_u8(MARK)?;
                for (key, item) in batch {
                    self.save(key)?;
                    self.save(item)?;
                }
                self.writer.write_u8(SETITEMS)?;
            }
        }
        Ok(())
    }

    fn save_object(&mut self, value: &Value, object: &Shared<Object>) -> Result<()> {
        let object = object.borrow();
        let id = value.node_id().unwrap_or_default();
        if !self.building.insert(id) {
            return Err(PersistError::serialization(format!(
                "{} is reachable from its own constructor arguments",
                object.class
            )));
        }

        self.save_global(&object.class)?;
        self.nested(|p| p.save_tuple(&object.args))?;
        self.writer.write_u8(match object.construction {
            Construction::NewObj => NEWOBJ,
            Construction::Reduce => REDUCE,
        })?;
        self.building.remove(&id);
        self.memoize(value)?;

        if let Some(state) = &object.state {
            self.save(state)?;
            self.writer.write_u8(BUILD)?;
        }
        Ok(())
    }

    fn save_global(&mut self, symbol: &SymbolRef) -> Result<()> {
        if symbol.module.is_empty() || symbol.name.is_empty() {
            return Err(PersistError::serialization(format!(
                "symbol '{}' has an empty module or name",
                symbol.qualified()
            )));
        }

        if self.protocol >= 4 {
            self.save_str(&symbol.module)?;
            self.save_str(&symbol.name)?;
            self.writer.write_u8(STACK_GLOBAL)?;
            return Ok(());
        }

        if symbol.module.contains('\n') || symbol.name.contains('\n') {
            return Err(PersistError::serialization(format!(
                "symbol {symbol:?} cannot be written as a protocol {} global",
                self.protocol
            )));
        }
        self.writer.write_u8(GLOBAL)?;
        self.writer.write_all(symbol.module.as_bytes())?;
        self.writer.write_u8(b'\n')?;
        self.writer.write_all(symbol.name.as_bytes())?;
        self.writer.write_u8(b'\n')?;
        Ok(())
    }

    fn save_int(&mut self, i: i64) -> Result<()> {
        if (0..=0xff).contains(&i) {
            self.writer.write_all(&[BININT1, i as u8])?;
        } else if (0..=0xffff).contains(&i) {
            self.writer.write_u8(BININT2)?;
            self.writer.write_u16::<LittleEndian>(i as u16)?;
        } else if let Ok(small) = i32::try_from(i) {
            self.writer.write_u8(BININT)?;
            self.writer.write_i32::<LittleEndian>(small)?;
        } else {
            let encoded = encode_long(i);
            self.writer.write_all(&[LONG1, encoded.len() as u8])?;
            self.writer.write_all(&encoded)?;
        }
        Ok(())
    }

    fn save_str(&mut self, s: &str) -> Result<()> {
        let len = s.len();
        if self.protocol >= 4 && len < 256 {
            self.writer.write_all(&[SHORT_BINUNICODE, len as u8])?;
        } else if let Ok(len) = u32::try_from(len) {
            self.writer.write_u8(BINUNICODE)?;
            self.writer.write_u32::<LittleEndian>(len)?;
        } else if self.protocol >= 4 {
            self.writer.write_u8(BINUNICODE8)?;
            self.writer.write_u64::<LittleEndian>(len as u64)?;
        } else {
            return Err(PersistError::serialization(format!(
                "string of {len} bytes needs protocol 4 or higher"
            )));
        }
        self.writer.write_all(s.as_bytes())?;
        Ok(())
    }

    fn save_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.protocol < 3 {
            // `_codecs.encode(text, "latin1")`, or `bytes()` when empty.
            if bytes.is_empty() {
                self.save_global(&SymbolRef::from(builtins::BYTES))?;
                self.writer.write_u8(EMPTY_TUPLE)?;
            } else {
                self.save_global(&SymbolRef::from(builtins::CODECS_ENCODE))?;
                let text: String = bytes.iter().map(|&b| b as char).collect();
                self.save_str(&text)?;
                self.save_str("latin1")?;
                self.writer.write_u8(TUPLE2)?;
            }
            self.writer.write_u8(REDUCE)?;
            return Ok(());
        }

        let len = bytes.len();
        if len < 256 {
            self.writer.write_all(&[SHORT_BINBYTES, len as u8])?;
        } else if let Ok(len) = u32::try_from(len) {
            self.writer.write_u8(BINBYTES)?;
            self.writer.write_u32::<LittleEndian>(len)?;
        } else if self.protocol >= 4 {
            self.writer.write_u8(BINBYTES8)?;
            self.writer.write_u64::<LittleEndian>(len as u64)?;
        } else {
            return Err(PersistError::serialization(format!(
                "byte string of {len} bytes needs protocol 4 or higher"
            )));
        }
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn save_tuple(&mut self, items: &[Value]) -> Result<()> {
        match items {
            [] => self.writer.write_u8(EMPTY_TUPLE)?,
            [a] => {
                self.save(a)?;
                self.writer.write_u8(TUPLE1)?;
            }
            [a, b] => {
                self.save(a)?;
                self.save(b)?;
                self.writer.write_u8(TUPLE2)?;
            }
            [a, b, c] => {
                self.save(a)?;
                self.save(b)?;
                self.save(c)?;
                self.writer.write_u8(TUPLE3)?;
            }
            _ => {
                self.writer.write_u8(MARK)?;
                for item in items {
                    self.save(item)?;
                }
                self.writer.write_u8(TUPLE)?;
            }
        }
        Ok(())
    }

    fn memoize(&mut self, value: &Value) -> Result<()> {
        let Some(id) = value.node_id() else {
            return Ok(());
        };
        let index = self.memo.len() as u32;
        self.memo.insert(id, index);

        if self.protocol >= 4 {
            self.writer.write_u8(MEMOIZE)?;
        } else if index < 256 {
            self.writer.write_all(&[BINPUT, index as u8])?;
        } else {
            self.writer.write_u8(LONG_BINPUT)?;
            self.writer.write_u32::<LittleEndian>(index)?;
        }
        Ok(())
    }

    fn write_get(&mut self, index: u32) -> Result<()> {
        if index < 256 {
            self.writer.write_all(&[BINGET, index as u8])?;
        } else {
            self.writer.write_u8(LONG_BINGET)?;
            self.writer.write_u32::<LittleEndian>(index)?;
        }
        Ok(())
    }
}

/// Minimal little-endian two's complement encoding, as `LONG1` expects.
fn encode_long(i: i64) -> Vec<u8> {
    let mut bytes = i.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let sign_of_previous = bytes[bytes.len() - 2] & 0x80;
        if (last == 0x00 && sign_of_previous == 0) || (last == 0xff && sign_of_previous != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(value: &Value, protocol: u8) -> Vec<u8> {
        let mut out = Vec::new();
        Pickler::new(&mut out, protocol).dump(value).unwrap();
        out
    }

    #[test]
    fn test_encode_long() {
        assert_eq!(encode_long(1 << 40), vec![0, 0, 0, 0, 0, 1]);
        assert_eq!(encode_long(-(1 << 40)), vec![0, 0, 0, 0, 0, 0xff]);
        assert_eq!(encode_long(0x80_0000_0000), vec![0, 0, 0, 0, 0x80, 0]);
        assert_eq!(encode_long(i64::MIN), vec![0, 0, 0, 0, 0, 0, 0, 0x80]);
    }

    #[test]
    fn test_small_int_layout() {
        assert_eq!(dump(&Value::Int(5), 2), vec![PROTO, 2, BININT1, 5, STOP]);
        assert_eq!(
            dump(&Value::Int(-1), 2),
            vec![PROTO, 2, BININT, 0xff, 0xff, 0xff, 0xff, STOP]
        );
    }

    #[test]
    fn test_protocol_4_and_5_are_written_without_frames() {
        for protocol in [4, 5] {
            assert_eq!(dump(&Value::Int(5), protocol), vec![PROTO, protocol, BININT1, 5, STOP]);
        }
    }

    #[test]
    fn test_global_layout_by_protocol() {
        let value = Value::Global(SymbolRef::new("tabular.core.series", "Series"));
        let v2 = dump(&value, 2);
        assert_eq!(v2[2], GLOBAL);
        assert!(v2.ends_with(b"tabular.core.series\nSeries\n."));

        let v4 = dump(&value, 4);
        assert_eq!(v4[2], SHORT_BINUNICODE);
        assert_eq!(v4[v4.len() - 2], STACK_GLOBAL);
    }

    #[test]
    fn test_newline_in_global_is_rejected_below_protocol_4() {
        let mut out = Vec::new();
        let value = Value::Global(SymbolRef::new("bad\nmodule", "X"));
        let err = Pickler::new(&mut out, 3).dump(&value).unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
    }

    #[test]
    fn test_self_referencing_constructor_args_rejected() {
        let object = Value::object(Object::new(SymbolRef::new("tabular.core.series", "Series")));
        if let Value::Object(inner) = &object {
            inner.borrow_mut().args.push(Value::Tuple(vec![Value::Int(1)]));
        }
        // args are fine; a self reference through args is not
        let looped = object.clone();
        if let Value::Object(inner) = &object {
            inner.borrow_mut().args.push(looped);
        }
        let mut out = Vec::new();
        let err = Pickler::new(&mut out, 5).dump(&object).unwrap_err();
        assert!(err.to_string().contains("own constructor arguments"));
    }

    #[test]
    fn test_self_reference_through_state_is_allowed() {
        let object = Value::object(Object::new(SymbolRef::new("tabular.core.series", "Series")));
        let state = Value::record(vec![("me", object.clone())]);
        if let Value::Object(inner) = &object {
            inner.borrow_mut().state = Some(state);
        }
        let bytes = dump(&object, 5);
        assert_eq!(bytes.last(), Some(&STOP));
    }

    #[test]
    fn test_protocol_2_bytes_use_codecs_encode() {
        let bytes = dump(&Value::Bytes(vec![0xe9]), 2);
        assert!(bytes.windows(14).any(|w| w == b"_codecs\nencode"));
        let empty = dump(&Value::Bytes(Vec::new()), 2);
        assert!(empty.windows(14).any(|w| w == b"builtins\nbytes"));
    }

    fn nested_lists(levels: usize) -> Value {
        let mut value = Value::list(Vec::new());
        for _ in 1..levels {
            value = Value::list(vec![value]);
        }
        value
    }

    #[test]
    fn test_nesting_up_to_the_limit_is_written() {
        let bytes = dump(&nested_lists(MAX_NESTING_DEPTH), 5);
        assert_eq!(bytes.iter().filter(|&&b| b == EMPTY_LIST).count(), MAX_NESTING_DEPTH);
    }

    #[test]
    fn test_nesting_past_the_limit_is_a_serialization_error() {
        let mut out = Vec::new();
        let err = Pickler::new(&mut out, 5)
            .dump(&nested_lists(MAX_NESTING_DEPTH + 1))
            .unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
        assert!(err.to_string().contains("deeper than"));

        let object = Value::object(
            Object::new(SymbolRef::new("tabular.core.series", "Series"))
                .with_args(vec![nested_lists(MAX_NESTING_DEPTH - 1)]),
        );
        let err = Pickler::new(&mut Vec::<u8>::new(), 5).dump(&object).unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
    }

    #[test]
    fn test_list_batches_appends() {
        let value = Value::list(vec![Value::None; BATCH_SIZE + 1]);
        let bytes = dump(&value, 5);
        assert_eq!(bytes.iter().filter(|&&b| b == APPENDS).count(), 1);
        // the trailing single item uses APPEND
        assert_eq!(bytes[bytes.len() - 2], APPEND);
    }
}
