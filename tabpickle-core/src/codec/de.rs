use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{self, Read};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use super::opcodes::*;
use super::{DecodeOptions, HIGHEST_PROTOCOL, LOWEST_PROTOCOL, MAX_NESTING_DEPTH};
use crate::compat::{Adapter, AttributeRename, LegacyState, ResolutionOutcome, SymbolResolver};
use crate::symbol::{builtins, LegacyReference, SymbolRef, TypeCatalog};
use crate::value::{dismantle, nesting_depth, Construction, Object, Shared, Value};
use crate::{PersistError, Result};

/// A resolved global: what the archive will call or reference.
#[derive(Clone)]
enum Callable {
    Symbol(SymbolRef),
    Rename {
        target: SymbolRef,
        renames: Arc<[AttributeRename]>,
    },
    Reconstruct {
        legacy: LegacyReference,
        target: SymbolRef,
        adapter: Adapter,
    },
}

impl Callable {
    fn symbol(&self) -> &SymbolRef {
        match self {
            Self::Symbol(symbol) => symbol,
            Self::Rename { target, .. } | Self::Reconstruct { target, .. } => target,
        }
    }
}

#[derive(Clone)]
enum Item {
    /// A value and the container height recorded when it was built.
    Value(Value, usize),
    Callable(Callable),
}

impl Item {
    fn into_value(self) -> Value {
        match self {
            Item::Value(value, _) => value,
            Item::Callable(callable) => Value::Global(callable.symbol().clone()),
        }
    }
}

fn discard<I: IntoIterator<Item = Item>>(items: I) {
    dismantle(items.into_iter().filter_map(|item| match item {
        Item::Value(value, _) => Some(value),
        Item::Callable(_) => None,
    }));
}

/// Work deferred until an object receives its state.
enum Fixup {
    Rename(Arc<[AttributeRename]>),
    Reconstruct {
        legacy: LegacyReference,
        adapter: Adapter,
    },
}

struct Pending {
    object: Shared<Object>,
    fixup: Fixup,
}

/// Reader that tracks the byte offset for error reports.
struct Counting<'r> {
    inner: &'r mut dyn Read,
    offset: u64,
}

impl Read for Counting<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

pub(crate) struct Unpickler<'a> {
    reader: Counting<'a>,
    catalog: &'a TypeCatalog,
    resolver: &'a dyn SymbolResolver,
    options: DecodeOptions,
    stack: Vec<Item>,
    metastack: Vec<Vec<Item>>,
    memo: HashMap<u32, Item>,
    pending: Vec<Option<Pending>>,
    pending_index: HashMap<usize, usize>,
    /// Recorded heights of shared nodes, which grow as items are added.
    heights: HashMap<usize, usize>,
    /// Offset of the opcode being executed.
    at: u64,
}

impl<'a> Unpickler<'a> {
    pub(crate) fn new(
        reader: &'a mut dyn Read,
        catalog: &'a TypeCatalog,
        resolver: &'a dyn SymbolResolver,
        options: DecodeOptions,
    ) -> Self {
        Self {
            reader: Counting {
                inner: reader,
                offset: 0,
            },
            catalog,
            resolver,
            options,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
            pending: Vec::new(),
            pending_index: HashMap::new(),
            heights: HashMap::new(),
            at: 0,
        }
    }

    pub(crate) fn load(mut self) -> Result<Value> {
        self.read_header()?;
        loop {
            self.at = self.reader.offset;
            let opcode = self.read_u8()?;
            if opcode == STOP {
                return self.finish();
            }
            self.dispatch(opcode)?;
        }
    }

    fn read_header(&mut self) -> Result<()> {
        match self.read_u8()? {
            PROTO => {}
            other => {
                return Err(self.corrupt(format!(
                    "expected PROTO header, found opcode 0x{other:02x} (protocols below {LOWEST_PROTOCOL} are not supported)"
                )))
            }
        }
        let protocol = self.read_u8()?;
        if protocol > HIGHEST_PROTOCOL {
            return Err(PersistError::UnsupportedArchive {
                found: protocol,
                highest: HIGHEST_PROTOCOL,
            });
        }
        if protocol < LOWEST_PROTOCOL {
            return Err(self.corrupt(format!("PROTO {protocol} is not a valid header")));
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Value> {
        if !self.metastack.is_empty() {
            return Err(self.corrupt("STOP inside an open MARK"));
        }
        if self.stack.len() > 1 {
            return Err(self.corrupt("STOP with extra items on the stack"));
        }
        let result = match self.stack.pop() {
            Some(item) => item.into_value(),
            None => return Err(self.corrupt("STOP with an empty stack")),
        };

        match self.complete(&result) {
            Ok(()) => Ok(result),
            Err(e) => {
                dismantle([result]);
                Err(e)
            }
        }
    }

    fn complete(&mut self, result: &Value) -> Result<()> {
        // objects that were never built still go through their adapter
        for pending in mem::take(&mut self.pending).into_iter().flatten() {
            if let Fixup::Reconstruct { legacy, adapter } = pending.fixup {
                reconstruct(&pending.object, legacy, adapter, None)?;
            }
        }

        // shared nodes filled in after they were referenced are only measured here
        let depth = nesting_depth(result, MAX_NESTING_DEPTH);
        if depth > MAX_NESTING_DEPTH {
            return Err(self.too_deep());
        }
        Ok(())
    }

    fn dispatch(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            FRAME => {
                self.reader.read_u64::<LittleEndian>().map_err(|e| self.io(e))?;
            }
            PROTO => return Err(self.corrupt("PROTO after the header")),

            MARK => self.metastack.push(mem::take(&mut self.stack)),
            POP => match self.stack.pop() {
                Some(item) => discard([item]),
                None => dismantle(self.pop_mark()?.0),
            },
            POP_MARK => dismantle(self.pop_mark()?.0),
            DUP => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }

            NONE => self.push(Value::None),
            NEWTRUE => self.push(Value::Bool(true)),
            NEWFALSE => self.push(Value::Bool(false)),
            BININT1 => {
                let n = self.read_u8()?;
                self.push(Value::Int(i64::from(n)));
            }
            BININT2 => {
                let n = self.reader.read_u16::<LittleEndian>().map_err(|e| self.io(e))?;
                self.push(Value::Int(i64::from(n)));
            }
            BININT => {
                let n = self.reader.read_i32::<LittleEndian>().map_err(|e| self.io(e))?;
                self.push(Value::Int(i64::from(n)));
            }
            LONG1 => {
                let len = usize::from(self.read_u8()?);
                let raw = self.read_bytes(len as u64)?;
                let n = self.decode_long(&raw)?;
                self.push(Value::Int(n));
            }
            LONG4 => {
                let len = self.read_len_i32()?;
                let raw = self.read_bytes(len)?;
                let n = self.decode_long(&raw)?;
                self.push(Value::Int(n));
            }
            BINFLOAT => {
                let f = self.reader.read_f64::<BigEndian>().map_err(|e| self.io(e))?;
                self.push(Value::Float(f));
            }

            SHORT_BINUNICODE => {
                let len = u64::from(self.read_u8()?);
                self.read_unicode(len)?;
            }
            BINUNICODE => {
                let len = self.reader.read_u32::<LittleEndian>().map_err(|e| self.io(e))?;
                self.read_unicode(u64::from(len))?;
            }
            BINUNICODE8 => {
                let len = self.reader.read_u64::<LittleEndian>().map_err(|e| self.io(e))?;
                self.read_unicode(len)?;
            }
            SHORT_BINSTRING => {
                let len = u64::from(self.read_u8()?);
                self.read_legacy_string(len)?;
            }
            BINSTRING => {
                let len = self.read_len_i32()?;
                self.read_legacy_string(len)?;
            }
            SHORT_BINBYTES => {
                let len = u64::from(self.read_u8()?);
                let raw = self.read_bytes(len)?;
                self.push(Value::Bytes(raw));
            }
            BINBYTES => {
                let len = self.reader.read_u32::<LittleEndian>().map_err(|e| self.io(e))?;
                let raw = self.read_bytes(u64::from(len))?;
                self.push(Value::Bytes(raw));
            }
            BINBYTES8 | BYTEARRAY8 => {
                let len = self.reader.read_u64::<LittleEndian>().map_err(|e| self.io(e))?;
                let raw = self.read_bytes(len)?;
                self.push(Value::Bytes(raw));
            }

            EMPTY_TUPLE => self.push_nested(Value::Tuple(Vec::new()), 0)?,
            TUPLE1 | TUPLE2 | TUPLE3 => {
                let n = usize::from(opcode - TUPLE1 + 1);
                if self.stack.len() < n {
                    return Err(self.corrupt("tuple opcode with too few stack items"));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                let height = self.max_height(&items);
                let tuple = Value::Tuple(items.into_iter().map(Item::into_value).collect());
                self.push_nested(tuple, height)?;
            }
            TUPLE => {
                let (items, height) = self.pop_mark()?;
                self.push_nested(Value::Tuple(items), height)?;
            }

            EMPTY_LIST => self.push_nested(Value::list(Vec::new()), 0)?,
            LIST => {
                let (items, height) = self.pop_mark()?;
                self.push_nested(Value::list(items), height)?;
            }
            APPEND => {
                let (item, height) = self.pop_measured()?;
                self.extend_list(vec![item], height)?;
            }
            APPENDS => {
                let (items, height) = self.pop_mark()?;
                self.extend_list(items, height)?;
            }

            EMPTY_DICT => self.push_nested(Value::dict(Vec::new()), 0)?,
            DICT => {
                let (items, height) = self.pop_mark()?;
                let entries = self.pairs(items)?;
                self.push_nested(Value::dict(entries), height)?;
            }
            SETITEM => {
                let (value, value_height) = self.pop_measured()?;
                let (key, key_height) = self.pop_measured()?;
                self.extend_dict(vec![(key, value)], key_height.max(value_height))?;
            }
            SETITEMS => {
                let (items, height) = self.pop_mark()?;
                let entries = self.pairs(items)?;
                self.extend_dict(entries, height)?;
            }

            BINPUT => {
                let index = u32::from(self.read_u8()?);
                self.put(index)?;
            }
            LONG_BINPUT => {
                let index = self.reader.read_u32::<LittleEndian>().map_err(|e| self.io(e))?;
                self.put(index)?;
            }
            MEMOIZE => {
                let index = self.memo.len() as u32;
                self.put(index)?;
            }
            BINGET => {
                let index = u32::from(self.read_u8()?);
                self.get(index)?;
            }
            LONG_BINGET => {
                let index = self.reader.read_u32::<LittleEndian>().map_err(|e| self.io(e))?;
                self.get(index)?;
            }

            GLOBAL => {
                let module = self.read_line()?;
                let name = self.read_line()?;
                let callable = self.resolve(SymbolRef::new(module, name))?;
                self.stack.push(Item::Callable(callable));
            }
            STACK_GLOBAL => {
                let name = self.pop_value()?;
                let module = self.pop_value()?;
                let (module, name) = match (module, name) {
                    (Value::Str(module), Value::Str(name)) => (module, name),
                    (module, name) => {
                        let err = self.corrupt("STACK_GLOBAL operands are not strings");
                        dismantle([module, name]);
                        return Err(err);
                    }
                };
                let callable = self.resolve(SymbolRef::new(module, name))?;
                self.stack.push(Item::Callable(callable));
            }
            NEWOBJ => {
                let (args, height) = self.pop_args()?;
                let callable = self.pop_callable("NEWOBJ")?;
                let value = self.construct(callable, args, Construction::NewObj)?;
                self.push_constructed(value, height)?;
            }
            REDUCE => {
                let (args, height) = self.pop_args()?;
                let callable = self.pop_callable("REDUCE")?;
                let value = self.construct(callable, args, Construction::Reduce)?;
                self.push_constructed(value, height)?;
            }
            BUILD => {
                let (state, height) = self.pop_measured()?;
                self.build(state, height)?;
            }

            other => return Err(self.corrupt(format!("unknown opcode 0x{other:02x}"))),
        }
        Ok(())
    }

    fn resolve(&self, reference: LegacyReference) -> Result<Callable> {
        let reference = normalize_builtin(reference);
        if self.catalog.contains(&reference) {
            return Ok(Callable::Symbol(reference));
        }

        let outcome = self.resolver.resolve(&reference);
        if let Some(target) = outcome.target() {
            if !self.catalog.contains(target) {
                debug!(reference = %reference, target_symbol = %target, "Legacy target missing from catalog");
                return Err(PersistError::unresolvable(reference));
            }
        }
        match outcome {
            ResolutionOutcome::Redirect(target) => Ok(Callable::Symbol(target)),
            ResolutionOutcome::RenameAttribute { target, renames } => {
                Ok(Callable::Rename { target, renames })
            }
            ResolutionOutcome::Reconstruct { target, adapter } => Ok(Callable::Reconstruct {
                legacy: reference,
                target,
                adapter,
            }),
            ResolutionOutcome::Unresolvable => Err(PersistError::unresolvable(reference)),
        }
    }

    fn construct(
        &mut self,
        callable: Callable,
        args: Vec<Value>,
        construction: Construction,
    ) -> Result<Value> {
        let (class, fixup) = match callable {
            Callable::Symbol(symbol) => {
                if let Some(bytes) = self.builtin_bytes(&symbol, &args)? {
                    return Ok(Value::Bytes(bytes));
                }
                (symbol, None)
            }
            Callable::Rename { target, renames } => (target, Some(Fixup::Rename(renames))),
            Callable::Reconstruct {
                legacy,
                target,
                adapter,
            } => (target, Some(Fixup::Reconstruct { legacy, adapter })),
        };

        let object = Object {
            class,
            construction,
            args,
            state: None,
        };
        let value = Value::object(object);
        if let (Some(fixup), Value::Object(shared)) = (fixup, &value) {
            let id = Rc::as_ptr(shared) as *const () as usize;
            self.pending_index.insert(id, self.pending.len());
            self.pending.push(Some(Pending {
                object: Rc::clone(shared),
                fixup,
            }));
        }
        Ok(value)
    }

    /// `_codecs.encode(text, encoding)` and `bytes(...)` produce byte strings.
    fn builtin_bytes(&self, symbol: &SymbolRef, args: &[Value]) -> Result<Option<Vec<u8>>> {
        if *symbol == SymbolRef::from(builtins::CODECS_ENCODE) {
            let bytes = match args {
                [Value::Str(text), Value::Str(encoding)] => encode_text(text, encoding),
                [Value::Str(text)] => Some(text.as_bytes().to_vec()),
                _ => None,
            };
            return bytes
                .map(Some)
                .ok_or_else(|| self.corrupt("malformed _codecs.encode call"));
        }
        if *symbol == SymbolRef::from(builtins::BYTES) {
            let bytes = match args {
                [] => Some(Vec::new()),
                [Value::Bytes(raw)] => Some(raw.clone()),
                [items @ (Value::List(_) | Value::Tuple(_))] => items
                    .items()
                    .unwrap_or_default()
                    .iter()
                    .map(|item| item.as_int().and_then(|n| u8::try_from(n).ok()))
                    .collect(),
                _ => None,
            };
            return bytes
                .map(Some)
                .ok_or_else(|| self.corrupt("malformed bytes() call"));
        }
        Ok(None)
    }

    fn build(&mut self, state: Value, height: usize) -> Result<()> {
        let shared = match self.top()? {
            Item::Value(Value::Object(shared), _) => Rc::clone(shared),
            other => {
                let found = match other {
                    Item::Value(value, _) => value.type_name(),
                    Item::Callable(_) => "global",
                };
                let err = self.corrupt(format!("BUILD applied to a {found}"));
                dismantle([state]);
                return Err(err);
            }
        };

        let id = Rc::as_ptr(&shared) as *const () as usize;
        // adapters wrap legacy fields at most one level deeper than the state
        if let Err(e) = self.grow(id, height + 1) {
            dismantle([state]);
            return Err(e);
        }
        let pending = self
            .pending_index
            .remove(&id)
            .and_then(|slot| self.pending[slot].take());

        let state = match pending.map(|pending| pending.fixup) {
            Some(Fixup::Reconstruct { legacy, adapter }) => {
                return reconstruct(&shared, legacy, adapter, Some(state));
            }
            Some(Fixup::Rename(renames)) => {
                rename_state(&state, &renames);
                state
            }
            None => state,
        };

        let mut object = shared.borrow_mut();
        object.state = Some(match object.state.take() {
            Some(existing) => merge_state(existing, state),
            None => state,
        });
        Ok(())
    }

    fn read_unicode(&mut self, len: u64) -> Result<()> {
        let raw = self.read_bytes(len)?;
        let text = String::from_utf8(raw)
            .map_err(|e| self.corrupt(format!("invalid UTF-8 in string: {e}")))?;
        self.push(Value::Str(text));
        Ok(())
    }

    fn read_legacy_string(&mut self, len: u64) -> Result<()> {
        let raw = self.read_bytes(len)?;
        let strings = self.options.strings;
        let value = strings
            .decode(raw)
            .ok_or_else(|| PersistError::StringDecode {
                encoding: strings.label().to_string(),
                offset: self.at,
            })?;
        self.push(value);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            match self.read_u8()? {
                b'\n' => break,
                byte => line.push(byte),
            }
        }
        String::from_utf8(line).map_err(|_| self.corrupt("GLOBAL name is not valid UTF-8"))
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.reader.read_u8().map_err(|e| self.io(e))
    }

    fn read_len_i32(&mut self) -> Result<u64> {
        let len = self.reader.read_i32::<LittleEndian>().map_err(|e| self.io(e))?;
        u64::try_from(len).map_err(|_| self.corrupt(format!("negative length {len}")))
    }

    /// Read exactly `len` bytes without trusting `len` for the allocation.
    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut raw);
        read.map_err(|e| self.io(e))?;
        if (raw.len() as u64) < len {
            return Err(self.corrupt("truncated archive"));
        }
        Ok(raw)
    }

    fn decode_long(&self, raw: &[u8]) -> Result<i64> {
        if raw.is_empty() {
            return Ok(0);
        }
        if raw.len() > 8 {
            return Err(self.corrupt(format!("{}-byte integer exceeds 64 bits", raw.len())));
        }
        let fill = if raw[raw.len() - 1] & 0x80 != 0 { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..raw.len()].copy_from_slice(raw);
        Ok(i64::from_le_bytes(buf))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Item::Value(value, 0));
    }

    /// Push a container whose deepest child is `children` levels high.
    fn push_nested(&mut self, value: Value, children: usize) -> Result<()> {
        let height = children + 1;
        if height > MAX_NESTING_DEPTH {
            dismantle([value]);
            return Err(self.too_deep());
        }
        if let Some(id) = value.node_id() {
            self.heights.insert(id, height);
        }
        self.stack.push(Item::Value(value, height));
        Ok(())
    }

    fn push_constructed(&mut self, value: Value, args_height: usize) -> Result<()> {
        match value {
            Value::Bytes(_) => {
                self.push(value);
                Ok(())
            }
            value => self.push_nested(value, args_height),
        }
    }

    /// Raise the recorded height of a shared node that gained children.
    fn grow(&mut self, id: usize, children: usize) -> Result<()> {
        let height = children + 1;
        if height > MAX_NESTING_DEPTH {
            return Err(self.too_deep());
        }
        let recorded = self.heights.entry(id).or_insert(0);
        *recorded = (*recorded).max(height);
        Ok(())
    }

    fn height(&self, item: &Item) -> usize {
        match item {
            Item::Value(value, height) => value
                .node_id()
                .and_then(|id| self.heights.get(&id).copied())
                .unwrap_or(*height),
            Item::Callable(_) => 0,
        }
    }

    fn max_height(&self, items: &[Item]) -> usize {
        items.iter().map(|item| self.height(item)).max().unwrap_or(0)
    }

    fn too_deep(&self) -> PersistError {
        self.corrupt(format!(
            "containers nested deeper than {MAX_NESTING_DEPTH} levels"
        ))
    }

    fn top(&self) -> Result<&Item> {
        self.stack
            .last()
            .ok_or_else(|| self.corrupt("stack underflow"))
    }

    fn pop_item(&mut self) -> Result<Item> {
        match self.stack.pop() {
            Some(item) => Ok(item),
            None => Err(self.corrupt("stack underflow")),
        }
    }

    fn pop_value(&mut self) -> Result<Value> {
        self.pop_item().map(Item::into_value)
    }

    fn pop_measured(&mut self) -> Result<(Value, usize)> {
        let item = self.pop_item()?;
        let height = self.height(&item);
        Ok((item.into_value(), height))
    }

    fn pop_args(&mut self) -> Result<(Vec<Value>, usize)> {
        match self.pop_measured()? {
            (Value::Tuple(args), height) => Ok((args, height)),
            (other, _) => {
                let err = self.corrupt(format!(
                    "constructor arguments are a {}, not a tuple",
                    other.type_name()
                ));
                dismantle([other]);
                Err(err)
            }
        }
    }

    fn pop_callable(&mut self, opcode: &str) -> Result<Callable> {
        match self.pop_item()? {
            Item::Callable(callable) => Ok(callable),
            Item::Value(Value::Global(symbol), _) => self.resolve(symbol),
            Item::Value(other, _) => {
                let err = self.corrupt(format!("{opcode} applied to a {}", other.type_name()));
                dismantle([other]);
                Err(err)
            }
        }
    }

    /// Items above the last MARK and the height of the deepest one.
    fn pop_mark(&mut self) -> Result<(Vec<Value>, usize)> {
        let outer = self
            .metastack
            .pop()
            .ok_or_else(|| self.corrupt("no MARK on the stack"))?;
        let items = mem::replace(&mut self.stack, outer);
        let height = self.max_height(&items);
        Ok((items.into_iter().map(Item::into_value).collect(), height))
    }

    fn pairs(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
        if items.len() % 2 != 0 {
            let err = self.corrupt("odd number of items for a dict");
            dismantle(items);
            return Err(err);
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn extend_list(&mut self, items: Vec<Value>, height: usize) -> Result<()> {
        let id = match self.stack.last() {
            Some(Item::Value(Value::List(list), _)) => {
                list.borrow_mut().extend(items);
                Rc::as_ptr(list) as *const () as usize
            }
            _ => {
                let err = self.corrupt("APPEND target is not a list");
                dismantle(items);
                return Err(err);
            }
        };
        self.grow(id, height)
    }

    fn extend_dict(&mut self, entries: Vec<(Value, Value)>, height: usize) -> Result<()> {
        let id = match self.stack.last() {
            Some(Item::Value(Value::Dict(dict), _)) => {
                dict.borrow_mut().extend(entries);
                Rc::as_ptr(dict) as *const () as usize
            }
            _ => {
                let err = self.corrupt("SETITEM target is not a dict");
                dismantle(entries.into_iter().flat_map(|(key, value)| [key, value]));
                return Err(err);
            }
        };
        self.grow(id, height)
    }

    fn put(&mut self, index: u32) -> Result<()> {
        let top = self.top()?.clone();
        if let Some(replaced) = self.memo.insert(index, top) {
            discard([replaced]);
        }
        Ok(())
    }

    fn get(&mut self, index: u32) -> Result<()> {
        let item = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| self.corrupt(format!("memo key {index} was never stored")))?;
        self.stack.push(item);
        Ok(())
    }

    fn corrupt<S: Into<String>>(&self, reason: S) -> PersistError {
        PersistError::corrupt(self.at, reason)
    }

    fn io(&self, err: io::Error) -> PersistError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.corrupt("truncated archive")
        } else {
            PersistError::Io(err)
        }
    }
}

impl Drop for Unpickler<'_> {
    fn drop(&mut self) {
        let stacks = mem::take(&mut self.stack)
            .into_iter()
            .chain(mem::take(&mut self.metastack).into_iter().flatten())
            .chain(mem::take(&mut self.memo).into_values());
        discard(stacks);
        dismantle(
            mem::take(&mut self.pending)
                .into_iter()
                .flatten()
                .map(|pending| Value::Object(pending.object)),
        );
    }
}

/// Module names older writers used for the same builtins.
fn normalize_builtin(reference: LegacyReference) -> LegacyReference {
    match reference.module.as_str() {
        "__builtin__" => SymbolRef::new("builtins", reference.name),
        _ => reference,
    }
}

fn encode_text(text: &str, encoding: &str) -> Option<Vec<u8>> {
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "latin1" | "latin-1" | "iso-8859-1" => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect(),
        "utf-8" | "utf8" => Some(text.as_bytes().to_vec()),
        "ascii" => text.is_ascii().then(|| text.as_bytes().to_vec()),
        _ => None,
    }
}

/// Rename state keys in place, for a dict state and for the `(dict, slots)` form.
fn rename_state(state: &Value, renames: &[AttributeRename]) {
    match state {
        Value::Dict(entries) => {
            for (key, _) in entries.borrow_mut().iter_mut() {
                if let Some(rename) = renames.iter().find(|r| key.as_str() == Some(r.from.as_str())) {
                    *key = Value::Str(rename.to.clone());
                }
            }
        }
        Value::Tuple(parts) if parts.len() == 2 => {
            for part in parts {
                if matches!(part, Value::Dict(_)) {
                    rename_state(part, renames);
                }
            }
        }
        _ => {}
    }
}

/// Later `BUILD` keys override earlier ones; non-dict state replaces.
fn merge_state(existing: Value, update: Value) -> Value {
    match (existing, update) {
        (Value::Dict(current), Value::Dict(incoming)) => {
            if !Rc::ptr_eq(&current, &incoming) {
                let incoming = incoming.borrow().clone();
                let mut entries = current.borrow_mut();
                for (key, value) in incoming {
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => dismantle([mem::replace(&mut slot.1, value)]),
                        None => entries.push((key, value)),
                    }
                }
            }
            Value::Dict(current)
        }
        (existing, update) => {
            dismantle([existing]);
            update
        }
    }
}

fn reconstruct(
    shared: &Shared<Object>,
    legacy: LegacyReference,
    adapter: Adapter,
    state: Option<Value>,
) -> Result<()> {
    let args = shared.borrow().args.clone();
    let raw = LegacyState {
        reference: legacy.clone(),
        args,
        state,
    };
    let rebuilt = adapter(raw).map_err(|reason| PersistError::Reconstruct {
        reference: legacy.clone(),
        reason,
    })?;
    debug!(reference = %legacy, class = %rebuilt.class, "Reconstructed legacy object");
    *shared.borrow_mut() = rebuilt;
    Ok(())
}
