/*!
JSON rendering of value graphs.

Plain JSON maps onto the obvious values (arrays are lists, objects are
string-keyed dicts). Everything else uses a tagged object:

| Value | JSON |
|---|---|
| tuple | `{"__tuple__": [..]}` |
| bytes | `{"__bytes__": "00ff"}` (hex) |
| non-finite float | `{"__float__": "nan" \| "inf" \| "-inf"}` |
| dict with non-string keys | `{"__dict__": [[key, value], ..]}` |
| class reference | `{"__global__": "module:name"}` |
| object | `{"__class__": "module:name", "__construction__": "newobj" \| "reduce", "args": [..], "state": ..}` |
| shared node seen before | `{"__ref__": "/json/pointer/to/first/rendering"}` |
| back-reference into a cycle | `{"__cycle__": "list" \| "dict" \| "module:name"}` |

A list, dict or object reachable along several paths is rendered once; later
occurrences are `__ref__` pointers (RFC 6901) and `from_json` restores the
sharing. Cycles cannot be expressed in JSON, so `from_json` rejects `__cycle__`.
*/

use serde_json::{json, Map, Number};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::symbol::SymbolRef;
use crate::value::{Construction, Object, Value};
use crate::{PersistError, Result};

const TUPLE: &str = "__tuple__";
const BYTES: &str = "__bytes__";
const FLOAT: &str = "__float__";
const DICT: &str = "__dict__";
const GLOBAL: &str = "__global__";
const CLASS: &str = "__class__";
const CONSTRUCTION: &str = "__construction__";
const CYCLE: &str = "__cycle__";
const REF: &str = "__ref__";

/// Render `value` as JSON.
pub fn to_json(value: &Value) -> serde_json::Value {
    Renderer::default().render(value)
}

/// Build a value graph from its JSON rendering.
pub fn from_json(json: &serde_json::Value) -> Result<Value> {
    let mut targets = HashSet::new();
    collect_refs(json, &mut targets);
    let mut builder = Builder {
        root: json,
        targets,
        built: HashMap::new(),
        pending: HashSet::new(),
        path: String::new(),
    };
    builder.build(json)
}

/// Append one JSON pointer reference token to `path`.
fn push_segment(path: &mut String, segment: &str) {
    path.push('/');
    for c in segment.chars() {
        match c {
            '~' => path.push_str("~0"),
            '/' => path.push_str("~1"),
            c => path.push(c),
        }
    }
}

#[derive(Default)]
struct Renderer {
    /// Shared nodes on the path from the root
    open: HashSet<usize>,
    /// Pointer to the first rendering of each finished shared node
    rendered: HashMap<usize, String>,
    path: String,
}

impl Renderer {
    fn render(&mut self, value: &Value) -> serde_json::Value {
        let Some(id) = value.node_id() else {
            return self.render_node(value);
        };
        if self.open.contains(&id) {
            let marker = match value {
                Value::Object(object) => object.borrow().class.qualified(),
                other => other.type_name().to_string(),
            };
            return json!({ CYCLE: marker });
        }
        if let Some(pointer) = self.rendered.get(&id) {
            return json!({ REF: pointer });
        }
        self.open.insert(id);
        let rendered = self.render_node(value);
        self.open.remove(&id);
        self.rendered.insert(id, self.path.clone());
        rendered
    }

    fn child(&mut self, segment: &str, value: &Value) -> serde_json::Value {
        let len = self.path.len();
        push_segment(&mut self.path, segment);
        let rendered = self.render(value);
        self.path.truncate(len);
        rendered
    }

    fn render_node(&mut self, value: &Value) -> serde_json::Value {
        match value {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => match Number::from_f64(*f) {
                Some(n) => serde_json::Value::Number(n),
                None if f.is_nan() => json!({ FLOAT: "nan" }),
                None if *f > 0.0 => json!({ FLOAT: "inf" }),
                None => json!({ FLOAT: "-inf" }),
            },
            Value::Str(s) => json!(s),
            Value::Bytes(bytes) => json!({ BYTES: hex(bytes) }),
            Value::Tuple(items) => {
                let len = self.path.len();
                push_segment(&mut self.path, TUPLE);
                let items = self.render_all(items);
                self.path.truncate(len);
                json!({ TUPLE: items })
            }
            Value::List(items) => serde_json::Value::Array(self.render_all(&items.borrow())),
            Value::Dict(entries) => {
                let entries = entries.borrow();
                let keys: Option<HashSet<&str>> = entries.iter().map(|(k, _)| k.as_str()).collect();
                match keys {
                    Some(keys) if keys.len() == entries.len() && !keys.iter().any(|k| is_tag(k)) => {
                        let mut map = Map::new();
                        for (key, value) in entries.iter() {
                            if let Some(key) = key.as_str() {
                                map.insert(key.to_string(), self.child(key, value));
                            }
                        }
                        serde_json::Value::Object(map)
                    }
                    _ => {
                        let len = self.path.len();
                        push_segment(&mut self.path, DICT);
                        let mut pairs = Vec::with_capacity(entries.len());
                        for (i, (k, v)) in entries.iter().enumerate() {
                            let at = self.path.len();
                            push_segment(&mut self.path, &i.to_string());
                            pairs.push(json!([self.child("0", k), self.child("1", v)]));
                            self.path.truncate(at);
                        }
                        self.path.truncate(len);
                        json!({ DICT: pairs })
                    }
                }
            }
            Value::Object(object) => {
                let object = object.borrow();
                let construction = match object.construction {
                    Construction::NewObj => "newobj",
                    Construction::Reduce => "reduce",
                };
                let mut map = Map::new();
                map.insert(CLASS.to_string(), json!(object.class.qualified()));
                map.insert(CONSTRUCTION.to_string(), json!(construction));
                let len = self.path.len();
                push_segment(&mut self.path, "args");
                let args = self.render_all(&object.args);
                self.path.truncate(len);
                map.insert("args".to_string(), serde_json::Value::Array(args));
                if let Some(state) = &object.state {
                    map.insert("state".to_string(), self.child("state", state));
                }
                serde_json::Value::Object(map)
            }
            Value::Global(symbol) => json!({ GLOBAL: symbol.qualified() }),
        }
    }

    /// Render items whose pointers are their indices under the current path.
    fn render_all(&mut self, items: &[Value]) -> Vec<serde_json::Value> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.child(&i.to_string(), item))
            .collect()
    }
}

fn is_tag(key: &str) -> bool {
    matches!(key, TUPLE | BYTES | FLOAT | DICT | GLOBAL | CLASS | CONSTRUCTION | CYCLE | REF)
}

/// Gather every pointer named by a `__ref__` object.
fn collect_refs(json: &serde_json::Value, targets: &mut HashSet<String>) {
    match json {
        serde_json::Value::Array(items) => items.iter().for_each(|item| collect_refs(item, targets)),
        serde_json::Value::Object(map) => match (map.len(), map.get(REF)) {
            (1, Some(serde_json::Value::String(pointer))) => {
                targets.insert(pointer.clone());
            }
            _ => map.values().for_each(|value| collect_refs(value, targets)),
        },
        _ => {}
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn unhex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(PersistError::validation(format!("Invalid hex bytes '{s}'")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| PersistError::validation(format!("Invalid hex bytes '{s}'")))
        })
        .collect()
}

fn number(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Int(i));
    }
    n.as_f64()
        .map(Value::Float)
        .ok_or_else(|| PersistError::validation(format!("Unrepresentable number {n}")))
}

fn tagged<'j>(map: &'j Map<String, serde_json::Value>, tag: &str) -> Result<&'j serde_json::Value> {
    if map.len() != 1 {
        return Err(PersistError::validation(format!(
            "'{tag}' must be the only key of its object"
        )));
    }
    map.get(tag)
        .ok_or_else(|| PersistError::validation(format!("missing '{tag}'")))
}

fn expect_str<'j>(json: &'j serde_json::Value, what: &str) -> Result<&'j str> {
    json.as_str()
        .ok_or_else(|| PersistError::validation(format!("{what} must be a string")))
}

fn expect_array<'j>(json: &'j serde_json::Value, what: &str) -> Result<&'j Vec<serde_json::Value>> {
    json.as_array()
        .ok_or_else(|| PersistError::validation(format!("{what} must be an array")))
}

struct Builder<'j> {
    root: &'j serde_json::Value,
    /// Pointers some `__ref__` names
    targets: HashSet<String>,
    built: HashMap<String, Value>,
    /// Targets whose rendering is being built
    pending: HashSet<String>,
    path: String,
}

impl<'j> Builder<'j> {
    fn build(&mut self, json: &'j serde_json::Value) -> Result<Value> {
        if !self.targets.contains(&self.path) {
            return self.build_node(json);
        }
        if let Some(value) = self.built.get(&self.path) {
            return Ok(value.clone());
        }
        if !self.pending.insert(self.path.clone()) {
            return Err(PersistError::validation(format!(
                "'{REF}' to '{}' refers back into itself",
                self.path
            )));
        }
        let value = self.build_node(json)?;
        self.pending.remove(&self.path);
        self.built.insert(self.path.clone(), value.clone());
        Ok(value)
    }

    fn build_node(&mut self, json: &'j serde_json::Value) -> Result<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => number(n)?,
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::list(self.build_all(items)?),
            serde_json::Value::Object(map) => self.build_object(map)?,
        })
    }

    fn child(&mut self, segment: &str, json: &'j serde_json::Value) -> Result<Value> {
        let len = self.path.len();
        push_segment(&mut self.path, segment);
        let value = self.build(json);
        self.path.truncate(len);
        value
    }

    fn build_all(&mut self, items: &'j [serde_json::Value]) -> Result<Vec<Value>> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.child(&i.to_string(), item))
            .collect()
    }

    fn within<T>(&mut self, segment: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let len = self.path.len();
        push_segment(&mut self.path, segment);
        let out = f(self);
        self.path.truncate(len);
        out
    }

    fn resolve(&mut self, pointer: &str) -> Result<Value> {
        let root = self.root;
        let target = root
            .pointer(pointer)
            .ok_or_else(|| PersistError::validation(format!("'{REF}' to missing '{pointer}'")))?;
        let saved = std::mem::replace(&mut self.path, pointer.to_string());
        let value = self.build(target);
        self.path = saved;
        value
    }

    fn build_object(&mut self, map: &'j Map<String, serde_json::Value>) -> Result<Value> {
        if map.contains_key(CLASS) {
            return self.object(map);
        }
        if let Some(tag) = map.keys().find(|k| is_tag(k)) {
            let body = tagged(map, tag)?;
            return match tag.as_str() {
                TUPLE => {
                    let items = expect_array(body, TUPLE)?;
                    Ok(Value::Tuple(self.within(TUPLE, |b| b.build_all(items))?))
                }
                BYTES => Ok(Value::Bytes(unhex(expect_str(body, BYTES)?)?)),
                FLOAT => match expect_str(body, FLOAT)? {
                    "nan" => Ok(Value::Float(f64::NAN)),
                    "inf" => Ok(Value::Float(f64::INFINITY)),
                    "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
                    other => Err(PersistError::validation(format!("Invalid float '{other}'"))),
                },
                DICT => {
                    let pairs = expect_array(body, DICT)?;
                    let entries = self.within(DICT, |b| {
                        let mut entries = Vec::with_capacity(pairs.len());
                        for (i, pair) in pairs.iter().enumerate() {
                            match expect_array(pair, "dict entry")?.as_slice() {
                                [key, value] => entries.push(b.within(&i.to_string(), |b| {
                                    Ok((b.child("0", key)?, b.child("1", value)?))
                                })?),
                                _ => {
                                    return Err(PersistError::validation(
                                        "dict entry must be a [key, value] pair",
                                    ))
                                }
                            }
                        }
                        Ok(entries)
                    })?;
                    Ok(Value::dict(entries))
                }
                GLOBAL => Ok(Value::Global(expect_str(body, GLOBAL)?.parse::<SymbolRef>()?)),
                REF => self.resolve(expect_str(body, REF)?),
                CYCLE => Err(PersistError::validation("cyclic references cannot be rebuilt from JSON")),
                other => Err(PersistError::validation(format!("'{other}' is not valid here"))),
            };
        }

        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            entries.push((Value::Str(key.clone()), self.child(key, value)?));
        }
        Ok(Value::dict(entries))
    }

    fn object(&mut self, map: &'j Map<String, serde_json::Value>) -> Result<Value> {
        let mut object = Object::new(expect_str(&map[CLASS], CLASS)?.parse::<SymbolRef>()?);
        for (key, value) in map {
            match key.as_str() {
                CLASS => {}
                CONSTRUCTION => {
                    object.construction = match expect_str(value, CONSTRUCTION)? {
                        "newobj" => Construction::NewObj,
                        "reduce" => Construction::Reduce,
                        other => {
                            return Err(PersistError::validation(format!(
                                "Unknown construction '{other}'"
                            )))
                        }
                    }
                }
                "args" => {
                    let args = expect_array(value, "args")?;
                    object.args = self.within("args", |b| b.build_all(args))?;
                }
                "state" => object.state = Some(self.child("state", value)?),
                other => {
                    return Err(PersistError::validation(format!(
                        "Unexpected key '{other}' in object"
                    )))
                }
            }
        }
        Ok(Value::object(object))
    }
}
