/*!
The object graph persisted by the codec.

Scalars and tuples are plain values. Lists, dicts and objects are shared
cells (`Rc<RefCell<..>>`), so a graph can hold the same container in
several places, or hold itself, and the codec preserves that identity.
*/

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::vec;

use crate::symbol::SymbolRef;

/// Shared, mutable node of the graph.
pub type Shared<T> = Rc<RefCell<T>>;

/// Ordered key/value pairs. Keys are arbitrary values, so no hashing.
pub type DictEntries = Vec<(Value, Value)>;

/// How an object was created when its archive was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    /// `cls.__new__(cls, *args)` followed by optional state.
    NewObj,
    /// A call of a class or factory function with `args`.
    Reduce,
}

/// An instance of a catalog symbol: the class, its constructor arguments
/// and the state applied after construction.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: SymbolRef,
    pub construction: Construction,
    pub args: Vec<Value>,
    pub state: Option<Value>,
}

impl Object {
    pub fn new(class: SymbolRef) -> Self {
        Self {
            class,
            construction: Construction::NewObj,
            args: Vec::new(),
            state: None,
        }
    }

    /// A call record: `class(*args)`.
    pub fn call(class: SymbolRef, args: Vec<Value>) -> Self {
        Self {
            class,
            construction: Construction::Reduce,
            args,
            state: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    /// Look up a string key in a dict state.
    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.state.as_ref().and_then(|state| state.get(key))
    }
}

/// A node in a persisted object graph.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<DictEntries>),
    Object(Shared<Object>),
    /// A class or function referenced as a value rather than called.
    Global(SymbolRef),
}

impl Value {
    pub fn str<S: Into<String>>(s: S) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: DictEntries) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    /// Build a dict with string keys.
    pub fn record<K: Into<String>>(entries: Vec<(K, Value)>) -> Self {
        Value::dict(
            entries
                .into_iter()
                .map(|(key, value)| (Value::Str(key.into()), value))
                .collect(),
        )
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Object(_) => "object",
            Value::Global(_) => "global",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Elements of a list or tuple, cloned.
    pub fn items(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.borrow().clone()),
            Value::Tuple(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Dict(entries) => entries
                .borrow()
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// The class of an object value.
    pub fn class(&self) -> Option<SymbolRef> {
        match self {
            Value::Object(object) => Some(object.borrow().class.clone()),
            _ => None,
        }
    }

    /// Whether two values are the same shared node.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Container children of a shared node, as skeletons.
    fn child_containers(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.borrow().iter().filter_map(Value::skeleton).collect(),
            Value::Dict(entries) => entries
                .borrow()
                .iter()
                .flat_map(|(key, item)| [key, item])
                .filter_map(Value::skeleton)
                .collect(),
            Value::Object(object) => {
                let object = object.borrow();
                object
                    .args
                    .iter()
                    .chain(object.state.iter())
                    .filter_map(Value::skeleton)
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// The container structure of a value: tuples copied without their
    /// scalars, shared nodes by reference, scalars dropped.
    fn skeleton(&self) -> Option<Value> {
        match self {
            Value::Tuple(items) => Some(Value::Tuple(items.iter().filter_map(Value::skeleton).collect())),
            Value::List(_) | Value::Dict(_) | Value::Object(_) => Some(self.clone()),
            _ => None,
        }
    }

    /// Address of a shared node, used as its identity by the codec.
    pub(crate) fn node_id(&self) -> Option<usize> {
        match self {
            Value::List(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Dict(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            _ => None,
        }
    }
}

/// Height of the deepest container chain in `value`: scalars are 0, a
/// container is one more than its deepest child.
///
/// Walks without recursion. Shared nodes are measured once, and a reference
/// back to a node still being walked counts as a single level. Returns as
/// soon as the height is known to exceed `limit`.
pub fn nesting_depth(value: &Value, limit: usize) -> usize {
    struct Frame {
        id: Option<usize>,
        children: vec::IntoIter<Value>,
        height: usize,
    }

    let mut finished: HashMap<usize, usize> = HashMap::new();
    let mut open: HashSet<usize> = HashSet::new();
    let mut frames: Vec<Frame> = Vec::new();

    let mut enter = |value: Value, frames: &mut Vec<Frame>, finished: &HashMap<usize, usize>| {
        if let Some(id) = value.node_id() {
            if let Some(&height) = finished.get(&id) {
                return Some(height);
            }
            if !open.insert(id) {
                return Some(1);
            }
            frames.push(Frame {
                id: Some(id),
                children: value.child_containers().into_iter(),
                height: 0,
            });
            return None;
        }
        match value {
            Value::Tuple(items) => {
                frames.push(Frame {
                    id: None,
                    children: items.into_iter(),
                    height: 0,
                });
                None
            }
            _ => Some(0),
        }
    };

    let Some(root) = value.skeleton() else {
        return 0;
    };
    if let Some(height) = enter(root, &mut frames, &finished) {
        return height;
    }
    loop {
        if frames.len() > limit {
            return frames.len();
        }
        let child = match frames.last_mut() {
            Some(frame) => frame.children.next(),
            None => return 0,
        };
        let height = match child {
            Some(child) => match enter(child, &mut frames, &finished) {
                Some(height) => height,
                None => continue,
            },
            None => {
                let Some(frame) = frames.pop() else {
                    return 0;
                };
                let height = frame.height + 1;
                if let Some(id) = frame.id {
                    finished.insert(id, height);
                }
                height
            }
        };
        if height > limit {
            return height;
        }
        match frames.last_mut() {
            Some(parent) => parent.height = parent.height.max(height),
            None => return height,
        }
    }
}

/// Drop a graph without recursing into it.
///
/// Nodes still referenced elsewhere are only released, not taken apart.
pub fn dismantle<I: IntoIterator<Item = Value>>(values: I) {
    let mut pending: Vec<Value> = values.into_iter().collect();
    while let Some(value) = pending.pop() {
        match value {
            Value::Tuple(items) => pending.extend(items),
            Value::List(items) => {
                if let Ok(items) = Rc::try_unwrap(items) {
                    pending.extend(items.into_inner());
                }
            }
            Value::Dict(entries) => {
                if let Ok(entries) = Rc::try_unwrap(entries) {
                    for (key, item) in entries.into_inner() {
                        pending.push(key);
                        pending.push(item);
                    }
                }
            }
            Value::Object(object) => {
                if let Ok(object) = Rc::try_unwrap(object) {
                    let object = object.into_inner();
                    pending.extend(object.args);
                    pending.extend(object.state);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl PartialEq for Value {
    /// Structural equality. A pair of shared nodes already under comparison
    /// is assumed equal, which makes cyclic graphs comparable.
    fn eq(&self, other: &Self) -> bool {
        GraphEq::default().values(self, other)
    }
}

#[derive(Default)]
struct GraphEq {
    assumed: HashSet<(usize, usize)>,
}

impl GraphEq {
    fn values(&mut self, a: &Value, b: &Value) -> bool {
        if let (Some(x), Some(y)) = (a.node_id(), b.node_id()) {
            if x == y || !self.assumed.insert((x, y)) {
                return true;
            }
        }
        match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Bytes(x), Value::Bytes(y)) => x == y,
            (Value::Global(x), Value::Global(y)) => x == y,
            (Value::Tuple(x), Value::Tuple(y)) => self.slices(x, y),
            (Value::List(x), Value::List(y)) => self.slices(&x.borrow(), &y.borrow()),
            (Value::Dict(x), Value::Dict(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len()
                    && x
                        .iter()
                        .zip(y.iter())
                        .all(|((kx, vx), (ky, vy))| self.values(kx, ky) && self.values(vx, vy))
            }
            (Value::Object(x), Value::Object(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                x.class == y.class
                    && x.construction == y.construction
                    && self.slices(&x.args, &y.args)
                    && match (&x.state, &y.state) {
                        (None, None) => true,
                        (Some(sx), Some(sy)) => self.values(sx, sy),
                        _ => false,
                    }
            }
            _ => false,
        }
    }

    fn slices(&mut self, a: &[Value], b: &[Value]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.values(x, y))
    }
}
