/*!
Built-in history of the tabular layout.

Every entry here corresponds to a class or factory that older releases wrote
into archives under a module path or shape that no longer exists.

Current state layouts produced by the reconstruct adapters:

- `Series`: `{"name", "index", "values"}`
- `DataFrame`: `{"index", "columns", "data"}` with `data` keyed by column
- `BlockManager`: `{"axes", "blocks"}`, each block `{"values", "mgr_locs"}`
*/

use once_cell::sync::Lazy;
use std::sync::Arc;

use super::{LegacyRegistry, LegacyState, ResolutionAction};
use crate::symbol::SymbolRef;
use crate::value::{Object, Value};
use crate::Result;

const SERIES: (&str, &str) = ("tabular.core.series", "Series");
const DATAFRAME: (&str, &str) = ("tabular.core.frame", "DataFrame");
const INDEX: (&str, &str) = ("tabular.core.indexes.base", "Index");
const NUMERIC_ARRAY: (&str, &str) = ("tabular.core.arrays", "NumericArray");
const BLOCK_MANAGER: (&str, &str) = ("tabular.core.internals.managers", "BlockManager");

/// Upper bound on the number of entries a densified sparse column may hold.
pub const MAX_DENSE_LENGTH: usize = 1 << 24;

static DEFAULT_REGISTRY: Lazy<Arc<LegacyRegistry>> = Lazy::new(|| {
    Arc::new(tabular_history().expect("built-in legacy history has no conflicting patterns"))
});

/// The process-wide default registry, built on first use and never mutated.
pub fn default_registry() -> Arc<LegacyRegistry> {
    Arc::clone(&DEFAULT_REGISTRY)
}

/// Build the registry describing every relocation the tabular layout went through.
pub fn tabular_history() -> Result<LegacyRegistry> {
    LegacyRegistry::builder()
        // type renames
        .redirect(("tabular.core.series", "TimeSeries"), SERIES)
        .redirect(("tabular.core.base", "FrozenNDArray"), NUMERIC_ARRAY)
        .redirect(("tabular.core.indexes.frozen", "FrozenNDArray"), NUMERIC_ARRAY)
        .redirect(
            ("tabular.core.base", "FrozenList"),
            ("tabular.core.indexes.frozen", "FrozenList"),
        )
        // block constructor became an unpickling helper
        .redirect(
            ("tabular.core.internals.blocks", "new_block"),
            ("tabular.libs.internals", "unpickle_block"),
        )
        // extension modules moving under libs
        .redirect(
            ("tabular._sparse", "BlockIndex"),
            ("tabular.libs.sparse", "BlockIndex"),
        )
        .redirect(
            ("tabular.tslib", "Timestamp"),
            ("tabular.libs.tslibs.timestamps", "Timestamp"),
        )
        .redirect(
            ("tabular._period", "Period"),
            ("tabular.libs.tslibs.period", "Period"),
        )
        .redirect(
            ("tabular.libs.period", "Period"),
            ("tabular.libs.tslibs.period", "Period"),
        )
        .entry(
            [("tabular.tslib", "__nat_unpickle"), ("tabular.libs.tslib", "__nat_unpickle")],
            ResolutionAction::Redirect(SymbolRef::new(
                "tabular.libs.tslibs.nattype",
                "nat_unpickle",
            )),
        )
        // top-level directories moving under core
        .redirect(
            ("tabular.core.sparse.array", "SparseArray"),
            ("tabular.core.arrays", "SparseArray"),
        )
        .redirect(
            ("tabular.tseries.index", "_new_DatetimeIndex"),
            ("tabular.core.indexes.datetimes", "_new_DatetimeIndex"),
        )
        .redirect(
            ("tabular.tseries.index", "DatetimeIndex"),
            ("tabular.core.indexes.datetimes", "DatetimeIndex"),
        )
        .redirect(
            ("tabular.tseries.period", "PeriodIndex"),
            ("tabular.core.indexes.period", "PeriodIndex"),
        )
        .redirect(
            ("tabular.tseries.tdi", "TimedeltaIndex"),
            ("tabular.core.indexes.timedeltas", "TimedeltaIndex"),
        )
        // numeric index subclasses were folded into Index
        .entry(
            [
                ("tabular.core.indexes.numeric", "Int64Index"),
                ("tabular.core.indexes.numeric", "UInt64Index"),
                ("tabular.core.indexes.numeric", "Float64Index"),
            ],
            ResolutionAction::Redirect(SymbolRef::from(INDEX)),
        )
        .redirect(
            ("tabular.core.arrays.sparse.dtype", "SparseDtype"),
            ("tabular.core.dtypes.dtypes", "SparseDtype"),
        )
        // whole module trees that moved
        .namespace("tabular.indexes", "tabular.core.indexes")
        .namespace("tabular.sparse", "tabular.core.sparse")
        .namespace("tabular._libs", "tabular.libs")
        // internal attribute renames
        .rename_attributes(
            ("tabular.core.categorical", "Categorical"),
            ("tabular.core.arrays", "Categorical"),
            &[("labels", "_codes"), ("_levels", "_categories")],
        )
        // restructured representations
        .entry(
            [
                ("tabular.core.sparse.series", "SparseSeries"),
                ("tabular.core.sparse.series", "SparseTimeSeries"),
            ],
            ResolutionAction::Reconstruct {
                target: SymbolRef::from(SERIES),
                adapter: Arc::new(densify_sparse_series),
            },
        )
        .reconstruct(
            ("tabular.core.sparse.frame", "SparseDataFrame"),
            DATAFRAME,
            densify_sparse_frame,
        )
        .reconstruct(
            ("tabular.core.internals", "BlockManager"),
            BLOCK_MANAGER,
            split_block_manager,
        )
        .build()
}

fn require_state(legacy: &LegacyState) -> std::result::Result<&Value, String> {
    legacy
        .state
        .as_ref()
        .ok_or_else(|| format!("{} carries no state", legacy.reference))
}

fn field(state: &Value, key: &str) -> std::result::Result<Value, String> {
    state
        .get(key)
        .ok_or_else(|| format!("legacy state is missing '{key}'"))
}

/// Expand `(positions, values)` into a dense column of `length` entries.
fn densify(sparse: &Value, fill_value: &Value) -> std::result::Result<Vec<Value>, String> {
    let values = field(sparse, "sp_values")?
        .items()
        .ok_or("'sp_values' is not a sequence")?;
    let positions = field(sparse, "sp_index")?
        .items()
        .ok_or("'sp_index' is not a sequence")?;
    let length = field(sparse, "length")?
        .as_int()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or("'length' is not a non-negative integer")?;

    if values.len() != positions.len() {
        return Err(format!(
            "{} sparse values for {} positions",
            values.len(),
            positions.len()
        ));
    }
    if length > MAX_DENSE_LENGTH {
        return Err(format!(
            "sparse length {length} exceeds the limit of {MAX_DENSE_LENGTH} entries"
        ));
    }

    let mut dense = Vec::new();
    dense
        .try_reserve_exact(length)
        .map_err(|e| format!("cannot allocate {length} dense entries: {e}"))?;
    dense.resize(length, fill_value.clone());
    for (position, value) in positions.iter().zip(values) {
        let slot = position
            .as_int()
            .filter(|p| *p >= 0 && (*p as usize) < length)
            .ok_or_else(|| format!("sparse position {position:?} outside 0..{length}"))?;
        dense[slot as usize] = value;
    }
    Ok(dense)
}

/// Legacy sparse series state: `{"sp_values", "sp_index", "length", "fill_value", "name", "index"}`.
fn densify_sparse_series(legacy: LegacyState) -> std::result::Result<Object, String> {
    let state = require_state(&legacy)?;
    let fill_value = state.get("fill_value").unwrap_or(Value::None);
    let dense = densify(state, &fill_value)?;

    Ok(Object::new(SymbolRef::from(SERIES)).with_state(Value::record(vec![
        ("name", state.get("name").unwrap_or(Value::None)),
        ("index", state.get("index").unwrap_or(Value::None)),
        ("values", Value::list(dense)),
    ])))
}

/// Legacy sparse frame state: `{"_series", "columns", "index", "default_fill_value"}`,
/// where `_series` maps each column to its sparse payload.
fn densify_sparse_frame(legacy: LegacyState) -> std::result::Result<Object, String> {
    let state = require_state(&legacy)?;
    let default_fill = state.get("default_fill_value").unwrap_or(Value::None);
    let columns = field(state, "columns")?;
    let series = field(state, "_series")?;

    let mut data = Vec::new();
    for column in columns.items().ok_or("'columns' is not a sequence")? {
        let name = column
            .as_str()
            .ok_or_else(|| format!("column label {column:?} is not a string"))?;
        let sparse = series
            .get(name)
            .ok_or_else(|| format!("no sparse payload for column '{name}'"))?;
        let fill_value = sparse.get("fill_value").unwrap_or_else(|| default_fill.clone());
        data.push((Value::str(name), Value::list(densify(&sparse, &fill_value)?)));
    }

    Ok(Object::new(SymbolRef::from(DATAFRAME)).with_state(Value::record(vec![
        ("index", state.get("index").unwrap_or(Value::None)),
        ("columns", columns),
        ("data", Value::dict(data)),
    ])))
}

/// Legacy block manager state: `(axes, block_values, block_items)`, where each
/// block is addressed by item labels rather than positions.
fn split_block_manager(legacy: LegacyState) -> std::result::Result<Object, String> {
    let state = require_state(&legacy)?;
    let parts = match state {
        Value::Tuple(parts) if parts.len() == 3 => parts,
        other => {
            return Err(format!(
                "expected (axes, block_values, block_items), found {}",
                other.type_name()
            ))
        }
    };
    let axes = parts[0].clone();
    let block_values = parts[1].items().ok_or("block values are not a sequence")?;
    let block_items = parts[2].items().ok_or("block items are not a sequence")?;
    if block_values.len() != block_items.len() {
        return Err(format!(
            "{} blocks but {} item groups",
            block_values.len(),
            block_items.len()
        ));
    }

    let labels = axes
        .items()
        .and_then(|axes| axes.first().cloned())
        .and_then(|items| items.items())
        .ok_or("first axis is not a sequence of labels")?;

    let mut blocks = Vec::with_capacity(block_values.len());
    for (values, items) in block_values.into_iter().zip(block_items) {
        let mut locs = Vec::new();
        for item in items.items().ok_or("block items are not a sequence")? {
            let position = labels
                .iter()
                .position(|label| *label == item)
                .ok_or_else(|| format!("block item {item:?} not found on the first axis"))?;
            locs.push(Value::Int(position as i64));
        }
        blocks.push(Value::record(vec![
            ("values", values),
            ("mgr_locs", Value::list(locs)),
        ]));
    }

    Ok(Object::new(SymbolRef::from(BLOCK_MANAGER)).with_state(Value::record(vec![
        ("axes", axes),
        ("blocks", Value::list(blocks)),
    ])))
}
