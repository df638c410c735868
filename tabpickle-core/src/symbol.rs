/*!
Symbol references and the catalog of symbols that exist in the current layout.

Archives refer to classes and constructor functions by `(module, name)`.
The [`TypeCatalog`] answers whether such a pair still exists; anything it
does not know is handed to the legacy resolver.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{PersistError, Result};

/// A `(module, name)` pair naming a class or constructor function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolRef {
    pub module: String,
    pub name: String,
}

/// A symbol reference as it appears inside an archive. Never rewritten in place.
pub type LegacyReference = SymbolRef;

impl SymbolRef {
    pub fn new<M: Into<String>, N: Into<String>>(module: M, name: N) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// `module:name` form used in JSON renderings and CLI output.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.module, self.name)
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for SymbolRef {
    type Err = PersistError;

    /// Parses the `module:name` form.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(Self::new(module, name))
            }
            _ => Err(PersistError::validation(format!(
                "Invalid symbol '{s}': expected module:name"
            ))),
        }
    }
}

impl<M: Into<String>, N: Into<String>> From<(M, N)> for SymbolRef {
    fn from((module, name): (M, N)) -> Self {
        Self::new(module, name)
    }
}

/// What a catalog symbol is when the codec applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Class,
    Function,
}

/// Symbols the codec interprets itself rather than recording as objects.
pub mod builtins {
    pub const BYTES: (&str, &str) = ("builtins", "bytes");
    pub const CODECS_ENCODE: (&str, &str) = ("_codecs", "encode");
}

/// The set of symbols that exist in the current layout.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    symbols: BTreeMap<SymbolRef, SymbolKind>,
}

impl TypeCatalog {
    /// Create a catalog holding only the codec builtins.
    pub fn new() -> Self {
        Self::default()
            .with_symbol(builtins::BYTES, SymbolKind::Class)
            .with_symbol(builtins::CODECS_ENCODE, SymbolKind::Function)
    }

    pub fn with_symbol<S: Into<SymbolRef>>(mut self, symbol: S, kind: SymbolKind) -> Self {
        self.register(symbol, kind);
        self
    }

    pub fn register<S: Into<SymbolRef>>(&mut self, symbol: S, kind: SymbolKind) {
        self.symbols.insert(symbol.into(), kind);
    }

    pub fn lookup(&self, symbol: &SymbolRef) -> Option<SymbolKind> {
        self.symbols.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &SymbolRef) -> bool {
        self.symbols.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The current tabular layout: frames, series, indexes, arrays, dtypes,
    /// block internals and time scalars.
    pub fn tabular() -> Self {
        use SymbolKind::{Class, Function};

        const CLASSES: &[(&str, &str)] = &[
            ("tabular.core.frame", "DataFrame"),
            ("tabular.core.series", "Series"),
            ("tabular.core.indexes.base", "Index"),
            ("tabular.core.indexes.range", "RangeIndex"),
            ("tabular.core.indexes.multi", "MultiIndex"),
            ("tabular.core.indexes.datetimes", "DatetimeIndex"),
            ("tabular.core.indexes.timedeltas", "TimedeltaIndex"),
            ("tabular.core.indexes.period", "PeriodIndex"),
            ("tabular.core.indexes.frozen", "FrozenList"),
            ("tabular.core.arrays", "Categorical"),
            ("tabular.core.arrays", "SparseArray"),
            ("tabular.core.arrays", "NumericArray"),
            ("tabular.core.dtypes.dtypes", "CategoricalDtype"),
            ("tabular.core.dtypes.dtypes", "SparseDtype"),
            ("tabular.core.internals.managers", "BlockManager"),
            ("tabular.core.internals.managers", "SingleBlockManager"),
            ("tabular.libs.sparse", "BlockIndex"),
            ("tabular.libs.sparse", "IntIndex"),
            ("tabular.libs.tslibs.timestamps", "Timestamp"),
            ("tabular.libs.tslibs.period", "Period"),
        ];
        const FUNCTIONS: &[(&str, &str)] = &[
            ("tabular.core.indexes.base", "_new_Index"),
            ("tabular.core.indexes.datetimes", "_new_DatetimeIndex"),
            ("tabular.libs.internals", "unpickle_block"),
            ("tabular.libs.tslibs.nattype", "nat_unpickle"),
        ];

        let mut catalog = Self::new();
        for &symbol in CLASSES {
            catalog.register(symbol, Class);
        }
        for &symbol in FUNCTIONS {
            catalog.register(symbol, Function);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_display_and_qualified() {
        let symbol = SymbolRef::new("tabular.core.series", "Series");
        assert_eq!(symbol.to_string(), "tabular.core.series.Series");
        assert_eq!(symbol.qualified(), "tabular.core.series:Series");
    }

    #[test]
    fn test_symbol_parse() {
        let symbol: SymbolRef = "tabular.core.frame:DataFrame".parse().unwrap();
        assert_eq!(symbol, SymbolRef::new("tabular.core.frame", "DataFrame"));

        assert!("tabular.core.frame.DataFrame".parse::<SymbolRef>().is_err());
        assert!(":DataFrame".parse::<SymbolRef>().is_err());
        assert!("tabular:".parse::<SymbolRef>().is_err());
    }

    #[test]
    fn test_tabular_catalog_contents() {
        let catalog = TypeCatalog::tabular();
        assert_eq!(
            catalog.lookup(&SymbolRef::new("tabular.core.frame", "DataFrame")),
            Some(SymbolKind::Class)
        );
        assert_eq!(
            catalog.lookup(&SymbolRef::new("tabular.libs.internals", "unpickle_block")),
            Some(SymbolKind::Function)
        );
        assert!(catalog.contains(&SymbolRef::from(builtins::BYTES)));
        assert!(!catalog.contains(&SymbolRef::new("tabular.core.series", "TimeSeries")));
    }

    #[test]
    fn test_catalog_register() {
        let mut catalog = TypeCatalog::new();
        let before = catalog.len();
        catalog.register(("app.models", "Widget"), SymbolKind::Class);
        assert_eq!(catalog.len(), before + 1);
        assert!(catalog.contains(&SymbolRef::new("app.models", "Widget")));
    }
}
