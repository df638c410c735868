/*!
Legacy symbol resolution.

Archives written by older releases name classes and factory functions that
have since been renamed, moved or restructured. While decoding, the codec
hands every `(module, name)` pair it cannot find in the current
[`TypeCatalog`](crate::symbol::TypeCatalog) to a [`SymbolResolver`], which
answers with a [`ResolutionOutcome`].

[`LegacyRegistry`] is the standard resolver: an immutable table built once
through [`RegistryBuilder`] and shared read-only between threads.

Resolution order:

1. exact match on the legacy reference
2. longest namespace prefix rewrite, then exact match on the rewritten
   reference (or a plain redirect to it)
3. unresolvable
*/

pub mod builtin;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::symbol::{LegacyReference, SymbolRef};
use crate::value::{Object, Value};
use crate::{PersistError, Result};

pub use builtin::{default_registry, tabular_history};

/// Raw state handed to a reconstruct adapter.
#[derive(Debug, Clone)]
pub struct LegacyState {
    /// The reference as written in the archive.
    pub reference: LegacyReference,
    /// Constructor arguments recorded for the object.
    pub args: Vec<Value>,
    /// State applied by `BUILD`, if the archive carried any.
    pub state: Option<Value>,
}

/// Adapter that turns legacy state into a current-shape object.
pub type Adapter =
    Arc<dyn Fn(LegacyState) -> std::result::Result<Object, String> + Send + Sync + 'static>;

/// One `old -> new` state key rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRename {
    pub from: String,
    pub to: String,
}

impl AttributeRename {
    pub fn new<F: Into<String>, T: Into<String>>(from: F, to: T) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// What to do with a legacy reference.
#[derive(Clone)]
pub enum ResolutionAction {
    /// Resolve at a different module and/or name.
    Redirect(SymbolRef),
    /// Resolve to `target` and rename state keys when state is applied.
    RenameAttribute {
        target: SymbolRef,
        renames: Arc<[AttributeRename]>,
    },
    /// Build the current object from the raw legacy state.
    Reconstruct { target: SymbolRef, adapter: Adapter },
}

/// Answer of a [`SymbolResolver`] for one legacy reference.
#[derive(Clone)]
pub enum ResolutionOutcome {
    Redirect(SymbolRef),
    RenameAttribute {
        target: SymbolRef,
        renames: Arc<[AttributeRename]>,
    },
    Reconstruct {
        target: SymbolRef,
        adapter: Adapter,
    },
    Unresolvable,
}

impl ResolutionOutcome {
    /// The current symbol this outcome resolves to.
    pub fn target(&self) -> Option<&SymbolRef> {
        match self {
            Self::Redirect(target)
            | Self::RenameAttribute { target, .. }
            | Self::Reconstruct { target, .. } => Some(target),
            Self::Unresolvable => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolvable)
    }
}

impl From<ResolutionAction> for ResolutionOutcome {
    fn from(action: ResolutionAction) -> Self {
        match action {
            ResolutionAction::Redirect(target) => Self::Redirect(target),
            ResolutionAction::RenameAttribute { target, renames } => {
                Self::RenameAttribute { target, renames }
            }
            ResolutionAction::Reconstruct { target, adapter } => {
                Self::Reconstruct { target, adapter }
            }
        }
    }
}

impl PartialEq for ResolutionOutcome {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Redirect(a), Self::Redirect(b)) => a == b,
            (
                Self::RenameAttribute {
                    target: ta,
                    renames: ra,
                },
                Self::RenameAttribute {
                    target: tb,
                    renames: rb,
                },
            ) => ta == tb && ra == rb,
            (
                Self::Reconstruct {
                    target: ta,
                    adapter: aa,
                },
                Self::Reconstruct {
                    target: tb,
                    adapter: ab,
                },
            ) => ta == tb && Arc::ptr_eq(aa, ab),
            (Self::Unresolvable, Self::Unresolvable) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redirect(target) => f.debug_tuple("Redirect").field(target).finish(),
            Self::RenameAttribute { target, renames } => f
                .debug_struct("RenameAttribute")
                .field("target", target)
                .field("renames", renames)
                .finish(),
            Self::Reconstruct { target, .. } => f
                .debug_struct("Reconstruct")
                .field("target", target)
                .finish_non_exhaustive(),
            Self::Unresolvable => f.write_str("Unresolvable"),
        }
    }
}

impl fmt::Debug for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&ResolutionOutcome::from(self.clone()), f)
    }
}

/// Callback the codec consults for symbols missing from the catalog.
///
/// Implementations must be deterministic and must not mutate shared state,
/// since concurrent restores call them from several threads.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, reference: &LegacyReference) -> ResolutionOutcome;
}

/// A resolver that knows nothing; every missing symbol is unresolvable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLegacySymbols;

impl SymbolResolver for NoLegacySymbols {
    fn resolve(&self, _reference: &LegacyReference) -> ResolutionOutcome {
        ResolutionOutcome::Unresolvable
    }
}

/// Immutable table of legacy references and relocated namespaces.
#[derive(Debug, Clone, Default)]
pub struct LegacyRegistry {
    exact: BTreeMap<LegacyReference, ResolutionAction>,
    namespaces: BTreeMap<String, String>,
}

impl LegacyRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Resolve a legacy reference. Pure: no state changes on lookup.
    pub fn lookup(&self, reference: &LegacyReference) -> ResolutionOutcome {
        if let Some(action) = self.exact.get(reference) {
            return action.clone().into();
        }

        if let Some(module) = self.rewrite_namespace(&reference.module) {
            let rewritten = SymbolRef::new(module, reference.name.clone());
            if let Some(action) = self.exact.get(&rewritten) {
                return action.clone().into();
            }
            return ResolutionOutcome::Redirect(rewritten);
        }

        ResolutionOutcome::Unresolvable
    }

    /// Rewrite `module` through the longest matching namespace prefix.
    fn rewrite_namespace(&self, module: &str) -> Option<String> {
        self.namespaces
            .iter()
            .filter(|(legacy, _)| {
                module == legacy.as_str()
                    || (module.starts_with(legacy.as_str())
                        && module.as_bytes().get(legacy.len()) == Some(&b'.'))
            })
            .max_by_key(|(legacy, _)| legacy.len())
            .map(|(legacy, current)| format!("{current}{}", &module[legacy.len()..]))
    }

    pub fn exact_entries(&self) -> usize {
        self.exact.len()
    }

    pub fn namespace_entries(&self) -> usize {
        self.namespaces.len()
    }
}

impl SymbolResolver for LegacyRegistry {
    fn resolve(&self, reference: &LegacyReference) -> ResolutionOutcome {
        let outcome = self.lookup(reference);
        debug!(reference = %reference, outcome = ?outcome, "Resolved legacy symbol");
        outcome
    }
}

/// Append-only builder for a [`LegacyRegistry`].
///
/// Registering the same exact pattern or the same namespace prefix twice is
/// reported by [`RegistryBuilder::build`] as a configuration error.
#[derive(Default)]
pub struct RegistryBuilder {
    exact: BTreeMap<LegacyReference, ResolutionAction>,
    namespaces: BTreeMap<String, String>,
    conflicts: Vec<String>,
}

impl RegistryBuilder {
    /// Register one action for one or more legacy patterns.
    pub fn entry<I, R>(mut self, patterns: I, action: ResolutionAction) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<LegacyReference>,
    {
        for pattern in patterns {
            let pattern = pattern.into();
            if self.exact.contains_key(&pattern) {
                self.conflicts.push(format!("duplicate pattern {pattern}"));
                continue;
            }
            self.exact.insert(pattern, action.clone());
        }
        self
    }

    pub fn redirect<L: Into<LegacyReference>, T: Into<SymbolRef>>(self, legacy: L, target: T) -> Self {
        self.entry([legacy.into()], ResolutionAction::Redirect(target.into()))
    }

    pub fn rename_attributes<L, T>(self, legacy: L, target: T, renames: &[(&str, &str)]) -> Self
    where
        L: Into<LegacyReference>,
        T: Into<SymbolRef>,
    {
        let renames: Arc<[AttributeRename]> = renames
            .iter()
            .map(|(from, to)| AttributeRename::new(*from, *to))
            .collect();
        self.entry(
            [legacy.into()],
            ResolutionAction::RenameAttribute {
                target: target.into(),
                renames,
            },
        )
    }

    pub fn reconstruct<L, T, F>(self, legacy: L, target: T, adapter: F) -> Self
    where
        L: Into<LegacyReference>,
        T: Into<SymbolRef>,
        F: Fn(LegacyState) -> std::result::Result<Object, String> + Send + Sync + 'static,
    {
        self.entry(
            [legacy.into()],
            ResolutionAction::Reconstruct {
                target: target.into(),
                adapter: Arc::new(adapter),
            },
        )
    }

    /// Relocate a whole legacy module tree.
    pub fn namespace<L: Into<String>, C: Into<String>>(mut self, legacy: L, current: C) -> Self {
        let legacy = legacy.into();
        if self.namespaces.contains_key(&legacy) {
            self.conflicts
                .push(format!("duplicate namespace redirect {legacy}"));
            return self;
        }
        self.namespaces.insert(legacy, current.into());
        self
    }

    pub fn build(self) -> Result<LegacyRegistry> {
        if let Some(conflict) = self.conflicts.into_iter().next() {
            return Err(PersistError::registry(conflict));
        }
        Ok(LegacyRegistry {
            exact: self.exact,
            namespaces: self.namespaces,
        })
    }
}
