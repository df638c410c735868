/*!
# Tabpickle Core Engine

Versioned persistence for tabular object graphs.

`persist` writes a [`Value`] graph to a file, a `scheme://` location or a
caller-owned stream as a pickle opcode stream (protocols 2 to 5), optionally
inside a compression envelope. `restore` reads it back, mapping symbols
that older releases wrote onto the current layout through the
[`LegacyRegistry`] and retrying legacy string data under a ladder of
decoding assumptions.

## Architecture

- [`engine`]: the facade; `persist`, `restore` and engine wiring
- [`storage`]: scoped streams over pluggable storage backends
- [`compression`]: gzip, bz2, xz, zstd, zip and tar envelopes
- [`codec`]: the opcode reader and writer
- [`compat`]: legacy symbol resolution and the built-in history
- [`json`]: JSON rendering of value graphs

## Usage

```rust
use tabpickle_core::{persist, restore, PersistOptions, RestoreOptions, Value};

let dir = tempfile::tempdir()?;
let path = dir.path().join("frame.pkl.bz2");

let value = Value::record(vec![("rows", Value::Int(3))]);
persist(&value, path.as_path(), &PersistOptions::default())?;

let restored = restore(path.as_path(), &RestoreOptions::default())?;
assert_eq!(restored, value);
# Ok::<(), tabpickle_core::PersistError>(())
```
*/

pub mod codec;
pub mod compat;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod json;
pub mod observability;
pub mod storage;
pub mod symbol;
pub mod value;


pub use codec::{
    DecodeOptions, ObjectCodec, PickleCodec, StringDecoding, HIGHEST_PROTOCOL, LOWEST_PROTOCOL, MAX_NESTING_DEPTH,
};
pub use compat::{
    default_registry, LegacyRegistry, LegacyState, ResolutionAction, ResolutionOutcome, SymbolResolver,
};
pub use compression::{Compression, CompressionSpec};
pub use config::{CompressionOptions, EngineConfig, Location, PersistOptions, RestoreOptions, StorageOptions};
pub use engine::{create_default_engine, create_engine_from_config, persist, restore, PickleEngine};
pub use error::{ErrorKind, PersistError, Result};
pub use storage::{Destination, LocalFileStorage, MemoryStorage, Source, StorageAdapter, StreamProvider};
pub use symbol::{LegacyReference, SymbolRef, TypeCatalog};
pub use value::{Construction, Object, Value};
