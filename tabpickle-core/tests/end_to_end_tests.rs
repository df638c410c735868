/*!
End-to-end tests: persist and restore through local files, compression
envelopes, legacy archives and concurrent callers.
*/

use rayon::prelude::*;
use std::fs;
use std::path::Path;
use tabpickle_core::json::to_json;
use tabpickle_core::{
    create_default_engine, persist, restore, Compression, ErrorKind, Object, PersistError,
    PersistOptions, RestoreOptions, StringDecoding, SymbolRef, Value,
};
use tempfile::TempDir;

/// Hand-assembled protocol 2 archive, the shape older writers produced.
struct Archive(Vec<u8>);

impl Archive {
    fn new() -> Self {
        Archive(vec![0x80, 2])
    }

    fn op(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    fn global(mut self, module: &str, name: &str) -> Self {
        self.0.push(b'c');
        self.0.extend_from_slice(module.as_bytes());
        self.0.push(b'\n');
        self.0.extend_from_slice(name.as_bytes());
        self.0.push(b'\n');
        self
    }

    fn text(mut self, s: &str) -> Self {
        self.0.push(b'X');
        self.0.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.0.extend_from_slice(s.as_bytes());
        self
    }

    fn legacy_text(mut self, raw: &[u8]) -> Self {
        self.0.push(b'U');
        self.0.push(raw.len() as u8);
        self.0.extend_from_slice(raw);
        self
    }

    fn int(mut self, i: u8) -> Self {
        self.0.extend_from_slice(&[b'K', i]);
        self
    }

    fn float(mut self, f: f64) -> Self {
        self.0.push(b'G');
        self.0.extend_from_slice(&f.to_be_bytes());
        self
    }

    /// `cls()` via NEWOBJ with no arguments
    fn new_object(self, module: &str, name: &str) -> Self {
        self.global(module, name).op(b')').op(0x81)
    }

    fn finish(mut self) -> Vec<u8> {
        self.0.push(b'.');
        self.0
    }
}

const MARK: u8 = b'(';
const EMPTY_DICT: u8 = b'}';
const EMPTY_LIST: u8 = b']';
const APPENDS: u8 = b'e';
const SETITEMS: u8 = b'u';
const BUILD: u8 = b'b';
const NONE: u8 = b'N';

fn symbol(module: &str, name: &str) -> SymbolRef {
    SymbolRef::new(module, name)
}

/// A frame whose index object is shared with one of its columns and which
/// refers back to itself.
fn sample_frame() -> Value {
    let index = Value::object(Object::call(
        symbol("tabular.core.indexes.base", "_new_Index"),
        vec![
            Value::Global(symbol("tabular.core.indexes.base", "Index")),
            Value::record(vec![
                ("data", Value::list((0..5).map(Value::Int).collect())),
                ("name", Value::None),
            ]),
        ],
    ));
    let column = Value::object(Object::new(symbol("tabular.core.series", "Series")).with_state(
        Value::record(vec![
            ("name", Value::str("price")),
            ("index", index.clone()),
            ("values", Value::list(vec![Value::Float(1.25), Value::Float(-3.5)])),
        ]),
    ));
    let frame = Value::object(Object::new(symbol("tabular.core.frame", "DataFrame")));
    let state = Value::record(vec![
        ("index", index),
        ("columns", Value::Tuple(vec![Value::str("price"), Value::str("qty")])),
        ("price", column),
        ("qty", Value::list(vec![Value::Int(1 << 40), Value::Int(-7), Value::Int(300)])),
        ("raw", Value::Bytes((0..=255u8).cycle().take(600).collect())),
        ("label", Value::str("naïve ☃")),
        ("flags", Value::Tuple(vec![Value::Bool(true), Value::None])),
        ("owner", frame.clone()),
    ]);
    if let Value::Object(cell) = &frame {
        cell.borrow_mut().state = Some(state);
    }
    frame
}

fn object_state(value: &Value) -> Value {
    match value {
        Value::Object(cell) => cell.borrow().state.clone().unwrap(),
        other => panic!("expected an object, got {}", other.type_name()),
    }
}

fn write_archive(dir: &Path, name: &str, archive: Vec<u8>) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, archive).unwrap();
    path
}

#[test]
fn test_roundtrip_every_protocol() {
    let temp_dir = TempDir::new().unwrap();
    let frame = sample_frame();

    for protocol in 2..=5 {
        let path = temp_dir.path().join(format!("frame_p{protocol}.pkl"));
        persist(&frame, path.as_path(), &PersistOptions::new().with_protocol(protocol)).unwrap();
        assert_eq!(fs::read(&path).unwrap()[..2], [0x80, protocol as u8]);

        let restored = restore(path.as_path(), &RestoreOptions::default()).unwrap();
        assert_eq!(restored, frame, "protocol {protocol}");

        let state = object_state(&restored);
        let column_index = object_state(&state.get("price").unwrap()).get("index").unwrap();
        assert!(state.get("index").unwrap().ptr_eq(&column_index));
        assert!(state.get("owner").unwrap().ptr_eq(&restored));
    }
}

#[test]
fn test_default_protocol_is_byte_identical_to_highest() {
    let temp_dir = TempDir::new().unwrap();
    let frame = sample_frame();
    let default_path = temp_dir.path().join("default.pkl");
    let highest_path = temp_dir.path().join("highest.pkl");

    persist(&frame, default_path.as_path(), &PersistOptions::default()).unwrap();
    persist(&frame, highest_path.as_path(), &PersistOptions::new().with_protocol(5)).unwrap();
    assert_eq!(fs::read(default_path).unwrap(), fs::read(highest_path).unwrap());
}

#[test]
fn test_every_suffix_infers_its_envelope() {
    let temp_dir = TempDir::new().unwrap();
    let frame = sample_frame();
    let cases = [
        ("frame.pkl.gz", &[0x1f, 0x8b][..]),
        ("frame.pkl.bz2", &b"BZh"[..]),
        ("frame.pkl.xz", &[0xfd, b'7', b'z', b'X', b'Z'][..]),
        ("frame.pkl.zst", &[0x28, 0xb5, 0x2f, 0xfd][..]),
        ("frame.zip", &b"PK\x03\x04"[..]),
        ("frame.tar.gz", &[0x1f, 0x8b][..]),
        ("frame.tgz", &[0x1f, 0x8b][..]),
        ("frame.tar.bz2", &b"BZh"[..]),
        ("frame.tar", &b""[..]),
    ];

    for (name, magic) in cases {
        let path = temp_dir.path().join(name);
        persist(&frame, path.as_path(), &PersistOptions::default()).unwrap();
        assert!(fs::read(&path).unwrap().starts_with(magic), "{name}");

        let restored = restore(path.as_path(), &RestoreOptions::default()).unwrap();
        assert_eq!(restored, frame, "{name}");
    }
}

#[test]
fn test_explicit_compression_overrides_suffix() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("frame.bin");
    let value = Value::list(vec![Value::str("a"); 200]);

    persist(
        &value,
        path.as_path(),
        &PersistOptions::new().with_compression(Compression::Xz),
    )
    .unwrap();

    let err = restore(path.as_path(), &RestoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptArchive);

    let restored = restore(
        path.as_path(),
        &RestoreOptions::new().with_compression(Compression::Xz),
    )
    .unwrap();
    assert_eq!(restored, value);
}

#[test]
fn test_concurrent_restores_are_deterministic() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("shared.pkl.gz");
    let frame = sample_frame();
    persist(&frame, path.as_path(), &PersistOptions::default()).unwrap();
    let expected = to_json(&frame);

    let renderings: Vec<serde_json::Value> = (0..32)
        .into_par_iter()
        .map(|_| to_json(&restore(path.as_path(), &RestoreOptions::default()).unwrap()))
        .collect();
    assert!(renderings.iter().all(|rendering| *rendering == expected));
}

#[test]
fn test_concurrent_persists_produce_identical_archives() {
    let temp_dir = TempDir::new().unwrap();
    let engine = create_default_engine();

    let archives: Vec<Vec<u8>> = (0..16)
        .into_par_iter()
        .map(|i| {
            let path = temp_dir.path().join(format!("frame_{i}.pkl.zst"));
            engine
                .persist(&sample_frame(), path.as_path(), &PersistOptions::default())
                .unwrap();
            fs::read(path).unwrap()
        })
        .collect();
    assert!(archives.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn test_legacy_sparse_series_is_densified() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::new()
        .new_object("tabular.sparse.series", "SparseSeries")
        .op(EMPTY_DICT)
        .op(MARK)
        .text("sp_values")
        .op(EMPTY_LIST)
        .op(MARK)
        .float(1.5)
        .float(2.5)
        .op(APPENDS)
        .text("sp_index")
        .op(EMPTY_LIST)
        .op(MARK)
        .int(0)
        .int(3)
        .op(APPENDS)
        .text("length")
        .int(4)
        .text("fill_value")
        .int(0)
        .text("name")
        .text("x")
        .op(SETITEMS)
        .op(BUILD)
        .finish();
    let path = write_archive(temp_dir.path(), "sparse.pkl", archive);

    let restored = restore(path.as_path(), &RestoreOptions::default()).unwrap();
    assert_eq!(restored.class(), Some(symbol("tabular.core.series", "Series")));
    let state = object_state(&restored);
    assert_eq!(state.get("name"), Some(Value::str("x")));
    assert_eq!(state.get("index"), Some(Value::None));
    assert_eq!(
        state.get("values").unwrap().items().unwrap(),
        vec![Value::Float(1.5), Value::Int(0), Value::Int(0), Value::Float(2.5)]
    );
}

#[test]
fn test_legacy_categorical_attributes_are_renamed() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::new()
        .new_object("tabular.core.categorical", "Categorical")
        .op(EMPTY_DICT)
        .op(MARK)
        .text("labels")
        .op(EMPTY_LIST)
        .op(MARK)
        .int(0)
        .int(1)
        .int(0)
        .op(APPENDS)
        .text("_levels")
        .op(EMPTY_LIST)
        .op(MARK)
        .text("low")
        .text("high")
        .op(APPENDS)
        .text("ordered")
        .op(NONE)
        .op(SETITEMS)
        .op(BUILD)
        .finish();
    let path = write_archive(temp_dir.path(), "categorical.pkl", archive);

    let restored = restore(path.as_path(), &RestoreOptions::default()).unwrap();
    assert_eq!(restored.class(), Some(symbol("tabular.core.arrays", "Categorical")));
    let state = object_state(&restored);
    assert!(state.get("labels").is_none());
    assert!(state.get("_levels").is_none());
    assert_eq!(
        state.get("_categories").unwrap().items().unwrap(),
        vec![Value::str("low"), Value::str("high")]
    );
    assert_eq!(state.get("_codes").unwrap().items().unwrap().len(), 3);
    assert_eq!(state.get("ordered"), Some(Value::None));
}

#[test]
fn test_legacy_time_series_redirects() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::new()
        .new_object("tabular.core.series", "TimeSeries")
        .op(EMPTY_DICT)
        .op(MARK)
        .text("name")
        .legacy_text(b"close")
        .op(SETITEMS)
        .op(BUILD)
        .finish();
    let path = write_archive(temp_dir.path(), "timeseries.pkl", archive);

    let restored = restore(path.as_path(), &RestoreOptions::default()).unwrap();
    assert_eq!(restored.class(), Some(symbol("tabular.core.series", "Series")));
    assert_eq!(object_state(&restored).get("name"), Some(Value::str("close")));
}

#[test]
fn test_unknown_symbol_is_not_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::new().new_object("tabular.core.panel", "Panel").finish();
    let path = write_archive(temp_dir.path(), "panel.pkl", archive);

    let err = restore(path.as_path(), &RestoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnresolvableSymbol);
    match err {
        PersistError::UnresolvableSymbol { reference, attempts } => {
            assert_eq!(reference, symbol("tabular.core.panel", "Panel"));
            assert_eq!(attempts, vec!["ascii", "utf-8", "latin-1"]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let good = temp_dir.path().join("good.pkl");
    persist(&sample_frame(), good.as_path(), &PersistOptions::default()).unwrap();
    let mut bytes = fs::read(&good).unwrap();
    bytes.truncate(bytes.len() / 2);
    let truncated = write_archive(temp_dir.path(), "truncated.pkl", bytes);

    let err = restore(truncated.as_path(), &RestoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptArchive);
}

#[test]
fn test_archive_from_a_newer_writer() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_archive(temp_dir.path(), "future.pkl", vec![0x80, 6, NONE, b'.']);

    let err = restore(path.as_path(), &RestoreOptions::default()).unwrap_err();
    assert!(matches!(err, PersistError::UnsupportedArchive { found: 6, .. }));
    assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
}

#[test]
fn test_fallback_ladder_order() {
    let temp_dir = TempDir::new().unwrap();
    let utf8 = write_archive(
        temp_dir.path(),
        "utf8.pkl",
        Archive::new().legacy_text("café".as_bytes()).finish(),
    );
    let latin1 = write_archive(
        temp_dir.path(),
        "latin1.pkl",
        Archive::new().legacy_text(&[b'd', 0xe9, 0xff]).finish(),
    );

    assert_eq!(
        restore(utf8.as_path(), &RestoreOptions::default()).unwrap(),
        Value::str("café")
    );
    assert_eq!(
        restore(latin1.as_path(), &RestoreOptions::default()).unwrap(),
        Value::str("dé\u{ff}")
    );

    let err = restore(
        latin1.as_path(),
        &RestoreOptions::new().with_decodings([StringDecoding::Ascii, StringDecoding::Utf8]),
    )
    .unwrap_err();
    assert!(matches!(&err, PersistError::StringDecode { encoding, .. } if encoding == "utf-8"));

    let raw = restore(
        latin1.as_path(),
        &RestoreOptions::new().with_decodings([StringDecoding::Bytes]),
    )
    .unwrap();
    assert_eq!(raw, Value::Bytes(vec![b'd', 0xe9, 0xff]));
}

#[test]
fn test_failed_persist_leaves_previous_archive() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("frame.pkl.gz");
    persist(&Value::Int(1), path.as_path(), &PersistOptions::default()).unwrap();
    let before = fs::read(&path).unwrap();

    let broken = Value::object(Object::new(symbol("tabular.core.frame", "DataFrame")));
    if let Value::Object(cell) = &broken {
        cell.borrow_mut().args = vec![broken.clone()];
    }
    let err = persist(&broken, path.as_path(), &PersistOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Serialization);
    assert_eq!(fs::read(&path).unwrap(), before);

    let fresh = temp_dir.path().join("never.pkl");
    assert!(persist(&broken, fresh.as_path(), &PersistOptions::default()).is_err());
    assert!(!fresh.exists());
    assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
}

#[test]
fn test_missing_source_is_stream_acquisition() {
    let temp_dir = TempDir::new().unwrap();
    let err = restore(
        temp_dir.path().join("absent.pkl").as_path(),
        &RestoreOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamAcquisition);
}

#[test]
fn test_zip_with_several_members_is_rejected() {
    use std::io::Write;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("two.zip");
    {
        let file = fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        zip.start_file("a.pkl", options).unwrap();
        zip.write_all(&Archive::new().op(NONE).finish()).unwrap();
        zip.start_file("b.pkl", options).unwrap();
        zip.write_all(&Archive::new().op(NONE).finish()).unwrap();
        zip.finish().unwrap();
    }

    let err = restore(path.as_path(), &RestoreOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptArchive);
    assert!(err.to_string().contains("Multiple files"));
}
