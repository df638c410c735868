/*!
Compression envelopes around archive bytes.

Byte-stream codecs (gzip, bz2, xz, zstd) wrap the destination directly.
Container formats (zip, tar) hold the archive as their single member; the
member is spooled to a temporary file while writing, since both formats need
its size before the payload.
*/

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::GzBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{PersistError, Result};

/// Member name used when the destination has no usable file name.
const DEFAULT_MEMBER: &str = "archive";

/// Suffixes that mark a tar container, with the stream codec around it.
const TAR_SUFFIXES: &[(&str, Compression)] = &[
    (".tar.gz", Compression::Gzip),
    (".tgz", Compression::Gzip),
    (".tar.bz2", Compression::Bz2),
    (".tar.xz", Compression::Xz),
    (".tar", Compression::None),
];

const STREAM_SUFFIXES: &[(&str, Compression)] = &[
    (".gz", Compression::Gzip),
    (".bz2", Compression::Bz2),
    (".zip", Compression::Zip),
    (".xz", Compression::Xz),
    (".zst", Compression::Zstd),
];

/// A compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bz2,
    Zip,
    Xz,
    Zstd,
    Tar,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bz2 => "bz2",
            Self::Zip => "zip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Tar => "tar",
        }
    }

    /// Choose a method from a path suffix. Unrecognized suffixes mean no compression.
    pub fn infer_from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if TAR_SUFFIXES.iter().any(|(suffix, _)| lower.ends_with(suffix)) {
            return Self::Tar;
        }
        STREAM_SUFFIXES
            .iter()
            .find(|(suffix, _)| lower.ends_with(suffix))
            .map(|(_, method)| *method)
            .unwrap_or(Self::None)
    }

    fn default_level(&self) -> u32 {
        match self {
            Self::Bz2 => 9,
            Self::Zstd => 3,
            _ => 6,
        }
    }

    fn check_level(&self, level: u32) -> Result<u32> {
        let range = match self {
            Self::Gzip | Self::Xz | Self::Zip | Self::Tar => 0..=9,
            Self::Bz2 => 1..=9,
            Self::Zstd => 1..=22,
            Self::None => return Ok(level),
        };
        if range.contains(&level) {
            Ok(level)
        } else {
            Err(PersistError::stream(
                format!("{} compression", self.name()),
                format!("level {level} outside {}..={}", range.start(), range.end()),
            ))
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "bz2" | "bzip2" => Ok(Self::Bz2),
            "zip" => Ok(Self::Zip),
            "xz" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            "tar" => Ok(Self::Tar),
            _ => Err(PersistError::stream(
                format!("compression '{s}'"),
                "unrecognized compression type (expected infer, none, gzip, bz2, zip, xz, zstd or tar)",
            )),
        }
    }
}

/// Either an explicit method or inference from the destination's suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionSpec {
    #[default]
    Infer,
    Explicit(Compression),
}

impl CompressionSpec {
    /// The method to use for `path`; streams (no path) are never inferred.
    pub fn resolve(&self, path: Option<&str>) -> Compression {
        match self {
            Self::Explicit(method) => *method,
            Self::Infer => path.map(Compression::infer_from_path).unwrap_or(Compression::None),
        }
    }
}

impl From<Compression> for CompressionSpec {
    fn from(method: Compression) -> Self {
        Self::Explicit(method)
    }
}

impl FromStr for CompressionSpec {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("infer") {
            Ok(Self::Infer)
        } else {
            s.parse().map(Self::Explicit)
        }
    }
}

impl TryFrom<String> for CompressionSpec {
    type Error = PersistError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CompressionSpec> for String {
    fn from(spec: CompressionSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for CompressionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infer => f.write_str("infer"),
            Self::Explicit(method) => method.fmt(f),
        }
    }
}

/// Name of the single member a zip or tar container holds for `path`.
pub fn member_name(path: Option<&str>) -> String {
    let Some(file_name) = path.and_then(|p| p.rsplit(|c| c == '/' || c == '\\').next()) else {
        return DEFAULT_MEMBER.to_string();
    };
    let lower = file_name.to_ascii_lowercase();
    let stem = TAR_SUFFIXES
        .iter()
        .map(|(suffix, _)| *suffix)
        .chain([".zip"])
        .find(|suffix| lower.ends_with(suffix))
        .map(|suffix| &file_name[..file_name.len() - suffix.len()])
        .unwrap_or(file_name);
    if stem.is_empty() {
        DEFAULT_MEMBER.to_string()
    } else {
        stem.to_string()
    }
}

/// Stream codec wrapping a tar container, chosen from the destination suffix.
fn tar_codec_for(path: Option<&str>) -> Compression {
    let lower = path.unwrap_or_default().to_ascii_lowercase();
    TAR_SUFFIXES
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix))
        .map(|(_, codec)| *codec)
        .unwrap_or(Compression::None)
}

/// Compressing writer over a sink. Call [`Encoder::finish`] to write trailers
/// and get the sink back; dropping it unfinished abandons the envelope.
pub(crate) enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Bz2(BzEncoder<W>),
    Xz(XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Container {
        kind: Container,
        member: String,
        spool: File,
        sink: W,
        level: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Container {
    Zip,
    /// A tar container inside a stream codec.
    Tar(Compression),
}

impl<W: Write> Encoder<W> {
    /// Wrap `sink` for `method`. `path` names the destination, if any, for
    /// member naming and tar codec selection.
    pub(crate) fn new(
        sink: W,
        method: Compression,
        level: Option<u32>,
        path: Option<&str>,
    ) -> Result<Self> {
        let level = method.check_level(level.unwrap_or_else(|| method.default_level()))?;
        let encoder = match method {
            Compression::None => Self::Plain(sink),
            Compression::Gzip => {
                Self::Gzip(GzBuilder::new().mtime(0).write(sink, flate2::Compression::new(level)))
            }
            Compression::Bz2 => Self::Bz2(BzEncoder::new(sink, bzip2::Compression::new(level))),
            Compression::Xz => Self::Xz(XzEncoder::new(sink, level)),
            Compression::Zstd => Self::Zstd(
                zstd::stream::write::Encoder::new(sink, level as i32)
                    .map_err(|e| PersistError::compression(format!("Failed to start zstd stream: {e}")))?,
            ),
            Compression::Zip | Compression::Tar => Self::Container {
                kind: if method == Compression::Zip {
                    Container::Zip
                } else {
                    Container::Tar(tar_codec_for(path))
                },
                member: member_name(path),
                spool: tempfile::tempfile()?,
                sink,
                level,
            },
        };
        Ok(encoder)
    }

    /// Write any trailer and return the sink.
    pub(crate) fn finish(self) -> Result<W> {
        let finished = match self {
            Self::Plain(sink) => Ok(sink),
            Self::Gzip(encoder) => encoder.finish(),
            Self::Bz2(encoder) => encoder.finish(),
            Self::Xz(encoder) => encoder.finish(),
            Self::Zstd(encoder) => encoder.finish(),
            Self::Container {
                kind,
                member,
                mut spool,
                sink,
                level,
            } => {
                spool.seek(SeekFrom::Start(0))?;
                return match kind {
                    Container::Zip => write_zip(spool, &member, sink, level),
                    Container::Tar(codec) => write_tar(spool, &member, sink, codec, level),
                };
            }
        };
        finished.map_err(|e| PersistError::compression(format!("Failed to finish compression: {e}")))
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Bz2(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
            Self::Container { spool, .. } => spool.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Bz2(w) => w.flush(),
            Self::Xz(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
            Self::Container { spool, .. } => spool.flush(),
        }
    }
}

fn write_zip<W: Write>(mut member_data: File, member: &str, mut sink: W, level: u32) -> Result<W> {
    let zip_error = |e: zip::result::ZipError| PersistError::compression(format!("Failed to write zip: {e}"));

    let mut zip = ZipWriter::new(tempfile::tempfile()?);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level as i32))
        .unix_permissions(0o644)
        .large_file(member_data.metadata()?.len() >= u64::from(u32::MAX));
    zip.start_file(member, options).map_err(zip_error)?;
    io::copy(&mut member_data, &mut zip)?;
    let mut container = zip.finish().map_err(zip_error)?;

    container.seek(SeekFrom::Start(0))?;
    io::copy(&mut container, &mut sink)?;
    Ok(sink)
}

fn write_tar<W: Write>(
    mut member_data: File,
    member: &str,
    sink: W,
    codec: Compression,
    level: u32,
) -> Result<W> {
    let size = member_data.metadata()?.len();
    let outer = Encoder::new(sink, codec, Some(level.max(1)), None)?;

    let mut header = tar::Header::new_gnu();
    header
        .set_path(member)
        .map_err(|e| PersistError::compression(format!("Invalid tar member name '{member}': {e}")))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();

    let mut builder = tar::Builder::new(outer);
    builder.append(&header, &mut member_data)?;
    let outer = builder
        .into_inner()
        .map_err(|e| PersistError::compression(format!("Failed to finish tar: {e}")))?;
    outer.finish()
}

/// Wrap `source` in the decoder for `method`.
///
/// Stream codecs decode lazily. Containers are read eagerly so the single
/// member can be checked before any byte is handed out.
pub(crate) fn decoder<'r>(
    source: Box<dyn Read + 'r>,
    method: Compression,
) -> Result<Box<dyn Read + 'r>> {
    let reader: Box<dyn Read + 'r> = match method {
        Compression::None => source,
        Compression::Gzip => Box::new(MultiGzDecoder::new(source)),
        Compression::Bz2 => Box::new(MultiBzDecoder::new(source)),
        Compression::Xz => Box::new(XzDecoder::new_multi_decoder(source)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(source)
                .map_err(|e| PersistError::compression(format!("Failed to start zstd stream: {e}")))?,
        ),
        Compression::Zip => Box::new(Cursor::new(read_zip_member(source)?)),
        Compression::Tar => Box::new(Cursor::new(read_tar_member(source)?)),
    };
    Ok(reader)
}

fn read_zip_member(mut source: Box<dyn Read + '_>) -> Result<Vec<u8>> {
    let zip_error = |e: zip::result::ZipError| PersistError::compression(format!("Invalid zip archive: {e}"));

    let mut raw = Vec::new();
    source.read_to_end(&mut raw)?;
    let mut archive = ZipArchive::new(Cursor::new(raw)).map_err(zip_error)?;

    let mut files = Vec::new();
    for index in 0..archive.len() {
        if !archive.by_index(index).map_err(zip_error)?.is_dir() {
            files.push(index);
        }
    }
    let index = single_member(&files, "zip")?;

    let mut member = archive.by_index(index).map_err(zip_error)?;
    let mut data = Vec::new();
    member
        .read_to_end(&mut data)
        .map_err(|e| PersistError::compression(format!("Failed to read zip member: {e}")))?;
    Ok(data)
}

fn read_tar_member(source: Box<dyn Read + '_>) -> Result<Vec<u8>> {
    let tar_error = |e: io::Error| PersistError::compression(format!("Invalid tar archive: {e}"));

    let mut buffered = BufReader::new(source);
    let codec = sniff(buffered.fill_buf()?);
    let inner = decoder(Box::new(buffered), codec)?;

    let mut archive = tar::Archive::new(inner);
    let mut member = None;
    let mut count = 0;
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        count += 1;
        if count > 1 {
            break;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(tar_error)?;
        member = Some(data);
    }
    match (member, count) {
        (Some(data), 1) => Ok(data),
        _ => Err(container_error("tar", count)),
    }
}

fn single_member(files: &[usize], format: &str) -> Result<usize> {
    match files {
        [only] => Ok(*only),
        _ => Err(container_error(format, files.len())),
    }
}

fn container_error(format: &str, count: usize) -> PersistError {
    if count == 0 {
        PersistError::compression(format!("No files found in {format} archive"))
    } else {
        PersistError::compression(format!(
            "Multiple files found in {format} archive; exactly one is required"
        ))
    }
}

/// Identify the stream codec around a tar container from its magic bytes.
fn sniff(head: &[u8]) -> Compression {
    if head.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if head.starts_with(b"BZh") {
        Compression::Bz2
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Compression::Xz
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    }
}
