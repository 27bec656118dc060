//! Versioned binary snapshot of the media-cache index.
//!
//! Layout: a 4-byte little-endian format version followed by an array of
//! fixed-shape records, read until end of file. Variable-length fields are
//! length-prefixed. Version 1 is the only defined version; anything else is
//! fatal, as is any structural defect — the snapshot is trusted local state
//! and corruption must surface immediately.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::cache::record::MediaRecord;
use crate::domain::Md5Hash;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated snapshot while reading {0}")]
    Truncated(&'static str),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
}

pub fn encode<'a>(records: impl IntoIterator<Item = &'a MediaRecord>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    for record in records {
        encode_record(&mut buf, record);
    }
    buf
}

fn encode_record(buf: &mut Vec<u8>, record: &MediaRecord) {
    buf.extend_from_slice(&record.size.to_le_bytes());
    buf.extend_from_slice(record.hash.as_bytes());
    put_bytes(buf, record.ext.as_bytes());
    put_string_set(buf, &record.boards);
    put_string_set(buf, &record.tags);
    put_string_set(buf, &record.filenames);
    put_string_set(buf, &record.posters);
    buf.extend_from_slice(&(record.dates.len() as u32).to_le_bytes());
    for date in &record.dates {
        buf.extend_from_slice(&date.to_le_bytes());
    }
    buf.extend_from_slice(&record.spoiler_count.to_le_bytes());
    buf.extend_from_slice(&record.deleted_count.to_le_bytes());
    buf.push(record.has_thumb as u8);
    buf.push(record.has_image as u8);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn put_string_set(buf: &mut Vec<u8>, set: &BTreeSet<String>) {
    buf.extend_from_slice(&(set.len() as u32).to_le_bytes());
    for item in set {
        put_bytes(buf, item.as_bytes());
    }
}

pub fn decode(bytes: &[u8]) -> Result<Vec<MediaRecord>, SnapshotError> {
    let mut reader = Reader::new(bytes);
    let version = reader.u32("version")?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let mut records = Vec::new();
    while !reader.at_end() {
        records.push(decode_record(&mut reader)?);
    }
    Ok(records)
}

fn decode_record(r: &mut Reader<'_>) -> Result<MediaRecord, SnapshotError> {
    let size = r.u64("size")?;
    let hash = Md5Hash::from_bytes(
        r.take(16, "md5")?
            .try_into()
            .expect("take(16) returned 16 bytes"),
    );
    let ext = r.string("ext")?;
    let boards = r.string_set("boards")?;
    let tags = r.string_set("tags")?;
    let filenames = r.string_set("filenames")?;
    let posters = r.string_set("posters")?;

    let date_count = r.u32("date count")?;
    let mut dates = BTreeSet::new();
    for _ in 0..date_count {
        dates.insert(r.i64("date")?);
    }

    let spoiler_count = r.u16("spoiler count")?;
    let deleted_count = r.u16("deleted count")?;
    let has_thumb = r.flag("has_thumb")?;
    let has_image = r.flag("has_image")?;

    Ok(MediaRecord {
        hash,
        size,
        ext,
        boards,
        tags,
        filenames,
        posters,
        dates,
        spoiler_count,
        deleted_count,
        has_thumb,
        has_image,
    })
}

/// Load a snapshot file if it exists. `Ok(None)` means no file; any defect
/// in an existing file is an error.
pub fn load(path: &Path) -> Result<Option<Vec<MediaRecord>>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes).map(Some)
}

/// Write a snapshot atomically: write to a sibling temp file, move any
/// existing snapshot aside as a backup, then rename the new file into place.
pub fn write_atomic<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a MediaRecord>,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("snap.new");
    fs::write(&tmp, encode(records))?;
    if path.exists() {
        fs::rename(path, path.with_extension("snap.bak"))?;
    }
    fs::rename(&tmp, path)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SnapshotError> {
        if self.buf.len() - self.pos < n {
            return Err(SnapshotError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SnapshotError> {
        Ok(u16::from_le_bytes(self.take(2, what)?.try_into().unwrap()))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, SnapshotError> {
        Ok(u32::from_le_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, SnapshotError> {
        Ok(u64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, SnapshotError> {
        Ok(i64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    fn flag(&mut self, what: &'static str) -> Result<bool, SnapshotError> {
        match self.take(1, what)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SnapshotError::Malformed(format!(
                "{what} flag byte is {other}, expected 0 or 1"
            ))),
        }
    }

    fn string(&mut self, what: &'static str) -> Result<String, SnapshotError> {
        let len = self.u16(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SnapshotError::Malformed(format!("{what} is not valid UTF-8")))
    }

    fn string_set(&mut self, what: &'static str) -> Result<BTreeSet<String>, SnapshotError> {
        let count = self.u32(what)?;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(self.string(what)?);
        }
        Ok(set)
    }
}
