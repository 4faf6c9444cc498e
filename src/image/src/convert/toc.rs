//! Tar layout scanning and framed re-compression shared by the seekable
//! layer formats.
//!
//! A seekable layer is the original tar split into independently
//! compressed frames (gzip members or zstd frames) plus a table of contents
//! locating every file. Concatenated, the frames decompress back to the
//! tar stream.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::Digester;

const BLOCK: u64 = 512;

/// One tar entry and where its bytes sit in the uncompressed stream.
#[derive(Debug, Clone)]
pub(crate) struct TarEntry {
    pub name: String,
    pub toc_type: Option<&'static str>,
    pub link_name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub user_name: String,
    pub group_name: String,
    pub mod_time: Option<DateTime<Utc>>,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub xattrs: BTreeMap<String, String>,
    /// First byte of the entry, extension headers included.
    pub start: u64,
    /// First byte of the file data.
    pub data_offset: u64,
    pub size: u64,
    /// One past the padded file data.
    pub end: u64,
}

/// Entries of a tar stream plus the end-of-archive trailer.
#[derive(Debug, Clone)]
pub(crate) struct TarLayout {
    pub entries: Vec<TarEntry>,
    pub trailer_start: u64,
    pub len: u64,
}

/// Scan the tar held in `file`. Each entry starts where the previous one
/// ended so PAX and GNU long-name headers stay with their entry.
pub(crate) fn scan(file: &mut File) -> io::Result<TarLayout> {
    file.seek(SeekFrom::Start(0))?;
    let len = file.metadata()?.len();
    let mut archive = tar::Archive::new(BufReader::new(&mut *file));
    let mut entries = Vec::new();
    let mut prev_end = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let size = entry.size();
        let data_offset = entry.raw_file_position();
        let end = data_offset + padded(size);

        let mut xattrs = BTreeMap::new();
        if let Some(exts) = entry.pax_extensions()? {
            for ext in exts {
                let ext = ext?;
                if let Some(name) = ext.key().ok().and_then(|k| k.strip_prefix("SCHILY.xattr.")) {
                    xattrs.insert(
                        name.to_string(),
                        base64::engine::general_purpose::STANDARD.encode(ext.value_bytes()),
                    );
                }
            }
        }

        let header = entry.header();
        let toc_type = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => Some("reg"),
            tar::EntryType::Directory => Some("dir"),
            tar::EntryType::Symlink => Some("symlink"),
            tar::EntryType::Link => Some("hardlink"),
            tar::EntryType::Char => Some("char"),
            tar::EntryType::Block => Some("block"),
            tar::EntryType::Fifo => Some("fifo"),
            _ => None,
        };
        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);
        let user_name = header.username().ok().flatten().unwrap_or_default().to_string();
        let group_name = header.groupname().ok().flatten().unwrap_or_default().to_string();
        let mod_time = header
            .mtime()
            .ok()
            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single());
        let dev_major = header.device_major().ok().flatten().unwrap_or(0);
        let dev_minor = header.device_minor().ok().flatten().unwrap_or(0);
        let name = clean_name(&entry.path()?.to_string_lossy());
        let link_name = entry
            .link_name()?
            .map(|l| l.to_string_lossy().into_owned())
            .unwrap_or_default();

        entries.push(TarEntry {
            name,
            toc_type,
            link_name,
            mode,
            uid,
            gid,
            user_name,
            group_name,
            mod_time,
            dev_major,
            dev_minor,
            xattrs,
            start: prev_end,
            data_offset,
            size,
            end,
        });
        prev_end = end;
    }
    Ok(TarLayout {
        entries,
        trailer_start: prev_end,
        len,
    })
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK) * BLOCK
}

fn clean_name(name: &str) -> String {
    let name = name.trim_start_matches("./").trim_start_matches('/');
    name.trim_end_matches('/').to_string()
}

/// A table-of-contents entry, shared by the eStargz and zstd:chunked
/// indexes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(rename = "modtime", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,
    #[serde(default, skip_serializing_if = "is_zero32")]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub uid: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gid: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(default, skip_serializing_if = "is_zero32")]
    pub dev_major: u32,
    #[serde(default, skip_serializing_if = "is_zero32")]
    pub dev_minor: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub inner_offset: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero32(v: &u32) -> bool {
    *v == 0
}

/// A table of contents document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toc {
    pub version: u32,
    pub entries: Vec<TocEntry>,
}

/// How frames are compressed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Codec {
    Gzip(u32),
    Zstd(i32),
}

impl Codec {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match *self {
            Codec::Gzip(level) => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
                encoder.write_all(data)?;
                encoder.finish()
            }
            Codec::Zstd(level) => zstd::stream::encode_all(data, level),
        }
    }
}

/// Where a piece of data landed: its frame and its offset inside the
/// decompressed frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub frame: usize,
    pub inner: u64,
}

/// Writes a sequence of independently compressed frames.
///
/// Data accumulates in the open frame until a split is requested and the
/// frame holds at least `min_frame` bytes.
pub(crate) struct FrameWriter<'w, W: Write> {
    out: &'w mut W,
    codec: Codec,
    min_frame: u64,
    buf: Vec<u8>,
    open: bool,
    written: u64,
    /// Compressed `(start, end)` of every closed frame.
    frames: Vec<(u64, u64)>,
    uncompressed: Digester,
}

impl<'w, W: Write> FrameWriter<'w, W> {
    pub fn new(out: &'w mut W, codec: Codec, min_frame: u64) -> Self {
        Self {
            out,
            codec,
            min_frame,
            buf: Vec::new(),
            open: false,
            written: 0,
            frames: Vec::new(),
            uncompressed: Digester::new(),
        }
    }

    /// Position the next write. With `split` a non-empty open frame that
    /// reached the minimum size is closed first.
    pub fn begin(&mut self, split: bool) -> io::Result<Slot> {
        if self.open && split && !self.buf.is_empty() && self.buf.len() as u64 >= self.min_frame {
            self.close()?;
        }
        if !self.open {
            self.open = true;
            self.buf.clear();
        }
        Ok(Slot {
            frame: self.frames.len(),
            inner: self.buf.len() as u64,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.open {
            self.begin(false)?;
        }
        self.buf.extend_from_slice(data);
        self.uncompressed.update(data);
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        let data = self.codec.compress(&self.buf)?;
        self.out.write_all(&data)?;
        let start = self.written;
        self.written += data.len() as u64;
        self.frames.push((start, self.written));
        self.buf.clear();
        self.open = false;
        Ok(())
    }

    /// Write bytes outside any frame, e.g. a footer.
    pub fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.close()?;
        self.out.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Compressed bytes written so far. Closes the open frame.
    pub fn position(&mut self) -> io::Result<u64> {
        self.close()?;
        Ok(self.written)
    }

    pub fn frame(&self, slot: Slot) -> (u64, u64) {
        self.frames.get(slot.frame).copied().unwrap_or((self.written, self.written))
    }

    /// Close the open frame and return `(diff ID, uncompressed size)`.
    pub fn finish(mut self) -> io::Result<(String, u64)> {
        self.close()?;
        Ok(self.uncompressed.finish())
    }
}

/// Copy `len` bytes at `start` of `file` into the open frame.
pub(crate) fn copy_range<W: Write>(
    file: &mut File,
    start: u64,
    len: u64,
    frames: &mut FrameWriter<'_, W>,
) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(start))?;
    let mut reader = (&mut *file).take(len);
    let mut buf = vec![0u8; 64 << 10];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        frames.write(&buf[..n])?;
    }
    Ok(())
}

/// Emit every entry of `layout` as frames and return its TOC entries.
///
/// Headers join the open frame. File data is cut into `chunk_size` chunks,
/// each starting a frame; the first chunk is described by the file's own
/// entry and the rest by `chunk` entries. The trailer is not written.
pub(crate) fn emit_entries<W: Write>(
    file: &mut File,
    layout: &TarLayout,
    frames: &mut FrameWriter<'_, W>,
    chunk_size: u64,
) -> io::Result<Vec<(TocEntry, Option<Slot>)>> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(layout.entries.len());
    for entry in &layout.entries {
        frames.begin(false)?;
        copy_range(file, entry.start, entry.data_offset - entry.start, frames)?;

        let base = TocEntry {
            name: entry.name.clone(),
            entry_type: entry.toc_type.unwrap_or_default().to_string(),
            size: entry.size,
            mod_time: entry.mod_time,
            link_name: entry.link_name.clone(),
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            user_name: entry.user_name.clone(),
            group_name: entry.group_name.clone(),
            dev_major: entry.dev_major,
            dev_minor: entry.dev_minor,
            xattrs: entry.xattrs.clone(),
            ..Default::default()
        };

        if entry.toc_type != Some("reg") || entry.size == 0 {
            copy_range(file, entry.data_offset, entry.end - entry.data_offset, frames)?;
            if entry.toc_type.is_some() {
                out.push((base, None));
            }
            continue;
        }

        let chunked = entry.size > chunk_size;
        let mut file_digest = Sha256::new();
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < entry.size {
            let len = chunk_size.min(entry.size - offset);
            let slot = frames.begin(true)?;
            let mut data = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(entry.data_offset + offset))?;
            file.read_exact(&mut data)?;
            file_digest.update(&data);
            frames.write(&data)?;
            chunks.push((offset, len, crate::digest::sha256_of(&data), slot));
            offset += len;
        }
        copy_range(file, entry.data_offset + entry.size, entry.end - entry.data_offset - entry.size, frames)?;

        let digest = format!("sha256:{}", hex::encode(file_digest.finalize()));
        for (i, (chunk_offset, len, chunk_digest, slot)) in chunks.into_iter().enumerate() {
            let toc = if i == 0 {
                TocEntry {
                    digest: digest.clone(),
                    chunk_size: if chunked { len } else { 0 },
                    chunk_digest,
                    ..base.clone()
                }
            } else {
                TocEntry {
                    name: entry.name.clone(),
                    entry_type: "chunk".to_string(),
                    chunk_offset,
                    chunk_size: len,
                    chunk_digest,
                    ..Default::default()
                }
            };
            out.push((toc, Some(slot)));
        }
    }
    Ok(out)
}

/// Fill in compressed offsets once every frame is closed.
pub(crate) fn resolve<W: Write>(
    pending: Vec<(TocEntry, Option<Slot>)>,
    frames: &FrameWriter<'_, W>,
    with_end: bool,
) -> Vec<TocEntry> {
    pending
        .into_iter()
        .map(|(mut entry, slot)| {
            if let Some(slot) = slot {
                let (start, end) = frames.frame(slot);
                entry.offset = start;
                entry.inner_offset = slot.inner;
                if with_end {
                    entry.end_offset = Some(end);
                }
            }
            entry
        })
        .collect()
}

/// Stage a decompressed stream in an anonymous temp file for scanning.
pub(crate) fn stage(reader: &mut dyn Read) -> io::Result<File> {
    let mut file = tempfile::tempfile()?;
    io::copy(reader, &mut file)?;
    file.flush()?;
    Ok(file)
}
