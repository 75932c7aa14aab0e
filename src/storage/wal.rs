//! Per-region write-ahead log.
//!
//! Frame layout: `len:u32 | seq:u64 | timestamp_ms:u64 | payload | crc32c:u32`,
//! where `len` counts everything after itself and the checksum covers the
//! length prefix through the payload.

use crate::error::RegionServerError;
use crate::storage::RowEdit;
use crc32c::crc32c;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;
const FRAME_OVERHEAD: usize = 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead {
    Frame(WalFrame),
    End,
    /// Tail of a frame that never finished writing.
    Truncated,
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(&mut self, seq: u64, timestamp_ms: u64, payload: &[u8]) -> io::Result<()> {
        let body_len = FRAME_OVERHEAD + payload.len();
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "wal frame exceeds maximum size",
            ));
        }
        let len_bytes = (body_len as u32).to_be_bytes();
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&len_bytes);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&timestamp_ms.to_be_bytes());
        buf.extend_from_slice(payload);
        let crc = crc32c(&buf).to_be_bytes();
        buf.extend_from_slice(&crc);
        self.inner.write_all(&buf)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<FrameRead, RegionServerError> {
        let mut len_buf = [0u8; 4];
        if self.inner.read(&mut len_buf[0..1])? == 0 {
            return Ok(FrameRead::End);
        }
        if !read_fully(&mut self.inner, &mut len_buf[1..4])? {
            return Ok(FrameRead::Truncated);
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(RegionServerError::Corruption(format!(
                "wal frame length {body_len} out of range"
            )));
        }
        let mut body = vec![0u8; body_len];
        if !read_fully(&mut self.inner, &mut body)? {
            return Ok(FrameRead::Truncated);
        }
        let crc_offset = body_len - 4;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&body[crc_offset..]);
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if crc32c(&crc_input) != u32::from_be_bytes(stored) {
            return Err(RegionServerError::Corruption("wal frame checksum".into()));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&body[0..8]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&body[8..16]);
        Ok(FrameRead::Frame(WalFrame {
            seq: u64::from_be_bytes(seq),
            timestamp_ms: u64::from_be_bytes(ts),
            payload: body[16..crc_offset].to_vec(),
        }))
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, RegionServerError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Append-only log of row edits for one region.
pub struct RegionWal {
    path: PathBuf,
    writer: FrameWriter<File>,
    sync_on_append: bool,
}

impl RegionWal {
    pub fn open(path: &Path, sync_on_append: bool) -> Result<Self, RegionServerError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: FrameWriter::new(file),
            sync_on_append,
        })
    }

    pub fn append(
        &mut self,
        seq: u64,
        timestamp_ms: u64,
        edit: &RowEdit,
    ) -> Result<(), RegionServerError> {
        let payload =
            rmp_serde::to_vec(edit).map_err(|e| RegionServerError::Encode(e.to_string()))?;
        self.writer.append(seq, timestamp_ms, &payload)?;
        self.writer.flush()?;
        if self.sync_on_append {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), RegionServerError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Drops every logged edit; called once they are all in store files.
    pub fn reset(&mut self) -> Result<(), RegionServerError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = FrameWriter::new(file);
        Ok(())
    }
}

/// Reads every complete edit in the log. A torn final frame is ignored; a
/// checksum mismatch is reported as corruption.
pub fn replay(path: &Path) -> Result<Vec<(u64, RowEdit)>, RegionServerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = FrameReader::new(BufReader::new(file));
    let mut edits = Vec::new();
    loop {
        match reader.next_frame()? {
            FrameRead::Frame(frame) => {
                let edit: RowEdit = rmp_serde::from_slice(&frame.payload)
                    .map_err(|e| RegionServerError::Decode(e.to_string()))?;
                edits.push((frame.seq, edit));
            }
            FrameRead::End => break,
            FrameRead::Truncated => {
                tracing::warn!(path = %path.display(), "ignoring torn wal tail");
                break;
            }
        }
    }
    Ok(edits)
}
