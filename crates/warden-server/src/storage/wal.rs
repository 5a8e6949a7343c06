//! Write-ahead log for durability.
//!
//! Every committed [`LogEntry`] is appended as one checksummed record.
//! Opening a log replays it; a torn or corrupt tail is cut off at the last
//! good record. Rollback and checkpoints rewrite the file wholesale through a
//! temporary file and a rename.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use warden_common::{Result, WardenError};

use super::Collection;
use crate::replication::{LogEntry, LogPosition};

// WAL format constants

/// WAL file name inside the data directory.
pub const WAL_FILE_NAME: &str = "warden.wal";

/// Maximum record payload size.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024; // 64MB

// WAL record types

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Invalid/padding record.
    Invalid = 0,
    /// A replicated log entry.
    Entry = 1,
    /// Full catalog image; replay restarts from it.
    Checkpoint = 7,
}

impl From<u8> for WalRecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => WalRecordType::Entry,
            7 => WalRecordType::Checkpoint,
            _ => WalRecordType::Invalid,
        }
    }
}

// WAL record header and payload

/// A WAL record header (25 bytes).
#[derive(Debug, Clone)]
pub struct WalRecordHeader {
    /// Term of the record's log position.
    pub term: u64,
    /// Index of the record's log position.
    pub index: u64,
    pub record_type: WalRecordType,
    /// Payload length.
    pub length: u32,
    /// CRC32 checksum of header fields + payload.
    pub checksum: u32,
}

impl WalRecordHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 25;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index.to_le_bytes());
        buf[16] = self.record_type as u8;
        buf[17..21].copy_from_slice(&self.length.to_le_bytes());
        buf[21..25].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            term: le_u64(&buf[0..8]),
            index: le_u64(&buf[8..16]),
            record_type: WalRecordType::from(buf[16]),
            length: le_u32(&buf[17..21]),
            checksum: le_u32(&buf[21..25]),
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.term, self.index)
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// A complete WAL record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn new(position: LogPosition, record_type: WalRecordType, payload: Vec<u8>) -> Self {
        let mut header = WalRecordHeader {
            term: position.term,
            index: position.index,
            record_type,
            length: payload.len() as u32,
            checksum: 0,
        };
        header.checksum = Self::compute_checksum(&header, &payload);
        Self { header, payload }
    }

    fn entry(entry: &LogEntry) -> Result<Self> {
        let payload = serde_json::to_vec(entry)?;
        Self::check_size(&payload)?;
        Ok(Self::new(entry.position, WalRecordType::Entry, payload))
    }

    fn checkpoint(image: &CheckpointImage) -> Result<Self> {
        let payload = serde_json::to_vec(image)?;
        Self::check_size(&payload)?;
        Ok(Self::new(image.position, WalRecordType::Checkpoint, payload))
    }

    fn check_size(payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(WardenError::Storage(format!(
                "WAL record too large: {} > {}",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        Ok(())
    }

    fn compute_checksum(header: &WalRecordHeader, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header.term.to_le_bytes());
        hasher.update(&header.index.to_le_bytes());
        hasher.update(&[header.record_type as u8]);
        hasher.update(&header.length.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn verify(&self) -> bool {
        Self::compute_checksum(&self.header, &self.payload) == self.header.checksum
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WalRecordHeader::SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Catalog image written by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointImage {
    /// Position of the last entry folded into the image.
    pub position: LogPosition,
    pub collections: BTreeMap<String, Collection>,
}

/// State recovered from an existing WAL.
#[derive(Debug, Default)]
pub struct Recovered {
    pub checkpoint: Option<CheckpointImage>,
    pub entries: Vec<LogEntry>,
    /// Bytes cut from a torn tail.
    pub truncated_bytes: u64,
}

// WAL Configuration

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub path: PathBuf,
    /// Whether to fsync after every append.
    pub sync_on_write: bool,
}

impl WalConfig {
    pub fn in_dir(dir: &Path, sync_on_write: bool) -> Self {
        Self {
            path: dir.join(WAL_FILE_NAME),
            sync_on_write,
        }
    }
}

// WAL Handle

/// Write-ahead log handle. Callers serialize access.
pub struct Wal {
    file: BufWriter<File>,
    config: WalConfig,
}

impl Wal {
    /// Open or create a WAL and replay its contents.
    pub fn open(config: WalConfig) -> Result<(Self, Recovered)> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WardenError::Storage(format!("Failed to create data dir: {e}")))?;
        }

        let recovered = Self::replay(&config.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .map_err(|e| WardenError::Storage(format!("Failed to open WAL: {e}")))?;

        Ok((
            Self {
                file: BufWriter::new(file),
                config,
            },
            recovered,
        ))
    }

    /// Read every intact record, truncating the file after the last one.
    fn replay(path: &Path) -> Result<Recovered> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Recovered::default()),
            Err(e) => return Err(WardenError::Storage(format!("Failed to open WAL: {e}"))),
        };
        let file_len = file
            .metadata()
            .map_err(|e| WardenError::Storage(format!("Failed to read metadata: {e}")))?
            .len();

        let mut reader = BufReader::new(file);
        let mut recovered = Recovered::default();
        let mut good_offset = 0u64;
        let mut header_buf = [0u8; WalRecordHeader::SIZE];

        loop {
            match reader.read_exact(&mut header_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WardenError::Storage(format!("Read error: {e}"))),
            }

            let header = WalRecordHeader::from_bytes(&header_buf);
            if header.record_type == WalRecordType::Invalid
                || header.length as usize > MAX_RECORD_SIZE
            {
                break;
            }

            let mut payload = vec![0u8; header.length as usize];
            match reader.read_exact(&mut payload) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WardenError::Storage(format!("Read payload error: {e}"))),
            }

            let record = WalRecord { header, payload };
            if !record.verify() {
                tracing::warn!(
                    position = %record.header.position(),
                    "WAL checksum mismatch, discarding tail"
                );
                break;
            }

            match record.header.record_type {
                WalRecordType::Entry => {
                    let entry: LogEntry = serde_json::from_slice(&record.payload)?;
                    recovered.entries.push(entry);
                }
                WalRecordType::Checkpoint => {
                    let image: CheckpointImage = serde_json::from_slice(&record.payload)?;
                    recovered.entries.clear();
                    recovered.checkpoint = Some(image);
                }
                WalRecordType::Invalid => break,
            }

            good_offset += (WalRecordHeader::SIZE + record.payload.len()) as u64;
        }

        if good_offset < file_len {
            recovered.truncated_bytes = file_len - good_offset;
            tracing::warn!(
                path = %path.display(),
                bytes = recovered.truncated_bytes,
                "Truncating torn WAL tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| WardenError::Storage(format!("Failed to open WAL: {e}")))?;
            file.set_len(good_offset)
                .map_err(|e| WardenError::Storage(format!("Failed to truncate WAL: {e}")))?;
        }

        Ok(recovered)
    }

    /// Append one entry.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let record = WalRecord::entry(entry)?;
        self.file
            .write_all(&record.to_bytes())
            .map_err(|e| WardenError::Storage(format!("Write failed: {e}")))?;
        if self.config.sync_on_write {
            self.sync()
        } else {
            self.flush()
        }
    }

    /// Replace the file with `checkpoint` followed by `entries`.
    pub fn rewrite(
        &mut self,
        checkpoint: Option<&CheckpointImage>,
        entries: &[LogEntry],
    ) -> Result<()> {
        self.flush()?;

        let tmp_path = self.config.path.with_extension("wal.tmp");
        {
            let tmp = File::create(&tmp_path)
                .map_err(|e| WardenError::Storage(format!("Failed to create WAL: {e}")))?;
            let mut writer = BufWriter::new(tmp);
            if let Some(image) = checkpoint {
                writer
                    .write_all(&WalRecord::checkpoint(image)?.to_bytes())
                    .map_err(|e| WardenError::Storage(format!("Write failed: {e}")))?;
            }
            for entry in entries {
                writer
                    .write_all(&WalRecord::entry(entry)?.to_bytes())
                    .map_err(|e| WardenError::Storage(format!("Write failed: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| WardenError::Storage(format!("Flush failed: {e}")))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| WardenError::Storage(format!("Sync failed: {e}")))?;
        }

        fs::rename(&tmp_path, &self.config.path)
            .map_err(|e| WardenError::Storage(format!("Failed to replace WAL: {e}")))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.config.path)
            .map_err(|e| WardenError::Storage(format!("Failed to open WAL: {e}")))?;
        self.file = BufWriter::new(file);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| WardenError::Storage(format!("Flush failed: {e}")))
    }

    /// Force sync to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|e| WardenError::Storage(format!("Sync failed: {e}")))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

// Tests
