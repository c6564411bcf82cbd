//! File-based storage implementation for Raft persistent state
//!
//! Stores state in three files within a directory:
//! - `term` - current term with checksum
//! - `voted_for` - vote record with checksum
//! - `log` - log entries (JSON lines, one checksum per line)
//!
//! Checksums detect corruption from partial writes; every save fsyncs
//! before returning, and log truncation rewrites through a temp file plus
//! rename so a crash never leaves a half-truncated log behind.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{Storage, StorageError};
use crate::core::raft_core::LogEntry;

/// CRC32 checksum (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a FileStorage rooted at the given directory, creating it if
    /// it does not exist
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(FileStorage { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join("term")
    }

    fn voted_for_path(&self) -> PathBuf {
        self.dir.join("voted_for")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// Write "{data} {crc32_hex}\n" and fsync
    fn write_with_checksum(&self, path: &Path, data: &str) -> Result<(), StorageError> {
        let checksum = crc32(data.as_bytes());
        let content = format!("{} {:08x}\n", data, checksum);

        let mut file = File::create(path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(content.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    /// Read and verify a checksummed record, returning the data portion
    fn read_with_checksum(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        let (data, stored) = split_checksum(content).ok_or_else(|| {
            StorageError::Corruption(format!("invalid format in {:?}: missing checksum", path))
        })?;

        let computed = crc32(data.as_bytes());
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
                path, stored, computed
            )));
        }

        Ok(Some(data.to_string()))
    }

    /// Write to a temp file, fsync, then rename over the target
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        fs::rename(&temp_path, path).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

/// Split "{data} {checksum_hex}" into its parts
fn split_checksum(line: &str) -> Option<(&str, u32)> {
    let (data, checksum_str) = line.rsplit_once(' ')?;
    let checksum = u32::from_str_radix(checksum_str, 16).ok()?;
    Some((data, checksum))
}

impl Storage for FileStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        match self.read_with_checksum(&self.term_path())? {
            None => Ok(0),
            Some(data) => data
                .parse()
                .map_err(|e| StorageError::Corruption(format!("invalid term: {}", e))),
        }
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.write_with_checksum(&self.term_path(), &term.to_string())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        match self.read_with_checksum(&self.voted_for_path())? {
            None => Ok(None),
            Some(data) if data == "none" => Ok(None),
            Some(data) => {
                let id = data
                    .parse()
                    .map_err(|e| StorageError::Corruption(format!("invalid voted_for: {}", e)))?;
                Ok(Some(id))
            }
        }
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        let data = match voted_for {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        self.write_with_checksum(&self.voted_for_path(), &data)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StorageError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }

            let (json, stored) = split_checksum(&line).ok_or_else(|| {
                StorageError::Corruption(format!(
                    "invalid log format at line {}: missing checksum",
                    line_num + 1
                ))
            })?;

            let computed = crc32(json.as_bytes());
            if stored != computed {
                return Err(StorageError::Corruption(format!(
                    "checksum mismatch at line {}: stored {:08x}, computed {:08x}",
                    line_num + 1,
                    stored,
                    computed
                )));
            }

            let entry: LogEntry = serde_json::from_str(json).map_err(|e| {
                StorageError::Corruption(format!("invalid log entry at line {}: {}", line_num + 1, e))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            writeln!(file, "{} {:08x}", json, checksum)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        let keep: Vec<_> = entries
            .into_iter()
            .filter(|e| e.index < from_index)
            .collect();

        let mut content = Vec::new();
        for entry in &keep {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            content.extend_from_slice(format!("{} {:08x}\n", json, checksum).as_bytes());
        }

        self.atomic_write(&self.log_path(), &content)
    }
}
