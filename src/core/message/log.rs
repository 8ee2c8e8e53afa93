use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use prost::Message as _;
use tracing::{debug, info, warn};

use super::{LogError, StoredMessage};

const LOG_EXT: &str = "mqd";
const TMP_EXT: &str = "mqd.tmp";
const LEN_PREFIX: u64 = 8;

/// A decoded record and where its payload lives in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub record: StoredMessage,
    pub offset: u64,
    pub length: u64,
}

/// Append-only message log of a single queue.
#[derive(Debug)]
pub struct MessageLog {
    path: PathBuf,
    tmp_path: PathBuf,
    file: File,
}

impl MessageLog {
    /// Opens (or creates) `<dir>/<queue>.mqd`.
    pub fn open(dir: impl AsRef<Path>, queue: &str) -> Result<Self, LogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| LogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(format!("{queue}.{LOG_EXT}"));
        let tmp_path = dir.join(format!("{queue}.{TMP_EXT}"));
        let file = open_rw(&path)?;
        debug!(target: "relaymq::log", path = %path.display(), "Opened message log");

        Ok(Self {
            path,
            tmp_path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and returns `(offset, length)` of its payload.
    pub fn append(&mut self, record: &StoredMessage) -> Result<(u64, u64), LogError> {
        let payload = record.encode_to_vec();
        let end = self.file.seek(SeekFrom::End(0)).map_err(|e| self.io(e))?;

        let mut buf = BytesMut::with_capacity(LEN_PREFIX as usize + payload.len());
        buf.put_u64_le(payload.len() as u64);
        buf.put_slice(&payload);
        self.file.write_all(&buf).map_err(|e| self.io(e))?;

        Ok((end + LEN_PREFIX, payload.len() as u64))
    }

    /// Overwrites the payload at `offset` with `record`, which must encode to
    /// exactly `length` bytes.
    pub fn rewrite(
        &mut self,
        offset: u64,
        length: u64,
        record: &StoredMessage,
    ) -> Result<(), LogError> {
        let payload = record.encode_to_vec();
        if payload.len() as u64 != length {
            return Err(LogError::LengthMismatch {
                path: self.path.clone(),
                offset,
                expected: length,
                actual: payload.len() as u64,
            });
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io(e))?;
        self.file.write_all(&payload).map_err(|e| self.io(e))
    }

    /// Reads every complete record in file order. A truncated trailing record,
    /// or a length prefix running past the end of the file, ends the scan.
    pub fn load(&mut self) -> Result<Vec<LogEntry>, LogError> {
        let file_len = self.file.metadata().map_err(|e| self.io(e))?.len();
        self.file.seek(SeekFrom::Start(0)).map_err(|e| self.io(e))?;
        let mut reader = BufReader::new(&self.file);
        let mut entries = Vec::new();
        let mut pos = 0u64;

        loop {
            let mut len_bytes = [0u8; LEN_PREFIX as usize];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(source) => {
                    return Err(LogError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
            let length = u64::from_le_bytes(len_bytes);
            let offset = pos + LEN_PREFIX;
            if length > file_len.saturating_sub(offset) {
                warn!(target: "relaymq::log", path = %self.path.display(), offset, length, "Record length runs past end of log; ignoring tail");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(target: "relaymq::log", path = %self.path.display(), offset, "Ignoring truncated trailing record");
                    break;
                }
                Err(source) => {
                    return Err(LogError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            let record =
                StoredMessage::decode(payload.as_slice()).map_err(|source| LogError::Decode {
                    path: self.path.clone(),
                    offset,
                    source,
                })?;
            entries.push(LogEntry {
                record,
                offset,
                length,
            });
            pos = offset + length;
        }

        Ok(entries)
    }

    /// Rewrites the log keeping only valid records and returns them with their
    /// new locations. The old file is deleted and the compacted one renamed
    /// into its place.
    pub fn compact(&mut self) -> Result<Vec<LogEntry>, LogError> {
        let entries = self.load()?;
        let before = entries.len();

        let tmp = File::create(&self.tmp_path).map_err(|e| self.tmp_io(e))?;
        let mut writer = BufWriter::new(tmp);
        let mut kept = Vec::new();
        let mut pos = 0u64;

        for entry in entries.into_iter().filter(|e| e.record.is_valid()) {
            let payload = entry.record.encode_to_vec();
            writer
                .write_all(&(payload.len() as u64).to_le_bytes())
                .and_then(|_| writer.write_all(&payload))
                .map_err(|e| self.tmp_io(e))?;
            let offset = pos + LEN_PREFIX;
            pos = offset + payload.len() as u64;
            kept.push(LogEntry {
                record: entry.record,
                offset,
                length: payload.len() as u64,
            });
        }
        writer.flush().map_err(|e| self.tmp_io(e))?;
        drop(writer);

        fs::remove_file(&self.path).map_err(|e| self.io(e))?;
        fs::rename(&self.tmp_path, &self.path).map_err(|e| self.io(e))?;
        self.file = open_rw(&self.path)?;

        info!(
            target: "relaymq::log",
            path = %self.path.display(),
            before,
            after = kept.len(),
            "Compacted message log"
        );
        Ok(kept)
    }

    /// Deletes the log and any leftover compaction file.
    pub fn remove(self) -> Result<(), LogError> {
        let MessageLog {
            path,
            tmp_path,
            file,
        } = self;
        drop(file);
        for p in [&path, &tmp_path] {
            match fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(LogError::Io {
                        path: p.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn io(&self, source: io::Error) -> LogError {
        LogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn tmp_io(&self, source: io::Error) -> LogError {
        LogError::Io {
            path: self.tmp_path.clone(),
            source,
        }
    }
}

fn open_rw(path: &Path) -> Result<File, LogError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LogError::Io {
            path: path.to_path_buf(),
            source,
        })
}
