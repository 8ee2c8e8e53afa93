//! Durable row store for topology metadata.
//!
//! Each logical table is a TOML file holding an array of rows. Every mutation
//! rewrites the file through a temporary sibling and an atomic rename, so a
//! crash leaves either the old or the new table on disk, never a torn one.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode table {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode table {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct TableFile<R> {
    #[serde(default = "Vec::new")]
    rows: Vec<R>,
}

/// A durable table of rows of type `R`.
///
/// Not internally synchronised: the owning manager serialises access under
/// its own lock.
#[derive(Debug)]
pub struct Table<R> {
    path: PathBuf,
    _rows: PhantomData<fn() -> R>,
}

impl<R> Table<R>
where
    R: Serialize + DeserializeOwned + Clone,
{
    /// Opens `<dir>/<name>.toml`, creating the directory and an empty table
    /// if absent. Failure here means the table cannot back recovery and the
    /// broker must not start.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let table = Self {
            path: dir.join(format!("{name}.toml")),
            _rows: PhantomData,
        };

        if !table.path.exists() {
            table.write_rows(&[])?;
            debug!(target: "relaymq::store", path = %table.path.display(), "Created table");
        } else {
            // Surface a corrupt table now rather than at first mutation.
            table.load()?;
        }

        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every row currently stored.
    pub fn load(&self) -> Result<Vec<R>, StoreError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let file: TableFile<R> = toml::from_str(&raw).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })?;
        Ok(file.rows)
    }

    pub fn insert(&self, row: R) -> Result<(), StoreError> {
        let mut rows = self.load()?;
        rows.push(row);
        self.write_rows(&rows)
    }

    /// Removes every row matching `pred`, returning how many were removed.
    pub fn delete_where<F>(&self, pred: F) -> Result<usize, StoreError>
    where
        F: Fn(&R) -> bool,
    {
        let mut rows = self.load()?;
        let before = rows.len();
        rows.retain(|r| !pred(r));
        let removed = before - rows.len();
        if removed > 0 {
            self.write_rows(&rows)?;
        }
        Ok(removed)
    }

    /// Drops every row.
    pub fn truncate(&self) -> Result<(), StoreError> {
        self.write_rows(&[])
    }

    fn write_rows(&self, rows: &[R]) -> Result<(), StoreError> {
        let file = TableFile {
            rows: rows.to_vec(),
        };
        let encoded = toml::to_string(&file).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("toml.tmp");
        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        fs::write(&tmp, encoded).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
