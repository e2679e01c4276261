//! Spooling of an upload stream to a scratch file.

use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Incrementally writes and hashes an upload of unknown size.
///
/// The scratch file is deleted when the spooler (or the [`Spooled`] it
/// produces) is dropped, whatever the outcome.
pub struct Spooler {
    file: File,
    path: TempPath,
    hasher: Sha256,
    written: u64,
    max_bytes: u64,
}

/// A fully written upload.
#[derive(Debug)]
pub struct Spooled {
    pub path: TempPath,
    pub content_hash: String,
    pub size_bytes: u64,
}

impl Spooler {
    pub fn new(dir: Option<&Path>, max_bytes: u64) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("smsflow-import-").suffix(".csv");
        let named = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.into_parts();
        Ok(Self {
            file: File::from_std(file),
            path,
            hasher: Sha256::new(),
            written: 0,
            max_bytes,
        })
    }

    /// Append `chunk`; fails with `FileTooLarge` as soon as the ceiling is crossed.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len() as u64;
        if self.written > self.max_bytes {
            return Err(Error::FileTooLarge {
                limit: self.max_bytes,
            });
        }
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<Spooled> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(Spooled {
            path: self.path,
            content_hash: hex::encode(self.hasher.finalize()),
            size_bytes: self.written,
        })
    }
}
