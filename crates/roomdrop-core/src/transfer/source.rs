//! Files to send.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::protocol::{FileMeta, DEFAULT_MIME_TYPE};

#[derive(Debug, Clone)]
enum Content {
    Memory(Arc<[u8]>),
    Disk(PathBuf),
}

/// A file to send: its announced metadata plus where the bytes come from.
///
/// Cloning is cheap; every destination opens its own [`ChunkReader`].
#[derive(Debug, Clone)]
pub struct FileSource {
    meta: FileMeta,
    content: Content,
}

impl FileSource {
    /// A file held in memory.
    #[must_use]
    pub fn from_bytes(filename: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            meta: FileMeta::new(filename, data.len() as u64),
            content: Content::Memory(data),
        }
    }

    /// A file on disk. The size is taken from its metadata now and the
    /// MIME type guessed from its extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is not a file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let filename = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string());
        let mime_type = mime_guess::from_path(path)
            .first()
            .map_or_else(|| DEFAULT_MIME_TYPE.to_string(), |m| m.to_string());

        Ok(Self {
            meta: FileMeta::new(filename, metadata.len()).with_mime_type(mime_type),
            content: Content::Disk(path.to_path_buf()),
        })
    }

    /// Expand paths into files to send.
    ///
    /// Files are taken as given; directories are walked recursively and
    /// their regular files added in name order. Symlinks are not followed.
    ///
    /// # Errors
    ///
    /// Returns an error if a path does not exist or a directory cannot be
    /// read.
    pub async fn collect<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Self>> {
        let mut sources = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if !path.is_dir() {
                sources.push(Self::from_path(path).await?);
                continue;
            }

            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    Error::Io(e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::other(format!("cannot walk {}", path.display()))
                    }))
                })?;
                if entry.file_type().is_file() {
                    sources.push(Self::from_path(entry.path()).await?);
                }
            }
        }
        tracing::debug!("Collected {} file(s) to send", sources.len());
        Ok(sources)
    }

    /// Override the announced MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.meta.mime_type = mime_type.into();
        self
    }

    /// Metadata announced in the header.
    #[must_use]
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Declared size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    /// Open a fresh read cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(&self) -> Result<ChunkReader> {
        let inner = match &self.content {
            Content::Memory(data) => Reader::Memory {
                data: Arc::clone(data),
                offset: 0,
            },
            Content::Disk(path) => Reader::Disk(tokio::fs::File::open(path).await?),
        };
        Ok(ChunkReader {
            inner,
            remaining: self.meta.size,
        })
    }
}

#[derive(Debug)]
enum Reader {
    Memory { data: Arc<[u8]>, offset: usize },
    Disk(tokio::fs::File),
}

/// Sequential chunk cursor over a [`FileSource`].
///
/// Never yields more than the declared size, and yields full chunks
/// except for the last.
#[derive(Debug)]
pub struct ChunkReader {
    inner: Reader,
    remaining: u64,
}

impl ChunkReader {
    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the next chunk of at most `chunk_size` bytes, `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or a file on disk shrank below its
    /// declared size.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = usize::try_from(self.remaining).map_or(chunk_size, |r| r.min(chunk_size));

        let chunk = match &mut self.inner {
            Reader::Memory { data, offset } => {
                let end = (*offset + want).min(data.len());
                let chunk = data[*offset..end].to_vec();
                *offset = end;
                chunk
            }
            Reader::Disk(file) => {
                let mut buf = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                buf
            }
        };

        if chunk.len() < want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file ended {} bytes short of its size", self.remaining),
            )));
        }

        self.remaining -= chunk.len() as u64;
        Ok(Some(chunk))
    }
}
