//! Finite byte sources that feed multipart uploads.
//!
//! A [`ChunkSource`] knows its total length up front and hands out exact
//! slices from a moving cursor.  A read that cannot return the full length
//! fails with [`std::io::ErrorKind::UnexpectedEof`].

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncReadExt;

/// Sequential, exact-length byte source.
pub trait ChunkSource: Send {
    /// Total number of bytes this source will produce.
    fn total_len(&self) -> u64;

    /// Read exactly `len` bytes from the current cursor and advance it.
    fn read_chunk(
        &mut self,
        len: usize,
    ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + '_>>;
}

/// A local file read with `tokio::fs`.
pub struct FileSource {
    file: tokio::fs::File,
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open `path` and record its current length.
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        tracing::debug!("Opened upload source {:?} ({} bytes)", path, len);
        Ok(Self { file, path, len })
    }

    /// Path this source was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn total_len(&self) -> u64 {
        self.len
    }

    fn read_chunk(
        &mut self,
        len: usize,
    ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let mut buf = vec![0u8; len];
            self.file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }
}

/// An in-memory buffer, e.g. a request body.  Slices share the buffer.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    cursor: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
        }
    }
}

impl ChunkSource for BytesSource {
    fn total_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(
        &mut self,
        len: usize,
    ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let end = self
                .cursor
                .checked_add(len)
                .filter(|end| *end <= self.data.len())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "requested {len} bytes at offset {}, only {} remain",
                            self.cursor,
                            self.data.len() - self.cursor
                        ),
                    )
                })?;
            let chunk = self.data.slice(self.cursor..end);
            self.cursor = end;
            Ok(chunk)
        })
    }
}

/// A streamed HTTP request body of a declared length.
///
/// Frames are pulled from the body only as a part needs them, so at most
/// one part plus the remainder of one frame is held at a time.
pub struct BodySource {
    body: Body,
    pending: Bytes,
    len: u64,
    consumed: u64,
}

impl BodySource {
    /// Wrap `body`, which the client declared to be `len` bytes long.
    pub fn new(body: Body, len: u64) -> Self {
        Self {
            body,
            pending: Bytes::new(),
            len,
            consumed: 0,
        }
    }
}

impl ChunkSource for BodySource {
    fn total_len(&self) -> u64 {
        self.len
    }

    fn read_chunk(
        &mut self,
        len: usize,
    ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            if self.pending.len() >= len {
                self.consumed += len as u64;
                return Ok(self.pending.split_to(len));
            }

            let mut buf = BytesMut::with_capacity(len);
            while buf.len() < len {
                if self.pending.is_empty() {
                    match self.body.frame().await {
                        Some(Ok(frame)) => {
                            // Trailers carry no payload.
                            if let Ok(data) = frame.into_data() {
                                self.pending = data;
                            }
                            continue;
                        }
                        Some(Err(err)) => return Err(io::Error::other(err)),
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                format!(
                                    "request body ended after {} of {} bytes",
                                    self.consumed + buf.len() as u64,
                                    self.len
                                ),
                            ))
                        }
                    }
                }
                let take = (len - buf.len()).min(self.pending.len());
                buf.extend_from_slice(&self.pending.split_to(take));
            }
            self.consumed += len as u64;
            Ok(buf.freeze())
        })
    }
}
