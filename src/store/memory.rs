//! In-memory multipart store.
//!
//! Sessions, their parts and completed objects are held in
//! `tokio::sync::RwLock<HashMap<...>>` maps.  The store enforces the same
//! completion rules as S3: the manifest must be non-empty, in ascending
//! part number order, reference every uploaded part, and carry the ETag
//! each part was acknowledged with.
//!
//! A configurable memory limit (`max_size_bytes`) caps the bytes held by
//! in-progress uploads.

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use super::backend::{MultipartStore, PartRecord, UploadTarget};

/// One in-progress upload.
#[derive(Debug)]
struct Session {
    target: UploadTarget,
    /// part_number -> (data, etag)
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// In-memory multipart store.
#[derive(Debug)]
pub struct MemoryMultipartStore {
    /// upload_id -> session.
    sessions: tokio::sync::RwLock<HashMap<String, Session>>,
    /// Completed objects: "bucket/key" -> (data, etag).
    objects: tokio::sync::RwLock<HashMap<String, (Bytes, String)>>,
    /// Bytes currently held by in-progress parts.
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum part bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl Default for MemoryMultipartStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryMultipartStore {
    /// Create a store holding at most `max_size_bytes` of part data
    /// (0 = unlimited).
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            objects: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
        }
    }

    // ── ETag helpers ────────────────────────────────────────────────

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Composite multipart ETag: md5 of the concatenated binary part MD5s,
    /// suffixed with the part count.
    fn composite_etag(part_etags: &[&str]) -> String {
        let mut combined: Vec<u8> = Vec::with_capacity(part_etags.len() * 16);
        for etag in part_etags {
            if let Ok(bytes) = hex::decode(etag.trim_matches('"')) {
                combined.extend_from_slice(&bytes);
            }
        }
        let mut hasher = Md5::new();
        hasher.update(&combined);
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), part_etags.len())
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Reject a transition from `current` to `next` held bytes that would
    /// exceed the memory limit.
    fn check_capacity(&self, current: u64, next: u64) -> anyhow::Result<()> {
        if self.max_size_bytes > 0 && next > current && next > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: current={current}, requested={next}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }

    /// Adjust the tracked size by a signed delta.
    async fn adjust_size(&self, delta: i64) {
        let mut size = self.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub(delta.unsigned_abs());
        }
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Return a completed object and its ETag.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Option<(Bytes, String)> {
        let objects = self.objects.read().await;
        objects.get(&format!("{bucket}/{key}")).cloned()
    }

    /// Number of sessions that were initiated but neither completed nor
    /// aborted.
    pub async fn in_progress_uploads(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Bytes currently held by in-progress parts.
    pub async fn buffered_bytes(&self) -> u64 {
        *self.current_size.read().await
    }
}

/// Check the manifest against the parts the session actually holds.
fn validate_manifest(session: &Session, parts: &[PartRecord]) -> anyhow::Result<()> {
    if parts.is_empty() {
        anyhow::bail!("MalformedXML: manifest lists no parts");
    }

    let mut previous = 0u32;
    for part in parts {
        if part.part_number <= previous {
            anyhow::bail!(
                "InvalidPartOrder: part {} follows part {}",
                part.part_number,
                previous
            );
        }
        previous = part.part_number;

        match session.parts.get(&part.part_number) {
            None => anyhow::bail!("InvalidPart: part {} was never uploaded", part.part_number),
            Some((_, etag)) if *etag != part.etag => anyhow::bail!(
                "InvalidPart: part {} etag {} does not match {}",
                part.part_number,
                part.etag,
                etag
            ),
            Some(_) => {}
        }
    }

    if parts.len() != session.parts.len() {
        anyhow::bail!(
            "InvalidPart: manifest lists {} parts but {} were uploaded",
            parts.len(),
            session.parts.len()
        );
    }

    Ok(())
}

// ── MultipartStore implementation ──────────────────────────────────────

impl MultipartStore for MemoryMultipartStore {
    fn initiate_session(
        &self,
        target: &UploadTarget,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let target = target.clone();
        Box::pin(async move {
            let upload_id = uuid::Uuid::new_v4().to_string();
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                upload_id.clone(),
                Session {
                    target,
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            if part_number == 0 {
                anyhow::bail!("InvalidArgument: part numbers start at 1");
            }

            let etag = Self::compute_etag(&data);

            // Lock order: size, then sessions.  Complete and abort never
            // hold both at once.
            let mut size = self.current_size.write().await;
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&upload_id)
                .filter(|s| s.target == target)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?;

            let old_len = session
                .parts
                .get(&part_number)
                .map_or(0, |(d, _)| d.len() as u64);
            let new_size = size.saturating_sub(old_len) + data.len() as u64;
            self.check_capacity(*size, new_size)?;

            session.parts.insert(part_number, (data, etag.clone()));
            *size = new_size;
            Ok(etag)
        })
    }

    fn complete_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let session = {
                let mut sessions = self.sessions.write().await;
                let session = sessions
                    .get(&upload_id)
                    .filter(|s| s.target == target)
                    .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?;
                // A rejected manifest leaves the session in place, as S3 does.
                validate_manifest(session, &parts)?;
                sessions
                    .remove(&upload_id)
                    .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?
            };

            let total: usize = session.parts.values().map(|(d, _)| d.len()).sum();
            let mut assembled = BytesMut::with_capacity(total);
            let mut etags = Vec::with_capacity(parts.len());
            for (data, etag) in session.parts.values() {
                assembled.extend_from_slice(data);
                etags.push(etag.as_str());
            }
            let etag = Self::composite_etag(&etags);

            tracing::debug!(
                "Memory store assembled {} ({} parts, {} bytes)",
                target,
                etags.len(),
                total
            );

            {
                let mut objects = self.objects.write().await;
                objects.insert(target.to_string(), (assembled.freeze(), etag));
            }
            self.adjust_size(-(total as i64)).await;
            Ok(())
        })
    }

    fn abort_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let session = {
                let mut sessions = self.sessions.write().await;
                let owned = sessions
                    .get(&upload_id)
                    .is_some_and(|s| s.target == target);
                if owned {
                    sessions.remove(&upload_id)
                } else {
                    None
                }
            }
            .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?;

            let freed: usize = session.parts.values().map(|(d, _)| d.len()).sum();
            if freed > 0 {
                self.adjust_size(-(freed as i64)).await;
            }
            Ok(())
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
