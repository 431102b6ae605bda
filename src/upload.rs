//! Multipart upload orchestration.
//!
//! [`MultipartUploader::upload`] splits a [`ChunkSource`] into fixed-size
//! parts and drives the three-phase protocol against a [`MultipartStore`]:
//!
//! 1. `initiate_session` creates the remote upload and yields its ID.
//! 2. Parts are read and transmitted one at a time, in ascending part
//!    number order, and recorded in the manifest.
//! 3. `complete_session` finalizes the object from the manifest.
//!
//! Any failure after step 1 (source read, part transmission, cancellation
//! or completion) calls `abort_session` exactly once so that no in-progress
//! upload is left on the store.  If the abort itself fails the caller gets
//! [`UploadError::AbortFailed`], which carries the triggering error.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::UploadError;
use crate::metrics::{
    BYTES_UPLOADED_TOTAL, PARTS_UPLOADED_TOTAL, UPLOADS_TOTAL, UPLOAD_ABORTS_TOTAL,
    UPLOAD_DURATION_SECONDS,
};
use crate::source::ChunkSource;
use crate::store::backend::{MultipartStore, PartRecord, UploadTarget};

/// Default part size (5 MiB, the S3 minimum for all but the last part).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS_PER_UPLOAD: u64 = 10_000;

// -- Session -----------------------------------------------------------------

/// Lifecycle of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// The store issued an upload ID; no part has been acknowledged yet.
    Initiated,
    /// At least one part was acknowledged.
    InProgress,
    /// The store assembled the object.
    Completed,
    /// The session was aborted and its parts released.
    Aborted,
    /// The abort failed; part data is still allocated on the store.
    Failed,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted | SessionStatus::Failed
        )
    }
}

/// The store-side handle of one upload, owned by a single
/// [`MultipartUploader::upload`] call.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub target: UploadTarget,
    pub status: SessionStatus,
}

impl UploadSession {
    fn new(upload_id: String, target: UploadTarget) -> Self {
        Self {
            upload_id,
            target,
            status: SessionStatus::Initiated,
        }
    }

    fn advance(&mut self, next: SessionStatus) {
        if self.status != next {
            debug!(
                "Upload {} for {}: {:?} -> {:?}",
                self.upload_id, self.target, self.status, next
            );
            self.status = next;
        }
    }
}

// -- Part planning -----------------------------------------------------------

/// Byte range of one part, before it is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

/// Split `total_len` bytes into parts of `chunk_size` (the last part may be
/// shorter).  Part numbers start at 1 and increase with the offset.
pub fn plan_parts(total_len: u64, chunk_size: u64) -> Result<Vec<PartPlan>, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::invalid("chunk size must be greater than zero"));
    }
    if usize::try_from(chunk_size).is_err() {
        return Err(UploadError::invalid(format!(
            "chunk size {chunk_size} does not fit in memory on this platform"
        )));
    }
    if total_len == 0 {
        return Err(UploadError::invalid("source is empty"));
    }

    let count = total_len.div_ceil(chunk_size);
    if count > MAX_PARTS_PER_UPLOAD {
        return Err(UploadError::invalid(format!(
            "{total_len} bytes in {chunk_size}-byte chunks needs {count} parts, \
             more than the limit of {MAX_PARTS_PER_UPLOAD}"
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut part_number = 1u32;
    while offset < total_len {
        let length = chunk_size.min(total_len - offset);
        parts.push(PartPlan {
            part_number,
            offset,
            length,
        });
        offset += length;
        part_number += 1;
    }
    Ok(parts)
}

fn check_target(target: &UploadTarget) -> Result<(), UploadError> {
    if target.bucket.is_empty() || target.key.is_empty() {
        return Err(UploadError::invalid("bucket and key must not be empty"));
    }
    Ok(())
}

// -- Options -----------------------------------------------------------------

/// Progress report delivered after each acknowledged part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub part_number: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Synchronous progress callback.
pub type ProgressObserver = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Shared flag checked between parts.  Once set, the upload is aborted
/// before the next part is read.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Optional hooks for a single upload.
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub progress: Option<ProgressObserver>,
    pub cancel: Option<CancellationFlag>,
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl UploadOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationFlag::is_cancelled)
    }
}

// -- Orchestrator ------------------------------------------------------------

/// Result of a completed upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub status: SessionStatus,
    pub total_bytes: u64,
    pub parts: Vec<PartRecord>,
}

/// Sequential multipart uploader over an injected store.
#[derive(Clone)]
pub struct MultipartUploader {
    store: Arc<dyn MultipartStore>,
}

impl fmt::Debug for MultipartUploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartUploader").finish_non_exhaustive()
    }
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn MultipartStore>) -> Self {
        Self { store }
    }

    /// Upload all of `source` to `target` in `chunk_size`-byte parts.
    ///
    /// Returns `InvalidInput` without touching the store when the chunk size
    /// or source is empty, or when the target has no bucket or key.
    ///
    /// Not cancel-safe: dropping the returned future after initiation
    /// leaves the remote session in progress.  Stop an upload through
    /// [`UploadOptions::cancel`], or drive it on its own task when the
    /// caller may go away.
    pub async fn upload(
        &self,
        source: &mut dyn ChunkSource,
        target: &UploadTarget,
        chunk_size: u64,
        options: &UploadOptions,
    ) -> Result<UploadSummary, UploadError> {
        let total_bytes = source.total_len();
        let plan = check_target(target)
            .and_then(|()| plan_parts(total_bytes, chunk_size))
            .inspect_err(|err| {
                metrics::counter!(UPLOADS_TOTAL, "outcome" => err.kind()).increment(1);
            })?;

        let started = Instant::now();
        let upload_id = self
            .store
            .initiate_session(target)
            .await
            .and_then(|id| {
                if id.is_empty() {
                    anyhow::bail!("store returned an empty upload ID");
                }
                Ok(id)
            })
            .map_err(|source| {
                metrics::counter!(UPLOADS_TOTAL, "outcome" => "InitiationFailed").increment(1);
                UploadError::InitiationFailed {
                    bucket: target.bucket.clone(),
                    key: target.key.clone(),
                    source,
                }
            })?;

        let mut session = UploadSession::new(upload_id, target.clone());
        info!(
            "Started multipart upload {} for {}: {} bytes in {} parts of up to {} bytes",
            session.upload_id,
            target,
            total_bytes,
            plan.len(),
            chunk_size
        );

        let result = match self
            .upload_parts(&mut session, source, &plan, total_bytes, options)
            .await
        {
            Ok(manifest) => self
                .store
                .complete_session(target, &session.upload_id, &manifest)
                .await
                .map(|()| manifest)
                .map_err(|source| UploadError::CompletionFailed {
                    upload_id: session.upload_id.clone(),
                    source,
                }),
            Err(err) => Err(err),
        };

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(err) => {
                let err = self.abort(&mut session, err).await;
                metrics::counter!(UPLOADS_TOTAL, "outcome" => err.kind()).increment(1);
                return Err(err);
            }
        };

        session.advance(SessionStatus::Completed);
        let elapsed = started.elapsed();
        metrics::counter!(UPLOADS_TOTAL, "outcome" => "Completed").increment(1);
        metrics::histogram!(UPLOAD_DURATION_SECONDS).record(elapsed.as_secs_f64());
        info!(
            "Completed multipart upload {} for {} ({} parts, {} bytes) in {:.2?}",
            session.upload_id,
            target,
            manifest.len(),
            total_bytes,
            elapsed
        );

        Ok(UploadSummary {
            upload_id: session.upload_id,
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            status: session.status,
            total_bytes,
            parts: manifest,
        })
    }

    /// Read and transmit every planned part in order, returning the
    /// manifest.  Stops at the first failure.
    async fn upload_parts(
        &self,
        session: &mut UploadSession,
        source: &mut dyn ChunkSource,
        plan: &[PartPlan],
        total_bytes: u64,
        options: &UploadOptions,
    ) -> Result<Vec<PartRecord>, UploadError> {
        let mut manifest = Vec::with_capacity(plan.len());
        let mut transferred = 0u64;

        for part in plan {
            if options.is_cancelled() {
                return Err(UploadError::Cancelled {
                    part_number: part.part_number,
                });
            }

            // plan_parts guarantees the chunk size fits in usize.
            let data = source
                .read_chunk(part.length as usize)
                .await
                .and_then(|data| {
                    if data.len() as u64 != part.length {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("source returned {} of {} bytes", data.len(), part.length),
                        ));
                    }
                    Ok(data)
                })
                .map_err(|source| UploadError::SourceRead {
                    part_number: part.part_number,
                    offset: part.offset,
                    length: part.length,
                    source,
                })?;

            let etag = self
                .store
                .upload_part(&session.target, &session.upload_id, part.part_number, data)
                .await
                .and_then(|etag| {
                    if etag.is_empty() {
                        anyhow::bail!("store returned no ETag");
                    }
                    Ok(etag)
                })
                .map_err(|source| UploadError::PartUploadFailed {
                    part_number: part.part_number,
                    source,
                })?;

            debug!(
                "Upload {}: part {} ({} bytes at offset {}) etag={}",
                session.upload_id, part.part_number, part.length, part.offset, etag
            );

            manifest.push(PartRecord {
                part_number: part.part_number,
                offset: part.offset,
                length: part.length,
                etag,
            });
            session.advance(SessionStatus::InProgress);

            transferred += part.length;
            metrics::counter!(PARTS_UPLOADED_TOTAL).increment(1);
            metrics::counter!(BYTES_UPLOADED_TOTAL).increment(part.length);

            if let Some(progress) = &options.progress {
                progress(UploadProgress {
                    part_number: part.part_number,
                    bytes_transferred: transferred,
                    total_bytes,
                });
            }
        }

        Ok(manifest)
    }

    /// Abort the session after `original` and return the error to surface.
    async fn abort(&self, session: &mut UploadSession, original: UploadError) -> UploadError {
        warn!(
            "Aborting multipart upload {} for {}: {}",
            session.upload_id, session.target, original
        );

        match self
            .store
            .abort_session(&session.target, &session.upload_id)
            .await
        {
            Ok(()) => {
                session.advance(SessionStatus::Aborted);
                metrics::counter!(UPLOAD_ABORTS_TOTAL, "result" => "ok").increment(1);
                original
            }
            Err(source) => {
                session.advance(SessionStatus::Failed);
                metrics::counter!(UPLOAD_ABORTS_TOTAL, "result" => "failed").increment(1);
                error!(
                    "Failed to abort multipart upload {} for {}; uploaded parts remain on the store \
                     and must be removed manually: {:#}",
                    session.upload_id, session.target, source
                );
                UploadError::AbortFailed {
                    upload_id: session.upload_id.clone(),
                    original: Box::new(original),
                    source,
                }
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BytesSource;
    use crate::store::memory::MemoryMultipartStore;
    use bytes::Bytes;
    use std::future::Future;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;

    const MB: u64 = 1024 * 1024;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Initiate,
        UploadPart { upload_id: String, part_number: u32, len: usize },
        Complete { upload_id: String, parts: Vec<u32> },
        Abort { upload_id: String },
    }

    /// Store double that records every call and fails on request.
    #[derive(Default)]
    struct ScriptedStore {
        calls: Mutex<Vec<Call>>,
        fail_initiate: bool,
        fail_part: Option<u32>,
        empty_etag_part: Option<u32>,
        fail_complete: bool,
        fail_abort: bool,
    }

    impl ScriptedStore {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }
    }

    impl MultipartStore for ScriptedStore {
        fn initiate_session(
            &self,
            _target: &UploadTarget,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            Box::pin(async move {
                self.record(Call::Initiate);
                if self.fail_initiate {
                    anyhow::bail!("AccessDenied");
                }
                Ok("upload-42".to_string())
            })
        }

        fn upload_part(
            &self,
            _target: &UploadTarget,
            upload_id: &str,
            part_number: u32,
            data: Bytes,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            let upload_id = upload_id.to_string();
            Box::pin(async move {
                self.record(Call::UploadPart {
                    upload_id,
                    part_number,
                    len: data.len(),
                });
                if self.fail_part == Some(part_number) {
                    anyhow::bail!("connection reset by peer");
                }
                if self.empty_etag_part == Some(part_number) {
                    return Ok(String::new());
                }
                Ok(format!("\"etag-{part_number}\""))
            })
        }

        fn complete_session(
            &self,
            _target: &UploadTarget,
            upload_id: &str,
            parts: &[PartRecord],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let call = Call::Complete {
                upload_id: upload_id.to_string(),
                parts: parts.iter().map(|p| p.part_number).collect(),
            };
            Box::pin(async move {
                self.record(call);
                if self.fail_complete {
                    anyhow::bail!("InvalidPart");
                }
                Ok(())
            })
        }

        fn abort_session(
            &self,
            _target: &UploadTarget,
            upload_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let upload_id = upload_id.to_string();
            Box::pin(async move {
                self.record(Call::Abort { upload_id });
                if self.fail_abort {
                    anyhow::bail!("service unavailable");
                }
                Ok(())
            })
        }
    }

    /// Source that claims `len` bytes but fails on the read of `fail_at`
    /// (1-based).
    struct FailingSource {
        len: u64,
        reads: u32,
        fail_at: u32,
    }

    impl ChunkSource for FailingSource {
        fn total_len(&self) -> u64 {
            self.len
        }

        fn read_chunk(
            &mut self,
            len: usize,
        ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + '_>> {
            Box::pin(async move {
                self.reads += 1;
                if self.reads == self.fail_at {
                    return Err(io::Error::new(io::ErrorKind::Other, "disk gone"));
                }
                Ok(Bytes::from(vec![7u8; len]))
            })
        }
    }

    fn target() -> UploadTarget {
        UploadTarget::new("media", "kazoo.mp4")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn run(
        store: &Arc<ScriptedStore>,
        len: usize,
        chunk_size: u64,
    ) -> Result<UploadSummary, UploadError> {
        let uploader = MultipartUploader::new(store.clone());
        let mut source = BytesSource::new(pattern(len));
        uploader
            .upload(&mut source, &target(), chunk_size, &UploadOptions::default())
            .await
    }

    // -- plan_parts ----------------------------------------------------------

    #[test]
    fn test_plan_12mb_in_5mb_chunks() {
        let plan = plan_parts(12 * MB, 5 * MB).unwrap();
        assert_eq!(
            plan,
            vec![
                PartPlan { part_number: 1, offset: 0, length: 5 * MB },
                PartPlan { part_number: 2, offset: 5 * MB, length: 5 * MB },
                PartPlan { part_number: 3, offset: 10 * MB, length: 2 * MB },
            ]
        );
    }

    #[test]
    fn test_plan_part_count_and_coverage() {
        for (len, chunk) in [(1, 1), (1, 10), (10, 3), (9, 3), (100, 7), (5 * MB, 5 * MB)] {
            let plan = plan_parts(len, chunk).unwrap();
            assert_eq!(plan.len() as u64, len.div_ceil(chunk), "len={len} chunk={chunk}");
            assert_eq!(plan.iter().map(|p| p.length).sum::<u64>(), len);

            let numbers: Vec<u32> = plan.iter().map(|p| p.part_number).collect();
            let expected: Vec<u32> = (1..=plan.len() as u32).collect();
            assert_eq!(numbers, expected);

            let mut offset = 0;
            for part in &plan {
                assert_eq!(part.offset, offset);
                assert!(part.length > 0 && part.length <= chunk);
                offset += part.length;
            }
        }
    }

    #[test]
    fn test_plan_rejects_invalid_input() {
        assert!(matches!(plan_parts(10, 0), Err(UploadError::InvalidInput { .. })));
        assert!(matches!(plan_parts(0, 5), Err(UploadError::InvalidInput { .. })));
        assert!(matches!(
            plan_parts(MAX_PARTS_PER_UPLOAD + 1, 1),
            Err(UploadError::InvalidInput { .. })
        ));
        assert_eq!(plan_parts(MAX_PARTS_PER_UPLOAD, 1).unwrap().len(), 10_000);
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(!SessionStatus::Initiated.is_terminal());
        assert!(!SessionStatus::InProgress.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
    }

    // -- Happy path ----------------------------------------------------------

    #[tokio::test]
    async fn test_upload_12mb_in_5mb_parts() {
        let store = Arc::new(ScriptedStore::default());
        let summary = run(&store, 12 * MB as usize, 5 * MB).await.unwrap();

        assert_eq!(summary.upload_id, "upload-42");
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.total_bytes, 12 * MB);
        let lengths: Vec<u64> = summary.parts.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![5 * MB, 5 * MB, 2 * MB]);

        let part = |n: u32, len: u64| Call::UploadPart {
            upload_id: "upload-42".to_string(),
            part_number: n,
            len: len as usize,
        };
        assert_eq!(
            store.calls(),
            vec![
                Call::Initiate,
                part(1, 5 * MB),
                part(2, 5 * MB),
                part(3, 2 * MB),
                Call::Complete {
                    upload_id: "upload-42".to_string(),
                    parts: vec![1, 2, 3],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_single_short_part() {
        let store = Arc::new(ScriptedStore::default());
        let summary = run(&store, 10, 5 * MB).await.unwrap();
        assert_eq!(summary.parts.len(), 1);
        assert_eq!(summary.parts[0].length, 10);
        assert_eq!(summary.parts[0].etag, "\"etag-1\"");
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 0);
    }

    #[tokio::test]
    async fn test_upload_reassembles_bytes_in_memory_store() {
        let store = Arc::new(MemoryMultipartStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let data = pattern(1000);
        let mut source = BytesSource::new(data.clone());

        let summary = uploader
            .upload(&mut source, &target(), 64, &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.parts.len(), 16);

        let (stored, etag) = store.get_object("media", "kazoo.mp4").await.unwrap();
        assert_eq!(stored.as_ref(), data.as_slice());
        assert!(etag.ends_with("-16\""));
        assert_eq!(store.in_progress_uploads().await, 0);
    }

    // -- Validation ----------------------------------------------------------

    #[tokio::test]
    async fn test_empty_source_makes_no_remote_calls() {
        let store = Arc::new(ScriptedStore::default());
        let err = run(&store, 0, 5 * MB).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_rejected_and_completed_uploads_are_counted() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let store = Arc::new(ScriptedStore::default());

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                run(&store, 0, 5 * MB).await.unwrap_err();
                run(&store, 100, 0).await.unwrap_err();
                run(&store, 100, 40).await.unwrap();
            });
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"chunklift_uploads_total{outcome="InvalidInput"} 2"#));
        assert!(rendered.contains(r#"chunklift_uploads_total{outcome="Completed"} 1"#));
        assert!(rendered.contains("chunklift_parts_uploaded_total 3"));
    }

    #[tokio::test]
    async fn test_zero_chunk_size_makes_no_remote_calls() {
        let store = Arc::new(ScriptedStore::default());
        let err = run(&store, 100, 0).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = Arc::new(ScriptedStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let mut source = BytesSource::new(pattern(10));
        let err = uploader
            .upload(
                &mut source,
                &UploadTarget::new("media", ""),
                4,
                &UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initiation_failure_needs_no_cleanup() {
        let store = Arc::new(ScriptedStore {
            fail_initiate: true,
            ..Default::default()
        });
        let err = run(&store, 100, 10).await.unwrap_err();
        assert!(matches!(err, UploadError::InitiationFailed { .. }));
        assert_eq!(store.calls(), vec![Call::Initiate]);
    }

    // -- Failure paths -------------------------------------------------------

    #[tokio::test]
    async fn test_part_2_of_3_fails_aborts_with_session_id() {
        let store = Arc::new(ScriptedStore {
            fail_part: Some(2),
            ..Default::default()
        });
        let err = run(&store, 12 * MB as usize, 5 * MB).await.unwrap_err();

        assert!(matches!(err, UploadError::PartUploadFailed { part_number: 2, .. }));
        assert_eq!(
            store.calls().last(),
            Some(&Call::Abort {
                upload_id: "upload-42".to_string()
            })
        );
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 0);
        // Part 3 is never attempted.
        assert_eq!(store.count(|c| matches!(c, Call::UploadPart { .. })), 2);
    }

    #[tokio::test]
    async fn test_failure_at_any_part_aborts_exactly_once() {
        for k in 1..=4u32 {
            let store = Arc::new(ScriptedStore {
                fail_part: Some(k),
                ..Default::default()
            });
            let err = run(&store, 40, 10).await.unwrap_err();
            assert_eq!(err.kind(), "PartUploadFailed", "k={k}");
            assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1, "k={k}");
            assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 0, "k={k}");
        }
    }

    #[tokio::test]
    async fn test_empty_etag_is_part_failure() {
        let store = Arc::new(ScriptedStore {
            empty_etag_part: Some(1),
            ..Default::default()
        });
        let err = run(&store, 20, 10).await.unwrap_err();
        assert!(matches!(err, UploadError::PartUploadFailed { part_number: 1, .. }));
        assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 0);
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1);
    }

    #[tokio::test]
    async fn test_completion_failure_aborts_before_surfacing() {
        let store = Arc::new(ScriptedStore {
            fail_complete: true,
            ..Default::default()
        });
        let err = run(&store, 20, 10).await.unwrap_err();
        assert!(matches!(err, UploadError::CompletionFailed { .. }));

        let calls = store.calls();
        let complete_at = calls
            .iter()
            .position(|c| matches!(c, Call::Complete { .. }))
            .unwrap();
        let abort_at = calls
            .iter()
            .position(|c| matches!(c, Call::Abort { .. }))
            .unwrap();
        assert!(abort_at > complete_at);
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1);
    }

    #[tokio::test]
    async fn test_successful_upload_never_aborts() {
        let store = Arc::new(ScriptedStore::default());
        run(&store, 95, 10).await.unwrap();
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 0);
        assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 1);
    }

    #[tokio::test]
    async fn test_abort_failure_carries_original_error() {
        let store = Arc::new(ScriptedStore {
            fail_part: Some(1),
            fail_abort: true,
            ..Default::default()
        });
        let err = run(&store, 20, 10).await.unwrap_err();

        assert!(err.is_terminal());
        match &err {
            UploadError::AbortFailed {
                upload_id,
                original,
                ..
            } => {
                assert_eq!(upload_id, "upload-42");
                assert!(matches!(
                    **original,
                    UploadError::PartUploadFailed { part_number: 1, .. }
                ));
            }
            other => panic!("expected AbortFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_failure_after_completion_failure() {
        let store = Arc::new(ScriptedStore {
            fail_complete: true,
            fail_abort: true,
            ..Default::default()
        });
        let err = run(&store, 20, 10).await.unwrap_err();
        assert_eq!(err.kind(), "AbortFailed");
        assert_eq!(err.original().map(|e| e.kind()), Some("CompletionFailed"));
    }

    #[tokio::test]
    async fn test_source_read_error_aborts() {
        let store = Arc::new(ScriptedStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let mut source = FailingSource {
            len: 30,
            reads: 0,
            fail_at: 2,
        };

        let err = uploader
            .upload(&mut source, &target(), 10, &UploadOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::SourceRead {
                part_number: 2,
                offset: 10,
                length: 10,
                ..
            }
        ));
        assert_eq!(store.count(|c| matches!(c, Call::UploadPart { .. })), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 0);
    }

    #[tokio::test]
    async fn test_source_failure_leaves_no_orphan_in_memory_store() {
        let store = Arc::new(MemoryMultipartStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let mut source = FailingSource {
            len: 30,
            reads: 0,
            fail_at: 3,
        };

        let err = uploader
            .upload(&mut source, &target(), 10, &UploadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SourceReadError");
        assert_eq!(store.in_progress_uploads().await, 0);
        assert_eq!(store.buffered_bytes().await, 0);
        assert!(store.get_object("media", "kazoo.mp4").await.is_none());
    }

    // -- Progress and cancellation -------------------------------------------

    #[tokio::test]
    async fn test_progress_reports_each_part() {
        let store = Arc::new(ScriptedStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = UploadOptions {
            progress: Some(Arc::new(move |p: UploadProgress| {
                sink.lock().unwrap().push(p);
            })),
            cancel: None,
        };

        let mut source = BytesSource::new(pattern(25));
        uploader
            .upload(&mut source, &target(), 10, &options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let transferred: Vec<u64> = seen.iter().map(|p| p.bytes_transferred).collect();
        assert_eq!(transferred, vec![10, 20, 25]);
        assert!(seen.iter().all(|p| p.total_bytes == 25));
    }

    #[tokio::test]
    async fn test_cancellation_between_parts_aborts() {
        let store = Arc::new(ScriptedStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        let options = UploadOptions {
            progress: Some(Arc::new(move |p: UploadProgress| {
                if p.part_number == 1 {
                    trigger.cancel();
                }
            })),
            cancel: Some(cancel),
        };

        let mut source = BytesSource::new(pattern(30));
        let err = uploader
            .upload(&mut source, &target(), 10, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled { part_number: 2 }));
        assert_eq!(store.count(|c| matches!(c, Call::UploadPart { .. })), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Abort { .. })), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete { .. })), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_still_aborts_session() {
        let store = Arc::new(ScriptedStore::default());
        let uploader = MultipartUploader::new(store.clone());
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let options = UploadOptions {
            progress: None,
            cancel: Some(cancel),
        };

        let mut source = BytesSource::new(pattern(30));
        let err = uploader
            .upload(&mut source, &target(), 10, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled { part_number: 1 }));
        assert_eq!(
            store.calls(),
            vec![
                Call::Initiate,
                Call::Abort {
                    upload_id: "upload-42".to_string()
                }
            ]
        );
    }
}
