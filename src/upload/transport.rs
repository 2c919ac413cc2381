//! Single-chunk upload with retries.

use super::api::{ChunkReceipt, UploadApi};
use super::chunker::read_verified;
use super::retry::RetryPolicy;
use super::types::{ChunkMetadata, UploadFile};
use crate::error::{ErrorCode, UploadError};
use crate::events::{EventBus, EventPayload};
use crate::logging::{log_debug, log_warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ChunkTransport {
    api: Arc<dyn UploadApi>,
    policy: RetryPolicy,
    events: EventBus,
}

impl ChunkTransport {
    pub fn new(api: Arc<dyn UploadApi>, policy: RetryPolicy, events: EventBus) -> Self {
        Self {
            api,
            policy,
            events,
        }
    }

    /// Upload one chunk, retrying recoverable failures with backoff.
    ///
    /// Returns `UPLOAD_CANCELLED` as soon as `cancel` fires, whether the
    /// request is in flight or the task is waiting out a backoff.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkMetadata,
        file: &UploadFile,
        cancel: &CancellationToken,
    ) -> Result<ChunkReceipt, UploadError> {
        let index = chunk.chunk_index;
        let mut failed_attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::cancelled(session_id));
            }

            let attempt = failed_attempts + 1;
            self.events.emit(EventPayload::ChunkUploadStart {
                session_id: session_id.to_string(),
                chunk_index: index,
                attempt,
            });

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::cancelled(session_id)),
                result = self.attempt(session_id, chunk, file) => result,
            };

            let error = match result {
                Ok(receipt) => {
                    log_debug(
                        "chunk-transport",
                        &format!("Chunk {} of {} uploaded (attempt {})", index, session_id, attempt),
                    );
                    self.events.emit(EventPayload::ChunkUploadComplete {
                        session_id: session_id.to_string(),
                        chunk_index: index,
                        etag: receipt.etag.clone(),
                    });
                    return Ok(receipt);
                }
                Err(e) => e.with_session(session_id),
            };

            failed_attempts += 1;
            if !self.policy.should_retry(&error, failed_attempts) {
                log_warn(
                    "chunk-transport",
                    &format!(
                        "Chunk {} of {} failed after {} attempt(s): {}",
                        index, session_id, failed_attempts, error
                    ),
                );
                self.events.emit(EventPayload::ChunkUploadFailed {
                    session_id: session_id.to_string(),
                    chunk_index: index,
                    error: error.clone(),
                });
                return Err(error);
            }

            let delay = self.policy.calculate_backoff(failed_attempts);
            log_debug(
                "chunk-transport",
                &format!(
                    "Retrying chunk {} of {} in {:?} (retry {}/{}): {}",
                    index, session_id, delay, failed_attempts, self.policy.max_retries, error
                ),
            );
            self.events.emit(EventPayload::ChunkUploadRetry {
                session_id: session_id.to_string(),
                chunk_index: index,
                attempt: failed_attempts,
                delay_ms: delay.as_millis() as u64,
                reason: error.message.clone(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::cancelled(session_id)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        session_id: &str,
        chunk: &ChunkMetadata,
        file: &UploadFile,
    ) -> Result<ChunkReceipt, UploadError> {
        let data = read_verified(file, chunk).await?;
        let receipt = self.api.upload_chunk(session_id, chunk, data).await?;

        // Corrupted in transit; the same bytes can simply be sent again
        if !receipt.checksum.is_empty() && !receipt.checksum.eq_ignore_ascii_case(&chunk.checksum) {
            return Err(UploadError::new(
                ErrorCode::ServerError,
                format!(
                    "Checksum mismatch for chunk {}: sent {}, server saw {}",
                    chunk.chunk_index, chunk.checksum, receipt.checksum
                ),
                true,
            ));
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::upload::api::{CompleteRequest, CompleteResponse, InitRequest, InitResponse, ResumeInfo};
    use crate::upload::chunker::split;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies to chunk uploads from a script, then succeeds
    struct ScriptedChunks {
        script: Mutex<VecDeque<UploadError>>,
        calls: Mutex<u32>,
        hang: bool,
    }

    impl ScriptedChunks {
        fn new(failures: Vec<UploadError>) -> Self {
            Self {
                script: Mutex::new(failures.into()),
                calls: Mutex::new(0),
                hang: false,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl UploadApi for ScriptedChunks {
        async fn init(&self, _: &InitRequest) -> Result<InitResponse, UploadError> {
            unimplemented!()
        }

        async fn upload_chunk(
            &self,
            _session_id: &str,
            chunk: &ChunkMetadata,
            _data: Vec<u8>,
        ) -> Result<ChunkReceipt, UploadError> {
            *self.calls.lock().unwrap() += 1;
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(ChunkReceipt {
                etag: format!("etag-{}", chunk.chunk_index),
                checksum: chunk.checksum.clone(),
            })
        }

        async fn complete(&self, _: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
            unimplemented!()
        }

        async fn resume_info(&self, _: &str) -> Result<ResumeInfo, UploadError> {
            unimplemented!()
        }

        async fn abort(&self, _: &str, _: Option<&str>) -> Result<(), UploadError> {
            Ok(())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    async fn one_chunk() -> (UploadFile, ChunkMetadata) {
        let file = UploadFile::from_bytes("a.txt", "text/plain", b"chunk-bytes".to_vec());
        let chunk = split(&file, 64).await.unwrap().remove(0);
        (file, chunk)
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let api = Arc::new(ScriptedChunks::new(vec![
            UploadError::network("reset"),
            UploadError::server(503, "busy"),
        ]));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let transport = ChunkTransport::new(api.clone(), fast_policy(3), events);
        let (file, chunk) = one_chunk().await;

        let receipt = transport
            .upload_chunk("s", &chunk, &file, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.etag, "etag-0");
        assert_eq!(api.calls(), 3);

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == EventKind::ChunkUploadRetry {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let failures = (0..10).map(|_| UploadError::network("down")).collect();
        let api = Arc::new(ScriptedChunks::new(failures));
        let transport = ChunkTransport::new(api.clone(), fast_policy(2), EventBus::default());
        let (file, chunk) = one_chunk().await;

        let err = transport
            .upload_chunk("s", &chunk, &file, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.recoverable);
        assert_eq!(err.session_id.as_deref(), Some("s"));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let api = Arc::new(ScriptedChunks::new(vec![UploadError::server(400, "bad checksum")]));
        let transport = ChunkTransport::new(api.clone(), fast_policy(5), EventBus::default());
        let (file, chunk) = one_chunk().await;

        let err = transport
            .upload_chunk("s", &chunk, &file, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.recoverable);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_request() {
        let mut scripted = ScriptedChunks::new(Vec::new());
        scripted.hang = true;
        let api = Arc::new(scripted);
        let transport = ChunkTransport::new(api, fast_policy(3), EventBus::default());
        let (file, chunk) = one_chunk().await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            transport.upload_chunk("s", &chunk, &file, &cancel),
        )
        .await
        .expect("cancel should interrupt the request")
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
