//! Shared fixtures for the integration tests.
//!
//! `FakeUploadApi` is an in-memory upload server: it assigns sessions, records
//! every call, tracks how many chunk requests are in flight and can be
//! scripted to fail specific chunks.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use chunked_uploader::config::{RetryConfig, UploaderConfig};
use chunked_uploader::upload::api::{
    ChunkReceipt, CompleteRequest, CompleteResponse, InitRequest, InitResponse, ResumeInfo,
};
use chunked_uploader::upload::{ChunkMetadata, SessionStore, UploadApi, UploadEngine};
use chunked_uploader::UploadError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init { file_name: String },
    Chunk { session_id: String, chunk_index: u32 },
    Complete { session_id: String, chunks: Vec<u32> },
    Resume { session_id: String },
    Abort { session_id: String },
}

#[derive(Debug, Default)]
struct ServerSession {
    total_chunks: u32,
    received: BTreeMap<u32, String>,
}

#[derive(Default)]
struct State {
    next_session: u32,
    sessions: HashMap<String, ServerSession>,
    chunk_failures: HashMap<u32, VecDeque<UploadError>>,
    resume_override: Option<ResumeInfo>,
    calls: Vec<Call>,
    in_flight_per_session: HashMap<String, usize>,
    peak_per_session: HashMap<String, usize>,
    peak_sessions: usize,
}

#[derive(Default)]
pub struct FakeUploadApi {
    state: Mutex<State>,
    chunk_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeUploadApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_chunk_delay(delay: Duration) -> Arc<Self> {
        let api = Self::default();
        *api.chunk_delay.lock().unwrap() = delay;
        Arc::new(api)
    }

    /// Fail `chunk_index` (in any session) with these errors, in order
    pub fn fail_chunk(&self, chunk_index: u32, errors: Vec<UploadError>) {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .insert(chunk_index, errors.into());
    }

    pub fn override_resume(&self, info: ResumeInfo) {
        self.state.lock().unwrap().resume_override = Some(info);
    }

    /// Pretend the server already holds these chunks of `session_id`
    pub fn seed_session(&self, session_id: &str, total_chunks: u32, received: &[u32]) {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.entry(session_id.to_string()).or_default();
        session.total_chunks = total_chunks;
        for index in received {
            session.received.insert(*index, format!("etag-{}-{}", session_id, index));
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn chunk_calls(&self, session_id: &str) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Chunk {
                    session_id: id,
                    chunk_index,
                } if id == session_id => Some(chunk_index),
                _ => None,
            })
            .collect()
    }

    pub fn complete_calls(&self) -> Vec<(String, Vec<u32>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Complete { session_id, chunks } => Some((session_id, chunks)),
                _ => None,
            })
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_for_session(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .peak_per_session
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_sessions(&self) -> usize {
        self.state.lock().unwrap().peak_sessions
    }

    fn enter_chunk(&self, session_id: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let count = state
            .in_flight_per_session
            .entry(session_id.to_string())
            .or_insert(0);
        *count += 1;
        let count = *count;
        let peak = state
            .peak_per_session
            .entry(session_id.to_string())
            .or_insert(0);
        *peak = (*peak).max(count);

        let active = state.in_flight_per_session.values().filter(|c| **c > 0).count();
        state.peak_sessions = state.peak_sessions.max(active);
    }

    fn leave_chunk(&self, session_id: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.in_flight_per_session.get_mut(session_id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl UploadApi for FakeUploadApi {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Init {
            file_name: request.file_name.clone(),
        });

        state.next_session += 1;
        let session_id = format!("session-{}", state.next_session);
        let total_chunks = request.file_size.div_ceil(request.chunk_size) as u32;
        state.sessions.insert(
            session_id.clone(),
            ServerSession {
                total_chunks,
                received: BTreeMap::new(),
            },
        );

        Ok(InitResponse {
            session_id: session_id.clone(),
            upload_id: format!("upload-{}", session_id),
            file_key: format!("uploads/{}/{}", session_id, request.file_name),
            total_chunks,
            expires_at: Some(Utc::now() + ChronoDuration::hours(24)),
            resume_info: None,
        })
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkMetadata,
        _data: Vec<u8>,
    ) -> Result<ChunkReceipt, UploadError> {
        self.state.lock().unwrap().calls.push(Call::Chunk {
            session_id: session_id.to_string(),
            chunk_index: chunk.chunk_index,
        });

        self.enter_chunk(session_id);
        let delay = *self.chunk_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.leave_chunk(session_id);

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state
            .chunk_failures
            .get_mut(&chunk.chunk_index)
            .and_then(|script| script.pop_front())
        {
            return Err(err);
        }

        let etag = format!("etag-{}-{}", session_id, chunk.chunk_index);
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.received.insert(chunk.chunk_index, etag.clone());
        }
        Ok(ChunkReceipt {
            etag,
            checksum: chunk.checksum.clone(),
        })
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Complete {
            session_id: request.session_id.clone(),
            chunks: request.chunks.iter().map(|c| c.chunk_index).collect(),
        });

        Ok(CompleteResponse {
            url: format!("https://cdn.example.test/{}", request.session_id),
            key: format!("uploads/{}", request.session_id),
            size: 0,
            filename: request.session_id.clone(),
            content_type: "application/octet-stream".to_string(),
        })
    }

    async fn resume_info(&self, session_id: &str) -> Result<ResumeInfo, UploadError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Resume {
            session_id: session_id.to_string(),
        });

        if let Some(info) = state.resume_override.clone() {
            return Ok(info);
        }

        let session = state.sessions.get(session_id).ok_or_else(|| {
            UploadError::server(404, format!("unknown session {}", session_id))
        })?;
        let uploaded: Vec<u32> = session.received.keys().copied().collect();
        let remaining: Vec<u32> = (0..session.total_chunks)
            .filter(|i| !session.received.contains_key(i))
            .collect();

        Ok(ResumeInfo {
            can_resume: true,
            next_chunk_index: remaining.first().copied(),
            uploaded_chunks: uploaded,
            remaining_chunks: remaining,
            reason: None,
        })
    }

    async fn abort(&self, session_id: &str, _reason: Option<&str>) -> Result<(), UploadError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Abort {
            session_id: session_id.to_string(),
        });
        state.sessions.remove(session_id);
        Ok(())
    }
}

/// Defaults with millisecond backoff so retry tests run fast
pub fn test_config() -> UploaderConfig {
    UploaderConfig {
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        ..UploaderConfig::default()
    }
}

pub fn engine_with(
    config: UploaderConfig,
    api: Arc<FakeUploadApi>,
    store: Arc<dyn SessionStore>,
) -> UploadEngine {
    UploadEngine::new(config, api, store)
}

pub fn pdf_bytes(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
