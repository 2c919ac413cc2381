//! Upload session lifecycle.
//!
//! `SessionManager` is the only writer of `UploadSession` state. It creates
//! sessions, records chunk acknowledgements, drives pause/resume/cancel and
//! snapshots every change to the `SessionStore`.
//!
//! The session map sits behind a `std::sync::Mutex` that is never held across
//! an await. Events are emitted after the lock is released.

use super::api::{ChunkReceipt, CompleteRequest, CompletedChunk, InitRequest, ResumeInfo, UploadApi};
use super::chunker::{select_chunk_size, split, total_chunks};
use super::concurrency::{ConcurrencyController, UploadSlot};
use super::store::{session_key, SessionStore, SESSION_KEY_PREFIX};
use super::transport::ChunkTransport;
use super::types::{
    ChunkMetadata, CompletedUploadResult, SessionStatus, UploadCategory, UploadFile, UploadOptions,
    UploadSession,
};
use crate::config::UploaderConfig;
use crate::error::{ErrorCode, StoreError, UploadError};
use crate::events::{EventBus, EventPayload};
use crate::logging::{log_debug, log_error, log_info, log_warn};
use crate::validation::validate_file;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct ActiveSession {
    session: UploadSession,
    /// Source bytes; reopened from `session.file_path` after a restart
    file: Option<UploadFile>,
    cancel: CancellationToken,
    /// True while an attempt is dispatching or draining chunks.
    /// Dropped with the session, which wakes waiters with an error.
    attempt: watch::Sender<bool>,
}

impl ActiveSession {
    fn new(session: UploadSession, file: Option<UploadFile>) -> Self {
        Self {
            session,
            file,
            cancel: CancellationToken::new(),
            attempt: watch::channel(false).0,
        }
    }
}

struct Inner {
    config: Arc<UploaderConfig>,
    api: Arc<dyn UploadApi>,
    store: Arc<dyn SessionStore>,
    transport: ChunkTransport,
    concurrency: ConcurrencyController,
    events: EventBus,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

type ChunkOutcome = (u32, Result<ChunkReceipt, UploadError>);

impl SessionManager {
    pub fn new(
        config: Arc<UploaderConfig>,
        api: Arc<dyn UploadApi>,
        store: Arc<dyn SessionStore>,
        transport: ChunkTransport,
        concurrency: ConcurrencyController,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                api,
                store,
                transport,
                concurrency,
                events,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, ActiveSession>> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, session: &UploadSession) {
        let result = serde_json::to_string(session)
            .map_err(StoreError::from)
            .and_then(|json| self.inner.store.set(&session_key(&session.session_id), &json));

        if let Err(e) = result {
            log_warn(
                "session-manager",
                &format!("Failed to persist session {}: {}", session.session_id, e),
            );
        }
    }

    fn forget(&self, session_id: &str) {
        if let Err(e) = self.inner.store.delete(&session_key(session_id)) {
            log_warn(
                "session-manager",
                &format!("Failed to delete stored session {}: {}", session_id, e),
            );
        }
    }

    /// Validate a file, register it with the server and start tracking the session
    pub async fn initialize_session(
        &self,
        file: UploadFile,
        category: UploadCategory,
        options: &UploadOptions,
    ) -> Result<UploadSession, UploadError> {
        let config = &self.inner.config;
        validate_file(&file, category, config)?;

        let chunk_size = options
            .chunk_size
            .unwrap_or_else(|| select_chunk_size(category, file.size, &config.chunk_sizes));
        // Rejects a zero size, or one so small the chunk count overflows
        let expected_chunks = total_chunks(file.size, chunk_size)?;

        let request = InitRequest {
            file_name: file.name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            category,
            chunk_size,
            metadata: options.metadata.clone(),
            pitch_id: options.pitch_id.clone(),
            require_nda: options.require_nda,
        };
        let response = self.inner.api.init(&request).await?;

        if response.total_chunks != expected_chunks {
            return Err(UploadError::new(
                ErrorCode::ServerError,
                format!(
                    "Server expects {} chunks but '{}' splits into {}",
                    response.total_chunks, file.name, expected_chunks
                ),
                false,
            )
            .with_session(&response.session_id));
        }

        let now = Utc::now();
        let mut session = UploadSession {
            session_id: response.session_id.clone(),
            upload_id: response.upload_id,
            file_key: response.file_key,
            file_name: file.name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            category,
            chunk_size,
            total_chunks: expected_chunks,
            uploaded_chunks: BTreeSet::new(),
            chunk_etags: Default::default(),
            status: SessionStatus::Initializing,
            created_at: now,
            updated_at: now,
            expires_at: response
                .expires_at
                .unwrap_or_else(|| now + config.session_expiry()),
            metadata: options.metadata.clone(),
            file_path: file.path().map(Path::to_path_buf),
            last_error: None,
        };

        if let Some(info) = response.resume_info.as_ref().filter(|info| info.can_resume) {
            merge_server_chunks(&mut session, info);
        }

        {
            let mut sessions = self.lock_sessions();
            self.persist(&session);
            sessions.insert(
                session.session_id.clone(),
                ActiveSession::new(session.clone(), Some(file)),
            );
        }

        log_info(
            "session-manager",
            &format!(
                "Created session {} for '{}' ({} bytes, {} chunks of {})",
                session.session_id, session.file_name, session.file_size, session.total_chunks, chunk_size
            ),
        );
        self.inner.events.emit(EventPayload::SessionCreated {
            session_id: session.session_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            total_chunks: session.total_chunks,
        });

        Ok(session)
    }

    /// Upload every chunk not yet acknowledged, then complete the session.
    ///
    /// Holds `slot` for the duration of the attempt.
    pub async fn perform_upload(
        &self,
        session_id: &str,
        file: UploadFile,
        slot: UploadSlot,
    ) -> Result<CompletedUploadResult, UploadError> {
        {
            let mut sessions = self.lock_sessions();
            let active = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::not_found(session_id))?;
            active.file = Some(file);
        }
        self.drive(session_id, slot).await
    }

    /// Stop dispatching new chunks. In-flight chunks still land and are recorded.
    pub fn pause(&self, session_id: &str) -> Result<UploadSession, UploadError> {
        let snapshot = {
            let mut sessions = self.lock_sessions();
            let active = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::not_found(session_id))?;

            match active.session.status {
                SessionStatus::Paused => return Ok(active.session.clone()),
                SessionStatus::Uploading => {}
                other => {
                    return Err(UploadError::invalid_state(
                        session_id,
                        format!("Cannot pause a {} session", other),
                    ))
                }
            }

            active.session.status = SessionStatus::Paused;
            active.session.updated_at = Utc::now();
            self.persist(&active.session);
            active.session.clone()
        };

        log_info("session-manager", &format!("Paused session {}", session_id));
        self.inner.events.emit(EventPayload::SessionPaused {
            session_id: session_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Reconcile with the server and upload whatever is still missing.
    ///
    /// A paused session whose last attempt is still draining in-flight chunks
    /// is resumed once that attempt has finished.
    pub async fn resume(
        &self,
        session_id: &str,
        slot: UploadSlot,
    ) -> Result<CompletedUploadResult, UploadError> {
        self.ensure_loaded(session_id)?;

        while let Some(mut attempt) = self.resumable(session_id)? {
            log_debug(
                "session-manager",
                &format!("Waiting for paused attempt of {} to drain", session_id),
            );
            let drained = attempt.wait_for(|running| !*running).await.is_ok();
            if !drained {
                // The session was dropped while we waited
                return Err(UploadError::cancelled(session_id));
            }
        }

        let info = self
            .inner
            .api
            .resume_info(session_id)
            .await
            .map_err(|e| e.with_session(session_id))?;

        if !info.can_resume {
            let reason = info
                .reason
                .unwrap_or_else(|| "Server can no longer resume this session".to_string());
            let error = UploadError::session_expired(session_id, reason);
            self.mark_failed(session_id, &error);
            return Err(error);
        }

        let remaining = {
            let mut sessions = self.lock_sessions();
            let active = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::cancelled(session_id))?;
            merge_server_chunks(&mut active.session, &info);
            active.session.updated_at = Utc::now();
            self.persist(&active.session);
            active.session.remaining_chunks().len() as u32
        };

        log_info(
            "session-manager",
            &format!("Resuming session {} with {} chunk(s) left", session_id, remaining),
        );
        self.inner.events.emit(EventPayload::SessionResumed {
            session_id: session_id.to_string(),
            remaining_chunks: remaining,
        });

        self.drive(session_id, slot).await
    }

    /// Check that `session_id` can be resumed. Returns a receiver to wait on
    /// when a paused attempt is still running.
    fn resumable(&self, session_id: &str) -> Result<Option<watch::Receiver<bool>>, UploadError> {
        let sessions = self.lock_sessions();
        let active = sessions
            .get(session_id)
            .ok_or_else(|| UploadError::not_found(session_id))?;

        if matches!(
            active.session.status,
            SessionStatus::Completed | SessionStatus::Cancelled
        ) {
            return Err(UploadError::invalid_state(
                session_id,
                format!("Cannot resume a {} session", active.session.status),
            ));
        }
        if !*active.attempt.borrow() {
            return Ok(None);
        }
        if active.session.status == SessionStatus::Paused {
            return Ok(Some(active.attempt.subscribe()));
        }
        Err(UploadError::invalid_state(session_id, "Upload already in progress"))
    }

    /// Cancel a session: stop its chunks, drop it locally and ask the server to abort
    pub async fn cancel(&self, session_id: &str, reason: Option<&str>) -> Result<(), UploadError> {
        self.ensure_loaded(session_id)?;

        {
            let mut sessions = self.lock_sessions();
            match sessions.get(session_id) {
                None => return Err(UploadError::not_found(session_id)),
                Some(active) if active.session.status.is_terminal() => {
                    return Err(UploadError::invalid_state(
                        session_id,
                        format!("Cannot cancel a {} session", active.session.status),
                    ))
                }
                Some(_) => {}
            }
            if let Some(active) = sessions.remove(session_id) {
                active.cancel.cancel();
            }
            self.forget(session_id);
        }

        log_info("session-manager", &format!("Cancelled session {}", session_id));
        self.inner.events.emit(EventPayload::SessionCancelled {
            session_id: session_id.to_string(),
            reason: reason.map(str::to_string),
        });

        if let Err(e) = self.inner.api.abort(session_id, reason).await {
            log_warn(
                "session-manager",
                &format!("Abort request for {} failed: {}", session_id, e),
            );
        }
        Ok(())
    }

    /// Load unexpired snapshots from the store. Interrupted uploads come back paused.
    pub fn rehydrate(&self) -> Result<usize, UploadError> {
        let now = Utc::now();
        let mut restored = 0;

        for key in self.inner.store.keys(SESSION_KEY_PREFIX)? {
            let Some(raw) = self.inner.store.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<UploadSession>(&raw) {
                Ok(session) => {
                    if self.adopt(session, now) {
                        restored += 1;
                    }
                }
                Err(e) => {
                    log_warn(
                        "session-manager",
                        &format!("Dropping unreadable snapshot {}: {}", key, e),
                    );
                    if let Err(e) = self.inner.store.delete(&key) {
                        log_warn("session-manager", &format!("Failed to delete {}: {}", key, e));
                    }
                }
            }
        }

        if restored > 0 {
            log_info("session-manager", &format!("Restored {} stored session(s)", restored));
        }
        Ok(restored)
    }

    /// Track a stored snapshot. Returns false if it expired or is already tracked.
    fn adopt(&self, mut session: UploadSession, now: DateTime<Utc>) -> bool {
        if session.is_expired(now) {
            log_debug(
                "session-manager",
                &format!("Discarding expired session {}", session.session_id),
            );
            self.forget(&session.session_id);
            return false;
        }

        let mut sessions = self.lock_sessions();
        if sessions.contains_key(&session.session_id) {
            return false;
        }

        if matches!(
            session.status,
            SessionStatus::Initializing | SessionStatus::Uploading
        ) {
            session.status = SessionStatus::Paused;
            session.updated_at = now;
            self.persist(&session);
        }
        sessions.insert(session.session_id.clone(), ActiveSession::new(session, None));
        true
    }

    /// Make sure `session_id` is in memory, pulling it from the store if needed
    fn ensure_loaded(&self, session_id: &str) -> Result<(), UploadError> {
        if self.lock_sessions().contains_key(session_id) {
            return Ok(());
        }

        let raw = self
            .inner
            .store
            .get(&session_key(session_id))?
            .ok_or_else(|| UploadError::not_found(session_id))?;
        let session: UploadSession =
            serde_json::from_str(&raw).map_err(|e| UploadError::from(StoreError::from(e)))?;

        if !self.adopt(session, Utc::now()) && !self.lock_sessions().contains_key(session_id) {
            return Err(UploadError::session_expired(
                session_id,
                "Session expired before it could be resumed",
            ));
        }
        Ok(())
    }

    /// Remove expired sessions and completed ones past the retention window.
    /// Uploads still running for an expired session are cancelled.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = self.inner.config.completed_retention();

        let removed: Vec<(String, bool)> = {
            let mut sessions = self.lock_sessions();
            let doomed: Vec<String> = sessions
                .iter()
                .filter(|(_, active)| {
                    let session = &active.session;
                    session.is_expired(now)
                        || (session.status == SessionStatus::Completed
                            && session.updated_at + retention <= now)
                })
                .map(|(id, _)| id.clone())
                .collect();

            doomed
                .into_iter()
                .filter_map(|id| {
                    let active = sessions.remove(&id)?;
                    let live = !active.session.status.is_terminal();
                    if live {
                        active.cancel.cancel();
                    }
                    self.forget(&id);
                    Some((id, live))
                })
                .collect()
        };

        for (session_id, live) in &removed {
            if *live {
                self.inner.events.emit(EventPayload::SessionCancelled {
                    session_id: session_id.clone(),
                    reason: Some("expired".to_string()),
                });
            }
        }

        if !removed.is_empty() {
            log_info(
                "session-manager",
                &format!("Swept {} expired session(s)", removed.len()),
            );
        }
        removed.len()
    }

    /// Drop completed sessions from memory and the store
    pub fn clear_completed(&self) -> usize {
        let mut sessions = self.lock_sessions();
        let completed: Vec<String> = sessions
            .iter()
            .filter(|(_, active)| active.session.status == SessionStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &completed {
            sessions.remove(id);
            self.forget(id);
        }
        completed.len()
    }

    /// Stop every running attempt and forget in-memory state. Stored snapshots are kept.
    pub fn reset(&self) {
        let mut sessions = self.lock_sessions();
        for active in sessions.values() {
            active.cancel.cancel();
        }
        sessions.clear();
    }

    pub fn session(&self, session_id: &str) -> Option<UploadSession> {
        self.lock_sessions()
            .get(session_id)
            .map(|active| active.session.clone())
    }

    pub fn sessions(&self) -> Vec<UploadSession> {
        let mut all: Vec<UploadSession> = self
            .lock_sessions()
            .values()
            .map(|active| active.session.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    async fn drive(
        &self,
        session_id: &str,
        _slot: UploadSlot,
    ) -> Result<CompletedUploadResult, UploadError> {
        let (file, cancel) = self.begin_attempt(session_id)?;
        let result = self.run_attempt(session_id, &file, &cancel).await;

        if let Err(error) = &result {
            if error.code != ErrorCode::UploadPaused && !error.is_cancelled() {
                self.mark_failed(session_id, error);
            }
        }

        if let Some(active) = self.lock_sessions().get(session_id) {
            active.attempt.send_replace(false);
        }
        result
    }

    /// Move the session into `uploading` and hand out the file and a cancel token
    fn begin_attempt(&self, session_id: &str) -> Result<(UploadFile, CancellationToken), UploadError> {
        let mut sessions = self.lock_sessions();
        let active = sessions
            .get_mut(session_id)
            .ok_or_else(|| UploadError::not_found(session_id))?;

        if *active.attempt.borrow() {
            return Err(UploadError::invalid_state(session_id, "Upload already in progress"));
        }
        if matches!(
            active.session.status,
            SessionStatus::Completed | SessionStatus::Cancelled
        ) {
            return Err(UploadError::invalid_state(
                session_id,
                format!("Session is already {}", active.session.status),
            ));
        }

        let file = match &active.file {
            Some(file) => file.clone(),
            None => {
                let path = active.session.file_path.clone().ok_or_else(|| {
                    UploadError::invalid_state(session_id, "No local file recorded for session")
                })?;
                let mut file = UploadFile::from_path(&path).map_err(|e| {
                    UploadError::validation(format!("Cannot open '{}': {}", path.display(), e))
                        .with_session(session_id)
                })?;
                file.mime_type = active.session.mime_type.clone();
                active.file = Some(file.clone());
                file
            }
        };

        if file.size != active.session.file_size {
            return Err(UploadError::validation(format!(
                "'{}' is {} bytes but the session expects {}",
                file.name, file.size, active.session.file_size
            ))
            .with_session(session_id));
        }

        // Failed sessions may be retried as a fresh attempt
        active.session.status = SessionStatus::Uploading;
        active.session.last_error = None;
        active.session.updated_at = Utc::now();
        active.attempt.send_replace(true);
        if active.cancel.is_cancelled() {
            active.cancel = CancellationToken::new();
        }
        self.persist(&active.session);

        Ok((file, active.cancel.child_token()))
    }

    async fn run_attempt(
        &self,
        session_id: &str,
        file: &UploadFile,
        cancel: &CancellationToken,
    ) -> Result<CompletedUploadResult, UploadError> {
        let (chunk_size, remaining) = {
            let sessions = self.lock_sessions();
            let active = sessions
                .get(session_id)
                .ok_or_else(|| UploadError::cancelled(session_id))?;
            let remaining: BTreeSet<u32> = active.session.remaining_chunks().into_iter().collect();
            (active.session.chunk_size, remaining)
        };

        let mut pending: VecDeque<ChunkMetadata> = if remaining.is_empty() {
            VecDeque::new()
        } else {
            split(file, chunk_size)
                .await
                .map_err(|e| e.with_session(session_id))?
                .into_iter()
                .filter(|chunk| remaining.contains(&chunk.chunk_index))
                .collect()
        };

        let mut pool = self.inner.concurrency.chunk_pool::<ChunkOutcome>();
        let mut failure: Option<UploadError> = None;

        loop {
            while failure.is_none() && pool.has_capacity() && self.is_uploading(session_id) {
                let Some(chunk) = pending.pop_front() else {
                    break;
                };
                let transport = self.inner.transport.clone();
                let file = file.clone();
                let token = cancel.clone();
                let sid = session_id.to_string();
                pool.spawn(async move {
                    let result = transport.upload_chunk(&sid, &chunk, &file, &token).await;
                    (chunk.chunk_index, result)
                });
            }

            match pool.next().await {
                None => break,
                Some(Ok((index, Ok(receipt)))) => self.record_chunk(session_id, index, receipt),
                Some(Ok((_, Err(error)))) => {
                    if failure.is_none() && !error.is_cancelled() {
                        // Stop the siblings; the session fails as a whole
                        cancel.cancel();
                        failure = Some(error);
                    }
                }
                Some(Err(join_error)) => {
                    if failure.is_none() {
                        cancel.cancel();
                        failure = Some(
                            UploadError::new(
                                ErrorCode::InvalidState,
                                format!("Chunk task aborted: {}", join_error),
                                false,
                            )
                            .with_session(session_id),
                        );
                    }
                }
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        match self.session(session_id).map(|s| s.status) {
            None | Some(SessionStatus::Cancelled) => return Err(UploadError::cancelled(session_id)),
            Some(SessionStatus::Paused) => return Err(UploadError::paused(session_id)),
            _ => {}
        }
        if cancel.is_cancelled() {
            return Err(UploadError::cancelled(session_id));
        }

        self.complete(session_id, cancel).await
    }

    fn is_uploading(&self, session_id: &str) -> bool {
        self.lock_sessions()
            .get(session_id)
            .is_some_and(|active| active.session.status == SessionStatus::Uploading)
    }

    fn record_chunk(&self, session_id: &str, index: u32, receipt: ChunkReceipt) {
        let progress = {
            let mut sessions = self.lock_sessions();
            let Some(active) = sessions.get_mut(session_id) else {
                return;
            };
            if active.session.status.is_terminal() {
                return;
            }

            let session = &mut active.session;
            session.uploaded_chunks.insert(index);
            session.chunk_etags.insert(index, receipt.etag);
            session.updated_at = Utc::now();
            self.persist(session);

            EventPayload::SessionProgress {
                session_id: session_id.to_string(),
                uploaded_chunks: session.uploaded_chunks.len() as u32,
                total_chunks: session.total_chunks,
                uploaded_bytes: session.uploaded_bytes(),
                total_bytes: session.file_size,
                percent: session.progress_percent(),
            }
        };
        self.inner.events.emit(progress);
    }

    async fn complete(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletedUploadResult, UploadError> {
        let request = {
            let sessions = self.lock_sessions();
            let session = &sessions
                .get(session_id)
                .ok_or_else(|| UploadError::cancelled(session_id))?
                .session;

            if !session.is_complete() {
                return Err(UploadError::invalid_state(
                    session_id,
                    format!(
                        "Only {} of {} chunks acknowledged",
                        session.uploaded_chunks.len(),
                        session.total_chunks
                    ),
                ));
            }

            // BTreeSet iteration keeps the chunk list ascending
            CompleteRequest {
                session_id: session_id.to_string(),
                chunks: session
                    .uploaded_chunks
                    .iter()
                    .map(|index| CompletedChunk {
                        chunk_index: *index,
                        etag: session.chunk_etags.get(index).cloned(),
                    })
                    .collect(),
            }
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::cancelled(session_id)),
            response = self.inner.api.complete(&request) => {
                response.map_err(|e| e.with_session(session_id))?
            }
        };
        let result = response.into_result(session_id);

        let completed = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(session_id) {
                // The server has assembled the file; a late pause does not undo that
                Some(active) if !active.session.status.is_terminal() => {
                    active.session.status = SessionStatus::Completed;
                    active.session.last_error = None;
                    active.session.updated_at = Utc::now();
                    self.persist(&active.session);
                    true
                }
                _ => false,
            }
        };
        if !completed {
            return Err(UploadError::cancelled(session_id));
        }

        log_info(
            "session-manager",
            &format!("Completed session {} -> {}", session_id, result.url),
        );
        self.inner.events.emit(EventPayload::SessionCompleted {
            session_id: session_id.to_string(),
            url: result.url.clone(),
            key: result.key.clone(),
        });
        Ok(result)
    }

    fn mark_failed(&self, session_id: &str, error: &UploadError) {
        let failed = {
            let mut sessions = self.lock_sessions();
            let Some(active) = sessions.get_mut(session_id) else {
                return;
            };
            let status = active.session.status;
            if status != SessionStatus::Failed && !status.can_transition_to(SessionStatus::Failed) {
                return;
            }
            active.session.status = SessionStatus::Failed;
            active.session.last_error = Some(error.to_string());
            active.session.updated_at = Utc::now();
            self.persist(&active.session);
            true
        };

        if failed {
            log_error(
                "session-manager",
                &format!("Session {} failed: {}", session_id, error),
            );
            self.inner.events.emit(EventPayload::SessionFailed {
                session_id: session_id.to_string(),
                error: error.clone().with_session(session_id),
            });
        }
    }
}

/// `uploaded = (local ∪ server.uploaded) − server.remaining`, restricted to valid indices
fn merge_server_chunks(session: &mut UploadSession, info: &ResumeInfo) {
    let total = session.total_chunks;
    session
        .uploaded_chunks
        .extend(info.uploaded_chunks.iter().copied().filter(|index| *index < total));
    for index in &info.remaining_chunks {
        session.uploaded_chunks.remove(index);
    }

    let uploaded = &session.uploaded_chunks;
    session.chunk_etags.retain(|index, _| uploaded.contains(index));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::api::{CompleteResponse, InitResponse};
    use crate::upload::retry::RetryPolicy;
    use crate::upload::store::MemorySessionStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::BTreeMap;

    struct OfflineApi;

    #[async_trait]
    impl UploadApi for OfflineApi {
        async fn init(&self, _: &InitRequest) -> Result<InitResponse, UploadError> {
            Err(UploadError::network("offline"))
        }

        async fn upload_chunk(
            &self,
            _: &str,
            _: &ChunkMetadata,
            _: Vec<u8>,
        ) -> Result<ChunkReceipt, UploadError> {
            Err(UploadError::network("offline"))
        }

        async fn complete(&self, _: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
            Err(UploadError::network("offline"))
        }

        async fn resume_info(&self, _: &str) -> Result<ResumeInfo, UploadError> {
            Err(UploadError::network("offline"))
        }

        async fn abort(&self, _: &str, _: Option<&str>) -> Result<(), UploadError> {
            Ok(())
        }
    }

    fn manager(store: Arc<MemorySessionStore>) -> SessionManager {
        let config = Arc::new(UploaderConfig::default());
        let api: Arc<dyn UploadApi> = Arc::new(OfflineApi);
        let events = EventBus::default();
        let transport = ChunkTransport::new(api.clone(), RetryPolicy::default(), events.clone());
        SessionManager::new(
            config,
            api,
            store,
            transport,
            ConcurrencyController::new(2, 3),
            events,
        )
    }

    fn stored_session(id: &str, status: SessionStatus, expires_in: Duration) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            session_id: id.to_string(),
            upload_id: format!("upload-{}", id),
            file_key: format!("files/{}", id),
            file_name: "deck.pdf".to_string(),
            file_size: 10,
            mime_type: "application/pdf".to_string(),
            category: UploadCategory::Document,
            chunk_size: 2,
            total_chunks: 5,
            uploaded_chunks: [0, 1].into_iter().collect(),
            chunk_etags: BTreeMap::from([(0, "e0".to_string()), (1, "e1".to_string())]),
            status,
            created_at: now,
            updated_at: now,
            expires_at: now + expires_in,
            metadata: None,
            file_path: None,
            last_error: None,
        }
    }

    fn put(store: &MemorySessionStore, session: &UploadSession) {
        store
            .set(&session_key(&session.session_id), &serde_json::to_string(session).unwrap())
            .unwrap();
    }

    #[test]
    fn test_merge_server_chunks() {
        let mut session = stored_session("s", SessionStatus::Paused, Duration::hours(1));
        let info = ResumeInfo {
            can_resume: true,
            uploaded_chunks: vec![2, 9],
            remaining_chunks: vec![1, 3, 4],
            next_chunk_index: Some(1),
            reason: None,
        };

        merge_server_chunks(&mut session, &info);

        assert_eq!(session.uploaded_chunks, BTreeSet::from([0, 2]));
        assert_eq!(session.chunk_etags.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(session.remaining_chunks(), vec![1, 3, 4]);
    }

    #[test]
    fn test_rehydrate_pauses_interrupted_and_drops_expired() {
        let store = Arc::new(MemorySessionStore::new());
        put(&store, &stored_session("live", SessionStatus::Uploading, Duration::hours(1)));
        put(&store, &stored_session("old", SessionStatus::Paused, Duration::hours(-1)));
        store.set("upload-session:junk", "not json").unwrap();

        let manager = manager(store.clone());
        assert_eq!(manager.rehydrate().unwrap(), 1);

        let live = manager.session("live").unwrap();
        assert_eq!(live.status, SessionStatus::Paused);
        assert_eq!(live.uploaded_chunks, BTreeSet::from([0, 1]));
        assert!(manager.session("old").is_none());
        assert_eq!(store.keys(SESSION_KEY_PREFIX).unwrap(), vec!["upload-session:live".to_string()]);
    }

    #[test]
    fn test_pause_requires_uploading() {
        let store = Arc::new(MemorySessionStore::new());
        put(&store, &stored_session("s", SessionStatus::Paused, Duration::hours(1)));
        let manager = manager(store);
        manager.rehydrate().unwrap();

        // Already paused is a no-op
        assert_eq!(manager.pause("s").unwrap().status, SessionStatus::Paused);
        assert_eq!(manager.pause("missing").unwrap_err().code, ErrorCode::SessionNotFound);
    }

    #[test]
    fn test_sweep_removes_expired_and_stale_completed() {
        let store = Arc::new(MemorySessionStore::new());
        let mut done = stored_session("done", SessionStatus::Completed, Duration::hours(10));
        done.updated_at = Utc::now() - Duration::hours(2);
        put(&store, &done);
        put(&store, &stored_session("keep", SessionStatus::Paused, Duration::hours(10)));
        put(&store, &stored_session("soon", SessionStatus::Paused, Duration::minutes(30)));

        let manager = manager(store.clone());
        assert_eq!(manager.rehydrate().unwrap(), 3);

        let removed = manager.sweep_expired(Utc::now() + Duration::hours(1));
        assert_eq!(removed, 2);
        assert!(manager.session("keep").is_some());
        assert!(manager.session("done").is_none());
        assert!(manager.session("soon").is_none());
        assert_eq!(store.keys(SESSION_KEY_PREFIX).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_loads_from_store_and_surfaces_api_errors() {
        let store = Arc::new(MemorySessionStore::new());
        put(&store, &stored_session("s", SessionStatus::Paused, Duration::hours(1)));
        let manager = manager(store);

        // Loaded straight from the store on demand; the offline API refuses resume-info
        let slot = ConcurrencyController::new(1, 1).acquire_slot().await;
        let err = manager.resume("s", slot).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(manager.session("s").unwrap().status, SessionStatus::Paused);
    }
}
