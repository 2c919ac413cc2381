// Module declarations
pub mod api;
pub mod chunker;
mod concurrency;
mod queue;
pub mod retry;
mod scheduler;
mod session_manager;
pub mod store;
mod transport;
mod types;

pub use api::{HttpUploadApi, UploadApi};
pub use concurrency::{ChunkPool, ConcurrencyController, UploadSlot};
pub use queue::{QueueItem, UploadQueue};
pub use retry::RetryPolicy;
pub use scheduler::{QueueScheduler, TicketCancel};
pub use session_manager::SessionManager;
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
pub use transport::ChunkTransport;
pub use types::*;

use crate::config::{ensure_private_dir, UploaderConfig};
use crate::error::{ErrorCode, UploadError};
use crate::events::{EventBus, EventKind, EventPayload, EventReceiver, SubscriptionId, UploadEvent};
use crate::logging::{log_info, log_warn};
use crate::shutdown::{every_until_stopped, ShutdownCoordinator};
use crate::validation::validate_file;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct EngineInner {
    config: Arc<UploaderConfig>,
    events: EventBus,
    concurrency: ConcurrencyController,
    sessions: SessionManager,
    queue: UploadQueue,
    scheduler: QueueScheduler,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
}

/// Chunked upload engine.
///
/// Owns every piece of mutable state: sessions, the queue, the concurrency
/// bounds and the event bus. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("server_url", &self.inner.config.server_url)
            .field("queue", &self.inner.queue)
            .field("events", &self.inner.events)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl UploadEngine {
    pub fn new(
        config: UploaderConfig,
        api: Arc<dyn UploadApi>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::default();
        let concurrency =
            ConcurrencyController::new(config.max_concurrent_uploads, config.max_concurrent_chunks);
        let transport = ChunkTransport::new(
            Arc::clone(&api),
            RetryPolicy::from(config.retry),
            events.clone(),
        );
        let sessions = SessionManager::new(
            Arc::clone(&config),
            api,
            store,
            transport,
            concurrency.clone(),
            events.clone(),
        );
        let queue = UploadQueue::new();
        let scheduler = QueueScheduler::new(
            queue.clone(),
            sessions.clone(),
            concurrency.clone(),
            events.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                events,
                concurrency,
                sessions,
                queue,
                scheduler,
                shutdown: ShutdownCoordinator::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Engine talking HTTP to `config.server_url`, persisting to SQLite in the state directory
    pub fn from_config(config: UploaderConfig) -> Result<Self, UploadError> {
        config
            .validate()
            .map_err(|e| UploadError::validation(e.to_string()))?;
        let api = HttpUploadApi::new(&config)?;
        let state_dir = config
            .resolved_state_dir()
            .map_err(|e| UploadError::validation(e.to_string()))?;
        ensure_private_dir(&state_dir).map_err(|e| UploadError::validation(e.to_string()))?;
        let store = SqliteSessionStore::open(&state_dir.join("sessions.db"))?;
        Ok(Self::new(config, Arc::new(api), Arc::new(store)))
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Restore stored sessions and start the background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<usize, UploadError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let restored = match self.inner.sessions.rehydrate() {
            Ok(restored) => restored,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.inner.scheduler.start(self.inner.shutdown.subscribe());
        self.spawn_sweeper();

        log_info(
            "upload-engine",
            &format!("Upload engine started ({} session(s) restored)", restored),
        );
        Ok(restored)
    }

    fn spawn_sweeper(&self) {
        let sessions = self.inner.sessions.clone();
        let period = self.inner.config.cleanup_interval();
        let stop = self.inner.shutdown.subscribe();

        tokio::spawn(every_until_stopped(period, stop, move || {
            sessions.sweep_expired(Utc::now());
            async {}
        }));
    }

    /// Stop the scheduler and sweeper. Uploads already running finish on their own.
    pub fn stop(&self) {
        if self.inner.started.swap(false, Ordering::SeqCst) {
            let loops = self.inner.shutdown.shutdown();
            log_info(
                "upload-engine",
                &format!("Upload engine stopped ({} background loop(s) signalled)", loops),
            );
        }
    }

    /// Stop, cancel every running upload and drop queued and in-memory state
    pub fn reset(&self) {
        self.stop();
        let dropped = self.inner.queue.clear();
        self.inner.queue.clear_finished();
        self.inner.sessions.reset();
        if dropped > 0 {
            log_warn(
                "upload-engine",
                &format!("Reset dropped {} queued upload(s)", dropped),
            );
        }
    }

    /// Validate, initialise and upload a file, waiting for a free upload slot first
    pub async fn upload_file(
        &self,
        file: UploadFile,
        category: UploadCategory,
        options: UploadOptions,
    ) -> Result<CompletedUploadResult, UploadError> {
        // Reject before waiting on a slot or touching the network
        validate_file(&file, category, &self.inner.config)?;

        let slot = self.inner.concurrency.acquire_slot().await;
        let session = self
            .inner
            .sessions
            .initialize_session(file.clone(), category, &options)
            .await?;
        self.inner
            .sessions
            .perform_upload(&session.session_id, file, slot)
            .await
    }

    /// Add a file to the queue and return its ticket id
    pub fn queue_upload(
        &self,
        file: UploadFile,
        category: UploadCategory,
        options: UploadOptions,
        priority: Priority,
    ) -> String {
        self.enqueue(QueueItem::new(file, category).options(options).priority(priority))
    }

    /// Add a prepared item (with callbacks) to the queue
    pub fn enqueue(&self, item: QueueItem) -> String {
        let file_name = item.file.name.clone();
        let priority = item.priority;
        let (ticket_id, position) = self.inner.queue.enqueue(item);

        self.inner.events.emit(EventPayload::QueueAdded {
            ticket_id: ticket_id.clone(),
            file_name,
            priority,
            position,
        });
        self.inner.scheduler.emit_stats();
        self.inner.scheduler.notify();
        ticket_id
    }

    /// Session id behind `id`: a running queued ticket maps to its session,
    /// anything else is taken to be a session id already
    fn resolve_session(&self, id: &str) -> Result<String, UploadError> {
        if let Some(session_id) = self.inner.scheduler.session_for_ticket(id) {
            return Ok(session_id);
        }
        if self.inner.scheduler.is_running_ticket(id) {
            return Err(UploadError::invalid_state(
                id,
                "Queued upload has not created its session yet",
            ));
        }
        Ok(id.to_string())
    }

    /// Session id of a dispatched queue ticket, while its upload is running
    pub fn session_for_ticket(&self, ticket_id: &str) -> Option<String> {
        self.inner.scheduler.session_for_ticket(ticket_id)
    }

    /// Pause a session, or the session of a running queued ticket
    pub fn pause_upload(&self, id: &str) -> Result<UploadSession, UploadError> {
        let session_id = self.resolve_session(id)?;
        self.inner.sessions.pause(&session_id)
    }

    /// Resume a paused, failed or restored session once an upload slot is free.
    ///
    /// Called right after `pause_upload`, this waits for the chunks still in
    /// flight from the paused attempt to land before reconciling with the
    /// server. The paused call itself still returns `UPLOAD_PAUSED`.
    pub async fn resume_upload(&self, id: &str) -> Result<CompletedUploadResult, UploadError> {
        let session_id = self.resolve_session(id)?;
        let slot = self.inner.concurrency.acquire_slot().await;
        self.inner.sessions.resume(&session_id, slot).await
    }

    /// Cancel a session, drop a still-queued item, or stop a running queued
    /// upload by its ticket id
    pub async fn cancel_upload(&self, id: &str, reason: Option<&str>) -> Result<(), UploadError> {
        if let Some(item) = self.inner.queue.remove(id) {
            log_info(
                "upload-engine",
                &format!("Removed {} from the queue", item.file.name),
            );
            item.deliver(&Err(UploadError::new(
                ErrorCode::UploadCancelled,
                "Upload was cancelled before it started",
                false,
            )));
            self.inner.scheduler.emit_stats();
            return Ok(());
        }

        match self.inner.scheduler.request_cancel(id, reason) {
            TicketCancel::NotRunning => self.inner.sessions.cancel(id, reason).await,
            TicketCancel::Session(session_id) => {
                self.inner.sessions.cancel(&session_id, reason).await
            }
            TicketCancel::Deferred => {
                log_info(
                    "upload-engine",
                    &format!("Ticket {} will be cancelled once its session exists", id),
                );
                Ok(())
            }
        }
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Forget completed sessions and reset the queue's finished counters
    pub fn clear_completed(&self) -> usize {
        self.inner.queue.clear_finished();
        self.inner.sessions.clear_completed()
    }

    pub fn sweep_expired_sessions(&self) -> usize {
        self.inner.sessions.sweep_expired(Utc::now())
    }

    pub fn session(&self, session_id: &str) -> Option<UploadSession> {
        self.inner.sessions.session(session_id)
    }

    pub fn sessions(&self) -> Vec<UploadSession> {
        self.inner.sessions.sessions()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}
