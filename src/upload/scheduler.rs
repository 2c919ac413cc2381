//! Queue scheduler.
//!
//! Feeds queued files into free upload slots. Wakes whenever something is
//! enqueued or any upload slot is released, so there is no polling interval.
//!
//! Dispatched tickets stay linked to their session id until the upload
//! settles, so a running queued upload can still be paused or cancelled by
//! ticket.

use super::concurrency::{ConcurrencyController, UploadSlot};
use super::queue::{QueueItem, UploadQueue};
use super::session_manager::SessionManager;
use super::types::{CompletedUploadResult, UploadCategory, UploadFile, UploadOptions};
use crate::error::{ErrorCode, UploadError};
use crate::events::{EventBus, EventPayload};
use crate::logging::{log_error, log_info, log_warn};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Notify};

/// A dispatched ticket whose upload has not settled yet
#[derive(Debug, Default)]
struct RunningTicket {
    session_id: Option<String>,
    /// Cancel requested before the session existed, with its reason
    pending_cancel: Option<Option<String>>,
}

/// How a cancel request for a ticket was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketCancel {
    /// Not a running ticket
    NotRunning,
    /// Still initialising. The upload is cancelled as soon as its session exists.
    Deferred,
    /// Running under this session id
    Session(String),
}

#[derive(Clone)]
pub struct QueueScheduler {
    queue: UploadQueue,
    sessions: SessionManager,
    concurrency: ConcurrencyController,
    events: EventBus,
    running: Arc<Mutex<HashMap<String, RunningTicket>>>,
    wake: Arc<Notify>,
    is_running: Arc<AtomicBool>,
}

impl QueueScheduler {
    pub fn new(
        queue: UploadQueue,
        sessions: SessionManager,
        concurrency: ConcurrencyController,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            sessions,
            concurrency,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the dispatch loop. Returns false if it is already running.
    pub fn start(&self, shutdown: broadcast::Receiver<()>) -> bool {
        if !self.try_start() {
            return false;
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            log_info("upload-queue", "Queue scheduler started");
            scheduler.run_loop(shutdown).await;
            scheduler.is_running.store(false, Ordering::SeqCst);
            log_info("upload-queue", "Queue scheduler stopped");
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Ask the loop to look at the queue again
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Session id of a dispatched ticket, once its session has been created
    pub fn session_for_ticket(&self, ticket_id: &str) -> Option<String> {
        self.lock_running()
            .get(ticket_id)
            .and_then(|ticket| ticket.session_id.clone())
    }

    /// True while a dispatched ticket's upload has not settled
    pub fn is_running_ticket(&self, ticket_id: &str) -> bool {
        self.lock_running().contains_key(ticket_id)
    }

    /// Route a cancel for `ticket_id`. A ticket still initialising is
    /// cancelled by its own task once the session exists.
    pub fn request_cancel(&self, ticket_id: &str, reason: Option<&str>) -> TicketCancel {
        let mut running = self.lock_running();
        match running.get_mut(ticket_id) {
            None => TicketCancel::NotRunning,
            Some(RunningTicket {
                session_id: Some(session_id),
                ..
            }) => TicketCancel::Session(session_id.clone()),
            Some(ticket) => {
                ticket.pending_cancel = Some(reason.map(str::to_string));
                TicketCancel::Deferred
            }
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, RunningTicket>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_start(&self) -> bool {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn run_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let released = self.concurrency.slot_released();
        loop {
            self.fill_slots();

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.wake.notified() => {}
                _ = released.notified() => {}
            }
        }
    }

    /// Dispatch queued items while upload slots are free
    fn fill_slots(&self) {
        while !self.queue.is_empty() {
            // Slot first, then dequeue, so an item is never taken without somewhere to run
            let Some(slot) = self.concurrency.try_acquire_slot() else {
                break;
            };
            // Registered under the same lock as the dequeue, so a concurrent
            // cancel finds the ticket either queued or running
            let item = {
                let mut running = self.lock_running();
                let Some(item) = self.queue.dequeue_next() else {
                    break;
                };
                running.insert(item.ticket_id.clone(), RunningTicket::default());
                item
            };
            self.spawn_upload_task(item, slot);
        }
    }

    fn spawn_upload_task(&self, item: QueueItem, slot: UploadSlot) {
        self.queue.mark_started();
        log_info(
            "upload-queue",
            &format!("Starting queued upload {} ({})", item.file.name, item.ticket_id),
        );
        self.events.emit(EventPayload::QueueStarted {
            ticket_id: item.ticket_id.clone(),
            file_name: item.file.name.clone(),
        });
        self.emit_stats();

        let scheduler = self.clone();
        let (file, category, options) = (item.file.clone(), item.category, item.options.clone());
        tokio::spawn(async move {
            let outcome = scheduler
                .run_item(&item.ticket_id, file, category, options, slot)
                .await;
            scheduler.lock_running().remove(&item.ticket_id);

            match &outcome {
                Ok(result) => scheduler.handle_upload_success(&item, result),
                Err(error) => scheduler.handle_upload_failure(&item, error),
            }
            scheduler.queue.mark_finished(outcome.is_ok());

            let ticket_id = item.ticket_id.clone();
            if catch_unwind(AssertUnwindSafe(|| item.deliver(&outcome))).is_err() {
                log_error(
                    "upload-queue",
                    &format!("Callback for queued upload {} panicked", ticket_id),
                );
            }

            scheduler.emit_stats();
            scheduler.notify();
        });
    }

    async fn run_item(
        &self,
        ticket_id: &str,
        file: UploadFile,
        category: UploadCategory,
        options: UploadOptions,
        slot: UploadSlot,
    ) -> Result<CompletedUploadResult, UploadError> {
        let session = self
            .sessions
            .initialize_session(file.clone(), category, &options)
            .await?;
        let session_id = session.session_id;

        let pending_cancel = match self.lock_running().get_mut(ticket_id) {
            Some(ticket) => {
                ticket.session_id = Some(session_id.clone());
                ticket.pending_cancel.take()
            }
            None => None,
        };

        if let Some(reason) = pending_cancel {
            if let Err(e) = self.sessions.cancel(&session_id, reason.as_deref()).await {
                log_warn(
                    "upload-queue",
                    &format!("Deferred cancel of {} failed: {}", session_id, e),
                );
            }
            return Err(UploadError::cancelled(&session_id));
        }

        // A cancel by ticket can remove the session before the upload starts
        self.sessions
            .perform_upload(&session_id, file, slot)
            .await
            .map_err(|e| match e.code {
                ErrorCode::SessionNotFound => UploadError::cancelled(&session_id),
                _ => e,
            })
    }

    fn handle_upload_success(&self, item: &QueueItem, result: &CompletedUploadResult) {
        log_info(
            "upload-queue",
            &format!(
                "Upload successful: {} ({} bytes) -> {}",
                item.file.name, result.size, result.url
            ),
        );
    }

    fn handle_upload_failure(&self, item: &QueueItem, error: &UploadError) {
        if error.recoverable {
            log_warn(
                "upload-queue",
                &format!("Upload stopped: {} - {}", item.file.name, error),
            );
        } else {
            log_error(
                "upload-queue",
                &format!("Upload failed: {} - {}", item.file.name, error),
            );
        }
    }

    pub fn emit_stats(&self) {
        self.events.emit(EventPayload::QueueStats {
            stats: self.queue.stats(),
        });
    }
}
