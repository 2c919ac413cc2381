//! Priority-ordered backlog of whole-file uploads.

use super::types::{
    CompletedUploadResult, CompletionCallback, ErrorCallback, Priority, QueueStats, UploadCategory,
    UploadFile, UploadOptions,
};
use crate::error::UploadError;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A pending upload and what to do with its outcome
pub struct QueueItem {
    pub ticket_id: String,
    pub file: UploadFile,
    pub category: UploadCategory,
    pub options: UploadOptions,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
    on_complete: Option<CompletionCallback>,
    on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("ticket_id", &self.ticket_id)
            .field("file", &self.file.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

impl QueueItem {
    pub fn new(file: UploadFile, category: UploadCategory) -> Self {
        Self {
            ticket_id: Uuid::new_v4().to_string(),
            file,
            category,
            options: UploadOptions::default(),
            priority: Priority::default(),
            queued_at: Utc::now(),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CompletedUploadResult) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&UploadError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Hand the outcome to whichever callback applies
    pub fn deliver(mut self, outcome: &Result<CompletedUploadResult, UploadError>) {
        match outcome {
            Ok(result) => {
                if let Some(callback) = self.on_complete.take() {
                    callback(result);
                }
            }
            Err(error) => {
                if let Some(callback) = self.on_error.take() {
                    callback(error);
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct UploadQueue {
    items: Arc<Mutex<VecDeque<QueueItem>>>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("items", &"<queued items>")
            .field("stats", &self.stats())
            .finish()
    }
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert by priority band, FIFO within a band. Returns `(ticket, position)`.
    pub fn enqueue(&self, item: QueueItem) -> (String, usize) {
        let ticket = item.ticket_id.clone();
        let mut items = self.items();

        // Bands are kept contiguous: high, then normal, then low
        let position = match item.priority {
            Priority::High => items
                .iter()
                .position(|queued| queued.priority != Priority::High)
                .unwrap_or(items.len()),
            Priority::Normal => items
                .iter()
                .position(|queued| queued.priority == Priority::Low)
                .unwrap_or(items.len()),
            Priority::Low => items.len(),
        };
        items.insert(position, item);
        (ticket, position)
    }

    pub fn dequeue_next(&self) -> Option<QueueItem> {
        self.items().pop_front()
    }

    /// Take a still-pending item out of the queue
    pub fn remove(&self, ticket_id: &str) -> Option<QueueItem> {
        let mut items = self.items();
        let index = items.iter().position(|item| item.ticket_id == ticket_id)?;
        items.remove(index)
    }

    pub fn contains(&self, ticket_id: &str) -> bool {
        self.items().iter().any(|item| item.ticket_id == ticket_id)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Priorities in dispatch order
    pub fn priorities(&self) -> Vec<Priority> {
        self.items().iter().map(|item| item.priority).collect()
    }

    /// Drop every pending item without running callbacks
    pub fn clear(&self) -> usize {
        let mut items = self.items();
        let dropped = items.len();
        items.clear();
        dropped
    }

    pub(crate) fn mark_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_finished(&self, succeeded: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if succeeded {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Reset the completed/failed counters
    pub fn clear_finished(&self) {
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
    }

    pub fn stats(&self) -> QueueStats {
        let items = self.items();
        let count = |priority: Priority| items.iter().filter(|i| i.priority == priority).count();
        QueueStats {
            pending: items.len(),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            high: count(Priority::High),
            normal: count(Priority::Normal),
            low: count(Priority::Low),
        }
    }
}
