//! Best-effort background persistence
//!
//! The hot dispatch path must never block or fail on audit writes, so
//! bot messages, accuracy records and notification rows can be queued
//! here instead. The queue is bounded; on overflow the oldest queued
//! job is dropped with a warning. Job failures are logged and never
//! surfaced.

use crate::db::{Database, NewAccuracyRecord, NewMessage, NewNotification};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Job {
    Message(NewMessage),
    Accuracy(NewAccuracyRecord),
    Notification(NewNotification),
}

struct SpoolInner {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Clone)]
pub struct Spool {
    inner: Arc<SpoolInner>,
}

impl Spool {
    /// Create the spool and start its drain task.
    pub fn start(db: Database) -> Self {
        let spool = Self::with_capacity(DEFAULT_CAPACITY);
        let inner = spool.inner.clone();
        tokio::spawn(async move {
            loop {
                inner.notify.notified().await;
                loop {
                    // Scope the lock: db writes run without holding it
                    let job = inner.queue.lock().unwrap().pop_front();
                    match job {
                        Some(job) => run_job(&db, job),
                        None => break,
                    }
                }
            }
        });
        spool
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SpoolInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    pub fn push(&self, job: Job) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                tracing::warn!("Best-effort queue full, dropping oldest job");
            }
            queue.push_back(job);
        }
        self.inner.notify.notify_one();
    }

    #[allow(dead_code)] // Used in tests
    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronously drain everything queued (tests and shutdown).
    pub fn drain_now(&self, db: &Database) {
        loop {
            let job = self.inner.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => run_job(db, job),
                None => break,
            }
        }
    }
}

fn run_job(db: &Database, job: Job) {
    let result = match job {
        Job::Message(msg) => db.append_message(&msg).map(|_| ()),
        Job::Accuracy(record) => db.create_accuracy_record(&record).map(|_| ()),
        Job::Notification(n) => db.create_notification(&n).map(|_| ()),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Best-effort write failed");
    }
}
