//! Scheduled work
//!
//! Every suspension point in the engine is an explicit [`Task`] record:
//! challenge validation, provider status polls and renewals. Polls carry
//! their attempt counter and due time so resumption state is visible.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use certmill_common::{CertificateId, ChallengeId, RenewalId};

use crate::clock::Clock;
use crate::ports::TaskQueue;

/// Next status check for one certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTask {
    pub certificate_id: CertificateId,
    /// 1-based
    pub attempt: u32,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    ValidateChallenge { challenge_id: ChallengeId, attempt: u32 },
    PollCertificate(PollTask),
    Renew { renewal_id: RenewalId },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ValidateChallenge { .. } => "validate_challenge",
            Task::PollCertificate(_) => "poll_certificate",
            Task::Renew { .. } => "renew",
        }
    }
}

#[derive(Debug)]
struct Entry {
    due_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

/// In-process queue releasing tasks against the engine clock
#[derive(Debug)]
pub struct MemoryTaskQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<(u64, Vec<Entry>)>,
}

impl MemoryTaskQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new((0, Vec::new())),
        }
    }

    /// Queued tasks with their due times, earliest first
    pub fn snapshot(&self) -> Vec<(DateTime<Utc>, Task)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner.1.iter().map(|e| (e.due_at, e.seq, e.task.clone())).collect();
        entries.sort_by_key(|(due, seq, _)| (*due, *seq));
        entries.into_iter().map(|(due, _, task)| (due, task)).collect()
    }

    /// Earliest due time
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().1.iter().map(|e| e.due_at).min()
    }
}

impl TaskQueue for MemoryTaskQueue {
    fn schedule(&self, task: Task, delay: Duration) {
        let due_at = self.clock.now() + delay.max(Duration::zero());
        let mut inner = self.inner.lock();
        inner.0 += 1;
        let seq = inner.0;
        trace!(task = task.name(), due_at = %due_at, "Task scheduled");
        inner.1.push(Entry { due_at, seq, task });
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut inner = self.inner.lock();
        let (mut due, pending): (Vec<Entry>, Vec<Entry>) =
            std::mem::take(&mut inner.1).into_iter().partition(|e| e.due_at <= now);
        inner.1 = pending;
        due.sort_by_key(|e| (e.due_at, e.seq));
        due.into_iter().map(|e| e.task).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().1.len()
    }
}
