//! Registry of running jobs
//!
//! At most one job (download or processing) runs per period key inside a
//! process. The registry is a plain value owned by the service and shut down
//! with it; cross-process exclusion comes from the period state guards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::PeriodKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Process,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Download => "download",
            JobKind::Process => "process",
        })
    }
}

/// Snapshot of a registered job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub period_key: PeriodKey,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

struct JobEntry {
    info: JobInfo,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

type Jobs = HashMap<PeriodKey, JobEntry>;

/// Active jobs keyed by period
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<Jobs>>,
}

/// Exclusive claim on a period, released when dropped
pub struct JobTicket {
    registry: JobRegistry,
    info: JobInfo,
    token: CancellationToken,
}

impl JobTicket {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn period_key(&self) -> PeriodKey {
        self.info.period_key
    }

    /// Token the job must poll between units of work
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.registry.release(self.info.period_key, self.info.id);
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        // Entries stay consistent even if a holder panicked
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a period for a new job
    ///
    /// Fails with `StateConflict` while another job holds the period.
    pub fn reserve(&self, key: PeriodKey, kind: JobKind) -> Result<JobTicket> {
        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(&key) {
            return Err(IngestError::state_conflict(
                key,
                format!(
                    "{} job {} is already running (started {})",
                    existing.info.kind, existing.info.id, existing.info.started_at
                ),
            ));
        }

        let info = JobInfo {
            id: Uuid::new_v4(),
            period_key: key,
            kind,
            started_at: Utc::now(),
            cancelled: false,
        };
        let token = CancellationToken::new();
        jobs.insert(
            key,
            JobEntry {
                info: info.clone(),
                token: token.clone(),
                handle: None,
            },
        );
        debug!(period = %key, job_id = %info.id, kind = %kind, "Job reserved");

        Ok(JobTicket {
            registry: self.clone(),
            info,
            token,
        })
    }

    /// Associate the spawned task with its reservation
    ///
    /// If the job already finished the handle is simply dropped.
    pub fn attach(&self, key: PeriodKey, job_id: Uuid, handle: JoinHandle<()>) {
        let mut jobs = self.lock();
        match jobs.get_mut(&key) {
            Some(entry) if entry.info.id == job_id => entry.handle = Some(handle),
            _ => debug!(period = %key, job_id = %job_id, "Job finished before attach"),
        }
    }

    fn release(&self, key: PeriodKey, job_id: Uuid) {
        let mut jobs = self.lock();
        if jobs.get(&key).is_some_and(|e| e.info.id == job_id) {
            jobs.remove(&key);
            debug!(period = %key, job_id = %job_id, "Job released");
        }
    }

    pub fn is_active(&self, key: PeriodKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn get(&self, key: PeriodKey) -> Option<JobInfo> {
        self.lock().get(&key).map(|e| e.info.clone())
    }

    pub fn active(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<_> = self.lock().values().map(|e| e.info.clone()).collect();
        jobs.sort_by_key(|j| j.period_key);
        jobs
    }

    /// Request cancellation of the job holding a period
    ///
    /// The job stops at its next checkpoint. Returns whether a job was found.
    pub fn cancel(&self, key: PeriodKey) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(&key) {
            Some(entry) => {
                entry.token.cancel();
                entry.info.cancelled = true;
                info!(period = %key, job_id = %entry.info.id, "Cancellation requested");
                true
            },
            None => false,
        }
    }

    /// Wait for the spawned task of a period's job, if any
    pub async fn wait(&self, key: PeriodKey) -> Result<()> {
        let handle = self.lock().get_mut(&key).and_then(|e| e.handle.take());
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| IngestError::Cancelled(format!("job task ended abnormally: {}", e))),
            None => Ok(()),
        }
    }

    /// Cancel every job and wait for all of them
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut jobs = self.lock();
            jobs.values_mut()
                .filter_map(|e| {
                    e.token.cancel();
                    e.info.cancelled = true;
                    e.handle.take().map(|h| (e.info.period_key, h))
                })
                .collect()
        };

        if !handles.is_empty() {
            info!(jobs = handles.len(), "Shutting down running jobs");
        }
        for (key, handle) in handles {
            if let Err(e) = handle.await {
                warn!(period = %key, error = %e, "Job task ended abnormally during shutdown");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_second_reservation_conflicts_until_released() {
        let registry = JobRegistry::new();
        let ticket = registry.reserve(key("2024-01"), JobKind::Download).unwrap();

        let err = registry
            .reserve(key("2024-01"), JobKind::Process)
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::StateConflict { .. }));

        // Other periods are independent
        let other = registry.reserve(key("2024-02"), JobKind::Process).unwrap();
        assert_eq!(registry.active().len(), 2);

        drop(ticket);
        assert!(!registry.is_active(key("2024-01")));
        assert!(registry.reserve(key("2024-01"), JobKind::Process).is_ok());
        drop(other);
    }

    #[test]
    fn test_cancel_flips_token() {
        let registry = JobRegistry::new();
        let ticket = registry.reserve(key("2024-03"), JobKind::Process).unwrap();
        let token = ticket.token();
        assert!(!token.is_cancelled());

        assert!(registry.cancel(key("2024-03")));
        assert!(token.is_cancelled());
        assert!(registry.get(key("2024-03")).unwrap().cancelled);
        assert!(!registry.cancel(key("2024-04")));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_waits() {
        let registry = JobRegistry::new();
        let ticket = registry.reserve(key("2024-05"), JobKind::Process).unwrap();
        let (key, id, token) = (ticket.period_key(), ticket.id(), ticket.token());

        let handle = tokio::spawn(async move {
            let _ticket = ticket;
            token.cancelled().await;
        });
        registry.attach(key, id, handle);

        registry.shutdown().await;
        assert!(!registry.is_active(key));
    }
}
