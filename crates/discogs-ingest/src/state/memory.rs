//! In-memory period repository

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{PeriodRepository, Transition};
use crate::error::{IngestError, Result};
use crate::models::{PeriodKey, ProcessingPeriod};

/// Period repository backed by process memory
#[derive(Debug, Default)]
pub struct MemoryPeriodRepository {
    periods: Mutex<HashMap<PeriodKey, ProcessingPeriod>>,
}

impl MemoryPeriodRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PeriodKey, ProcessingPeriod>>> {
        self.periods
            .lock()
            .map_err(|_| IngestError::StoreUnavailable("period repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl PeriodRepository for MemoryPeriodRepository {
    async fn get(&self, key: PeriodKey) -> Result<Option<ProcessingPeriod>> {
        Ok(self.lock()?.get(&key).cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessingPeriod>> {
        let mut periods: Vec<_> = self.lock()?.values().cloned().collect();
        periods.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(periods)
    }

    async fn transition(
        &self,
        key: PeriodKey,
        create: bool,
        apply: Transition,
    ) -> Result<ProcessingPeriod> {
        let mut periods = self.lock()?;
        let mut period = match periods.get(&key) {
            Some(existing) => existing.clone(),
            None if create => ProcessingPeriod::new(key),
            None => return Err(IngestError::NotFound(format!("period {}", key))),
        };
        apply(&mut period)?;
        periods.insert(key, period.clone());
        Ok(period)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::PeriodStatus;

    #[tokio::test]
    async fn test_failed_transition_writes_nothing() {
        let repo = MemoryPeriodRepository::new();
        let key: PeriodKey = "2024-02".parse().unwrap();

        let err = repo
            .transition(key, true, Box::new(|p| p.reset_stuck()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::StateConflict { .. }));
        assert!(repo.get(key).await.unwrap().is_none());

        let err = repo
            .transition(key, false, Box::new(|p| p.start_download()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));

        let period = repo
            .transition(key, true, Box::new(|p| p.start_download()))
            .await
            .unwrap();
        assert_eq!(period.status, PeriodStatus::Downloading);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
