//! Processing state tracking
//!
//! A [`PeriodRepository`] persists [`ProcessingPeriod`] rows and applies
//! transitions atomically: the current row is locked, the transition closure
//! runs its guard, and the row is written back only if the guard passed.
//! [`StateTracker`] exposes the named lifecycle operations on top of it.

mod memory;
mod postgres;
mod tracker;

pub use memory::MemoryPeriodRepository;
pub use postgres::PgPeriodRepository;
pub use tracker::StateTracker;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{PeriodKey, ProcessingPeriod};

/// Mutation applied to a locked period row
pub type Transition = Box<dyn FnOnce(&mut ProcessingPeriod) -> Result<()> + Send>;

/// Storage of period lifecycle records
#[async_trait]
pub trait PeriodRepository: Send + Sync {
    async fn get(&self, key: PeriodKey) -> Result<Option<ProcessingPeriod>>;

    /// All known periods, newest first
    async fn list(&self) -> Result<Vec<ProcessingPeriod>>;

    /// Apply `apply` to the period under an exclusive lock
    ///
    /// With `create` set a missing period is created as `NotStarted` first;
    /// otherwise a missing period is `NotFound`. When `apply` fails nothing
    /// is written and its error is returned.
    async fn transition(
        &self,
        key: PeriodKey,
        create: bool,
        apply: Transition,
    ) -> Result<ProcessingPeriod>;
}
