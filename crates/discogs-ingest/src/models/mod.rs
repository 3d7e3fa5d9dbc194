//! Domain models shared across the pipeline

pub mod period;
pub mod records;

pub use period::{
    Counters, PeriodKey, PeriodStatus, ProcessingPeriod, ProcessingStats, StepState, StepStatus,
};
pub use records::{
    Artist, ArtistCredit, ArtistRef, CatalogRecord, FileType, Format, Image, Label, LabelRef,
    Master, NaturalKey, Release, ReleaseLabel, Track, Video,
};
