//! Entity model: statuses, records, and push transitions.

pub mod record;
pub mod status;
pub mod transition;

pub use record::{
    EntityId, EntityPayload, EntityRecord, JobProgress, ProcessingJobStatus, SourceKind,
    UpdateEvent, UserId,
};
pub use status::{EntityStatus, UnknownStatus};
pub use transition::Transition;
