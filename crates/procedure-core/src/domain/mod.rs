//! Domain model (IDs, lifecycle states, outcomes).

pub mod ids;
pub mod outcome;
pub mod state;

pub use ids::{ConditionId, Id, IdMarker, ProcedureId, QueueId};
pub use outcome::Outcome;
pub use state::{ProcedureState, ProcedureStatus};
