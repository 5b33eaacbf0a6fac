//! procedure-core
//!
//! Core building blocks for running units of asynchronous work
//! ("procedures") on queues.
//!
//! # Modules
//! - **domain**: identifiers, lifecycle states, outcomes
//! - **procedure**: the `Procedure` handle, the `Work` trait, observers, built-in work
//! - **condition**: preconditions and their evaluation
//! - **queue**: `ProcedureQueue`, dependency graph, per-procedure driver
//! - **exclusivity**: mutual exclusion across queues by category
//! - **group**: procedures made of child procedures
//! - **repeat**: repeat and retry procedures, wait strategies
//! - **observability**: queue snapshots
//! - **error**: `ProcedureError`
//!
//! # Example
//! ```ignore
//! let queue = ProcedureQueue::new();
//! let fetch = Procedure::block("fetch", |_ctx| async { Ok(()) });
//! let store = Procedure::block("store", |_ctx| async { Ok(()) });
//! store.add_dependency(&fetch)?;
//! queue.add_all([fetch, store.clone()])?;
//! assert!(store.wait().await.is_success());
//! ```

pub mod condition;
pub mod domain;
pub mod error;
pub mod exclusivity;
pub mod group;
pub mod observability;
pub mod procedure;
pub mod queue;
pub mod repeat;

pub use condition::{Condition, ConditionResult, Evaluate};
pub use domain::{Outcome, ProcedureId, ProcedureState, ProcedureStatus, QueueId};
pub use error::ProcedureError;
pub use exclusivity::ExclusivityManager;
pub use group::GroupProcedure;
pub use observability::QueueCounts;
pub use procedure::{Procedure, ProcedureContext, ProcedureObserver, Work};
pub use queue::{ProcedureFuture, ProcedureQueue, QueueConfig, QueueDelegate};
pub use repeat::{RepeatPayload, RepeatProcedure, RetryProcedure, WaitStrategy};
