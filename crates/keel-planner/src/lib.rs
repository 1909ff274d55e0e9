//! Keel planning.
//!
//! Planning is synchronous and free of I/O:
//!
//! 1. [`PolicyResolver`] turns every active claim of a policy into component instances, producing
//!    the desired [`ResolutionState`].
//! 2. [`PolicyResolutionDiff`] compares desired against actual state and yields a [`Plan`]: typed
//!    [`Action`]s plus the ordering edges between them.
//!
//! Applying a plan is the job of `keel-runtime`.

pub mod action;
pub mod diff;
pub mod error;
pub mod plan;
pub mod resolve;
pub mod state;

pub use action::{Action, ActionKind};
pub use diff::PolicyResolutionDiff;
pub use error::{PlanError, ResolveError};
pub use plan::{Plan, PlanSummary};
pub use resolve::PolicyResolver;
pub use state::{ComponentInstance, ComponentInstanceKey, Detached, ResolutionState};
