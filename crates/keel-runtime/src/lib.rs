//! Keel runtime.
//!
//! The [`Engine`] ties the crates together: policy mutations go through a user's policy view,
//! are validated and committed as a new generation, and are answered with a preview plan.
//! The [`Enforcer`] applies plans in the background through the [`PlanExecutor`], which calls
//! the [`PluginRegistry`] and records what got deployed in the [`ActualStateStore`].

pub mod action;
pub mod actual;
pub mod apply;
pub mod engine;
pub mod enforcer;
pub mod error;
pub mod event;
pub mod plugin;

pub use action::{ActionContext, Applied, ApplyAction};
pub use actual::ActualStateStore;
pub use apply::{ActionResult, ActionStatus, ApplyReport, PlanExecutor};
pub use engine::{Engine, PolicyUpdateResult};
pub use enforcer::Enforcer;
pub use error::{ApplyError, EngineError, PluginError};
pub use event::{Event, EventLevel, EventLog, EventSink, TracingSink};
pub use plugin::{
    ClusterDriver, ClusterPlugin, CodePlugin, DriverRegistry, DryRunDriver, PluginRegistry,
};
