//! Keel access control.
//!
//! Every policy mutation goes through a [`PolicyView`]: a per-user façade that asks the
//! [`AclResolver`] for the user's [`Privilege`] over each object before touching the policy.
//! Privileges come from namespace-scoped role grants (static grants from the user directory plus
//! grants from ACL rules matching the user's labels); nothing is allowed by default.
//!
//! The crate also evaluates global rules ([`RuleEvaluator`]) which the resolver applies to claims.

pub mod acl;
pub mod error;
pub mod role;
pub mod rules;
pub mod view;

pub use acl::AclResolver;
pub use error::{AclError, AclErrorKind, ViewError};
pub use role::{Privilege, Role};
pub use rules::{criteria_matches, RuleEvaluator, RuleOutcome};
pub use view::PolicyView;
