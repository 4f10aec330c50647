pub mod common;
pub mod context;
pub mod error;
pub mod output_secrets;
pub mod privileges;
pub mod reaper;
pub mod reconciler;
pub mod resolver;
pub mod role_engine;
pub mod status;
pub mod validation;
pub mod work_secret;

pub use context::Context;
pub use error::{BackoffSchedule, Error, FailureTracker, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
