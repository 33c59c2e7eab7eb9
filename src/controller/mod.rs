pub mod account_creation;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod iam;
pub mod opt_in;
pub mod reconciler;
pub mod region_init;
pub mod service_quota;
pub mod state_machine;
pub mod status;

pub use context::{Context, Settings};
pub use error::{AccountCreationError, BackoffConfig, Error, Result, SupportCaseError};
pub use reconciler::{error_policy, reconcile};
pub use state_machine::{AccountEvent, AccountStateMachine, TransitionContext, TransitionResult};
pub use status::{UpdateConditionMode, condition_status, condition_types};
