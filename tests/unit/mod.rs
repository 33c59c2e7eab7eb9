// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the Account Operator
//!
//! These drive the controller against in-memory fakes of the store and the
//! cloud provider:
//! - Account creation and the pooled/BYOC lifecycles
//! - Region initialization, recovery and timeouts
//! - Support case and quota verification
//! - Opt-in region enablement
//! - Finalizers and deletion cleanup
//! - State machine and status helpers

#[path = "../common/mod.rs"]
mod common;

mod lifecycle;
mod opt_in;
mod state_machine;
