mod account;
mod account_claim;

pub use account::*;
pub use account_claim::*;
