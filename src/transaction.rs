//! Transaction types and their validation

pub mod types;
pub mod validation;

pub use types::*;
