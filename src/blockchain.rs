// Thin re-export module: implementation lives under `blockchain/core/`
// (chain management, account state, block verification).

pub mod core;
pub use core::*;
