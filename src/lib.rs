//! Multi-party ledger of energy supply accounts.
//!
//! Each party (suppliers and the regulator) runs an [`service::AccountService`]
//! with its own record store. Every change to an account is a transition that
//! all required parties validate and sign before any of them records it.

pub mod account;
pub mod billing;
pub mod config;
pub mod contract;
pub mod error;
pub mod network;
pub mod party;
pub mod protocol;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transaction;
pub mod utils;
