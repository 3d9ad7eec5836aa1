//! Caller-facing request types

pub mod health;

pub use health::*;
