//! Core data types: stream events and the request contract

pub mod event;
pub mod request;

pub use event::*;
pub use request::*;
