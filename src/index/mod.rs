//! Indexes over store bookkeeping

pub mod expiry;

pub use expiry::{Expiring, ExpiryHandle, ExpiryHeap, Position};
