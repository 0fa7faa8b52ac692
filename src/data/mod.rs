//! Local persistence for client state.

pub mod kv;
