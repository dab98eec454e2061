//! Command implementations for the levelkv binary

pub mod admin;
pub mod kv;
