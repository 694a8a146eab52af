//! Property-based tests for key hashing, matching and backoff

mod key_properties;
mod retry_properties;
