//! Testing utilities for synchronizer tests.
//!
//! Record and environment builders shared by the unit and integration tests.
//! Everything here targets the in-memory store; tests never reach a real
//! key-value or blob service.

pub mod records;
