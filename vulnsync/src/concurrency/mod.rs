//! Concurrency primitives for coordinating pipeline workers.

pub mod shutdown;
