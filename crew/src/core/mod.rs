//! Deterministic, pure logic shared by the crew core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod events;
pub mod limits;
pub mod mask;
pub mod naming;
pub mod spec;
pub mod translate;
pub mod ttl;
