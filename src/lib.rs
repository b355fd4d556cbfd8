//! Library surface for `nobodd`'s binary and its integration tests. Not
//! intended for use as a general-purpose dependency -- the public surface
//! is exactly what `main.rs` and `tests/integration.rs` need.

pub mod bootserver;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod image;
pub mod listen;
pub mod partition;
