//! fleet-agent library surface: the modules `main.rs` wires together at
//! startup. Split out of `main.rs` the way `clawnode` keeps its
//! `config`/`agent`/`commands` modules importable from the lib target
//! for integration tests, rather than burying them in the binary.

pub mod dispatcher;
pub mod paths;
pub mod triggers;
