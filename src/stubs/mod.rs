//! Deterministic runtimes for tests and local runs without toolchains.
pub mod script;
