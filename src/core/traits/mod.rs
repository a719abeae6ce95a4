pub mod probe;
pub mod runtime;
