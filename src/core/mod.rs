pub mod cancel;
pub mod console;
pub mod domain;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod sandbox;
pub mod traits;
