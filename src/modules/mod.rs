//! Feature modules reporting through the diagnostics contract

pub mod circuits;
pub mod ops;
pub mod poller;

pub use circuits::CircuitsModule;
pub use ops::OpsModule;
pub use poller::{content_hash, EndpointPoller, PollOutcome};
