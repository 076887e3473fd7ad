// Helper bridge: runs out-of-process analysis helpers and classifies their output.
// Every helper call in the service goes through `ProcessBridge::execute`.

pub mod extract;
pub mod handlers;
pub mod invocation;
pub mod process;

pub use invocation::Invocation;
pub use process::{BridgeConfig, ProcessBridge};
