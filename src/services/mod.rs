//! External collaborators: the signal source contract and the client transport.

pub mod memory_source;
pub mod signal_source;
pub mod websocket;

pub use memory_source::MemorySignalSource;
pub use signal_source::{ChangeStream, SignalSource};
