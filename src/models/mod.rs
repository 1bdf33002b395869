//! Shared data models spanning the engine layers.

pub mod refresh;
pub mod signal;

pub use refresh::{ChangeEvent, ChangeHint, RefreshHint, RefreshReason, RefreshRequest, SourceMarker};
pub use signal::{Cursor, EventKind, Signal, SignalEvent};
