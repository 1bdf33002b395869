//! Core application primitives (scheduler, runtime, HTTP surface)

pub mod http;
pub mod runtime;
pub mod scheduler;

pub use http::*;
pub use runtime::*;
pub use scheduler::*;
