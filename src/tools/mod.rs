//! Tool system.
//!
//! Tools are the model's interface to the outside world. The shared
//! [`ToolRegistry`] is cloned into every thread, which then adds the tools
//! bound to it (delegation, sleep, cron management).

pub mod builtin;

mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolContext, ToolError, ToolOutput, ToolSchema};
