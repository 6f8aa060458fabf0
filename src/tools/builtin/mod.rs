//! Built-in tools that come with the agent.

mod cron;
mod echo;
mod send;
mod thread;

pub use cron::ManageCronTool;
pub(crate) use cron::format_list;
pub use echo::EchoTool;
pub use send::SendMessageTool;
pub use thread::{
    ListThreadsTool, SleepThreadTool, SpawnThreadTool, WakeThreadTool, parse_duration,
};

use std::sync::{Arc, Weak};

use crate::thread::Thread;
use crate::tools::Tool;

/// Tools bound to a single thread, added on top of the shared registry.
pub fn thread_tools(thread: Weak<Thread>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SpawnThreadTool::new(thread.clone())),
        Arc::new(SleepThreadTool::new(thread.clone())),
        Arc::new(WakeThreadTool::new(thread.clone())),
        Arc::new(ListThreadsTool::new(thread.clone())),
        Arc::new(ManageCronTool::new(thread)),
    ]
}
