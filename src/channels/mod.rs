//! Input channels and routing into session threads.

mod channel;
mod cli;
mod dispatcher;
mod manager;

pub use channel::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
pub use cli::CliChannel;
pub use dispatcher::{Dispatcher, default_sink_resolver, preprocess, session_key_for};
pub use manager::ChannelManager;
