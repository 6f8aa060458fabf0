//! Line-oriented stdin/stdout channel.

use std::io::BufRead;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;

/// Lines typed faster than the agent consumes them are dropped past this.
const CLI_BUFFER: usize = 10;

const CLI_USER: &str = "local";

/// Reads one message per stdin line and prints responses to stdout.
#[derive(Debug, Default)]
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

fn print_response(response: &OutgoingResponse) {
    println!("\n{}\n", response.content.trim_end());
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = mpsc::channel(CLI_BUFFER);

        // Plain thread: a blocked stdin read must not hold up runtime shutdown.
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let msg = IncomingMessage::new("cli", CLI_USER, line);
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("CLI input buffer full, dropping line");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            tracing::debug!("stdin closed");
        });

        tracing::info!("CLI channel ready");
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn respond(
        &self,
        _msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        print_response(&response);
        Ok(())
    }

    async fn broadcast(
        &self,
        _user_id: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        print_response(&response);
        Ok(())
    }
}
