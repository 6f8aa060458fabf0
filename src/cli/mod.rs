//! Command-line interface.

mod cron;

pub use cron::{CronCommand, run_cron_command};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ironwake", version, about = "Session-affine LLM agent runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start channels, the thread manager, and the timer runtime (default)
    Run,

    /// Manage timer jobs in the store file
    #[command(subcommand)]
    Cron(CronCommand),

    /// Wake one session with a message and print its reply
    Send {
        /// Session key (e.g. "main", "telegram:42")
        session: String,

        /// Message text
        message: String,

        /// Persona to run the turn as
        #[arg(short, long)]
        agent: Option<String>,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let cli = Cli::parse_from(["ironwake", "send", "main", "hello", "--agent", "coder"]);
        match cli.command {
            Some(Command::Send {
                session,
                message,
                agent,
                timeout,
            }) => {
                assert_eq!(session, "main");
                assert_eq!(message, "hello");
                assert_eq!(agent.as_deref(), Some("coder"));
                assert_eq!(timeout, 300);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::parse_from(["ironwake"]);
        assert!(cli.command.is_none());
    }
}
