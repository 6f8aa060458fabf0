use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ironwake::agent::{PersonaRegistry, SkillRegistry};
use ironwake::channels::{ChannelManager, CliChannel, Dispatcher, default_sink_resolver};
use ironwake::cli::{Cli, Command, run_cron_command};
use ironwake::config::Config;
use ironwake::cron::CronScheduler;
use ironwake::llm::create_llm_provider;
use ironwake::error::ChannelError;
use ironwake::session::FileSessionStore;
use ironwake::thread::{Deliver, Manager, Sink, ThreadDeps, WakeMessage, WakeSource};
use ironwake::tools::ToolRegistry;
use ironwake::tools::builtin::{EchoTool, SendMessageTool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_agent(config).await,
        Command::Cron(cmd) => run_cron_command(cmd, &config.cron.store_path),
        Command::Send {
            session,
            message,
            agent,
            timeout,
        } => send_once(config, &session, &message, agent, Duration::from_secs(timeout)).await,
    }
}

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `ironwake=info`.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(format!("ironwake={}", level))
            .unwrap_or_else(|_| EnvFilter::new("ironwake=info"))
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `channels` is absent for one-shot commands, which have no outbound
/// channels to offer `send_message`.
fn build_deps(
    config: &Config,
    channels: Option<&Arc<ChannelManager>>,
) -> anyhow::Result<ThreadDeps> {
    let llm = create_llm_provider(&config.llm)?;
    let mut tools = ToolRegistry::new().with(Arc::new(EchoTool));
    if let Some(channels) = channels {
        tools = tools.with(Arc::new(SendMessageTool::new(Arc::clone(channels))));
    }

    Ok(ThreadDeps::new(llm)
        .with_tools(tools)
        .with_personas(PersonaRegistry::new(config.workspace.agents_dir()))
        .with_skills(SkillRegistry::new(config.workspace.skills_dir()))
        .with_sessions(Arc::new(FileSessionStore::new(
            config.workspace.sessions_dir(),
        )))
        .with_settings(config.thread.clone()))
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    let mut channels = ChannelManager::new();
    if config.channels.cli_enabled {
        channels.add(Arc::new(CliChannel::new()));
    }
    let channels = Arc::new(channels);

    let deps = build_deps(&config, Some(&channels))?
        .with_default_sink_for(default_sink_resolver(Arc::clone(&channels)));
    let manager = Manager::new(deps);

    let cron = CronScheduler::new(&config.cron, manager.waker());
    manager.set_job_scheduler(cron.clone());
    cron.load().await?;

    let cancel = CancellationToken::new();
    let reload = cron.spawn_reload_loop(config.cron.reload_interval, cancel.clone());

    let stream = channels.start_all().await?;
    let dispatcher = Dispatcher::new(Arc::clone(&channels), manager.clone(), &config.channels);

    let threads = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };
    let inbound = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(stream, cancel).await })
    };

    tracing::info!(
        channels = ?channels.channel_names(),
        workspace = %config.workspace.dir.display(),
        "Agent running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();
    cron.stop();

    let _ = tokio::join!(threads, inbound, reload);
    channels.shutdown_all().await;
    Ok(())
}

/// Hands the first response of a `send` turn back to the caller.
struct FirstReply(Mutex<Option<oneshot::Sender<String>>>);

#[async_trait]
impl Deliver for FirstReply {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if let Some(tx) = self.0.lock().await.take() {
            let _ = tx.send(text.to_string());
        }
        Ok(())
    }

    fn accepts_empty(&self) -> bool {
        true
    }
}

async fn send_once(
    config: Config,
    session: &str,
    message: &str,
    agent: Option<String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let manager = Manager::new(build_deps(&config, None)?);
    let (tx, rx) = oneshot::channel();
    let sink = Sink::new(
        "your response will be printed to the terminal",
        Arc::new(FirstReply(Mutex::new(Some(tx)))),
    );

    let mut wake = WakeMessage::new(WakeSource::Cli, message).with_sink(sink);
    if let Some(agent) = agent {
        wake = wake.with_agent(agent);
    }
    manager.wake(session, wake).await;

    let cancel = CancellationToken::new();
    let runner = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    let reply = tokio::time::timeout(timeout, rx).await;
    cancel.cancel();
    let _ = runner.await;

    match reply {
        Ok(Ok(reply)) => {
            println!("{}", reply);
            Ok(())
        }
        _ => anyhow::bail!("no reply from session {} within {:?}", session, timeout),
    }
}
