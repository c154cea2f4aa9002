//! callsession - Peer call-session orchestration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use callsession::config::{get_config_path, CallConfig};
use callsession::session::{
    parse_conference_link, Collaborators, SessionEvent, SessionOrchestrator, SessionState,
};
use callsession::signaling::{
    ConversationId, MemorySignaling, SessionDirectory, SignalingChannel, SignalingClient,
    WsSignalingChannel,
};
use callsession::transport::{LoopbackFactory, StaticMediaSource, DEFAULT_LOOPBACK_CANDIDATES};

/// How long the demo waits for both parties to connect
const DEMO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "callsession")]
#[command(about = "Peer call-session orchestration over a signaling channel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an initiator and a responder in-process and connect them
    Demo {
        /// Candidates gathered by each loopback transport
        #[arg(long, default_value_t = DEFAULT_LOOPBACK_CANDIDATES)]
        candidates: usize,
    },

    /// Start a call in a conversation (loopback media)
    Call {
        /// Conversation to call into
        #[arg(long)]
        conversation: String,

        /// Signaling server URL (e.g., wss://example.com/signaling)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Wait for an offer in a conversation and answer it (loopback media)
    Answer {
        /// Conversation to listen on
        #[arg(long)]
        conversation: String,

        /// Signaling server URL (e.g., wss://example.com/signaling)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Join a call through its conference link (loopback media)
    Join {
        /// Conference link shared by the caller
        #[arg(long)]
        link: String,

        /// Conversation to use while in the call
        #[arg(long, default_value = "guest")]
        conversation: String,

        /// Signaling server URL (e.g., wss://example.com/signaling)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>, server: Option<String>) -> Result<CallConfig> {
    let mut config = match path {
        Some(path) => CallConfig::load(path),
        None => CallConfig::load_or_default(),
    }
    .map_err(anyhow::Error::msg)?;

    if let Some(server) = server {
        config.signaling_url = server;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

/// Print lifecycle events of one party until the channel closes
fn print_events(
    label: &'static str,
    mut rx: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(label, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[{}] missed {} events", label, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(label: &str, event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { state, role } => {
            println!("[{}] {} is now {}", label, role, state)
        }
        SessionEvent::SessionIdAssigned { session_id } => {
            println!("[{}] session id: {}", label, session_id)
        }
        SessionEvent::ConferenceLink { link } => println!("[{}] conference link: {}", label, link),
        SessionEvent::RemoteTrack(track) => {
            println!("[{}] remote {} track {}", label, track.kind, track.track_id)
        }
        SessionEvent::ConnectionState(state) => println!("[{}] transport {}", label, state),
        SessionEvent::RemotePresence {
            waiting,
            participants,
        } => {
            let count = participants.map_or("?".to_string(), |n| n.to_string());
            if *waiting {
                println!("[{}] waiting for the other party ({} present)", label, count);
            } else {
                println!("[{}] other party present ({} present)", label, count);
            }
        }
        SessionEvent::RemoteError { message } => println!("[{}] server error: {}", label, message),
        SessionEvent::DeliveryFailed { signal, error } => {
            println!("[{}] could not deliver {}: {}", label, signal, error)
        }
        SessionEvent::Failed { reason } => println!("[{}] call failed: {}", label, reason),
    }
}

fn loopback_orchestrator<C>(
    conversation: ConversationId,
    config: CallConfig,
    channel: Arc<C>,
    candidates: usize,
) -> SessionOrchestrator
where
    C: SignalingChannel + SessionDirectory + 'static,
{
    SessionOrchestrator::new(
        conversation,
        config,
        Collaborators {
            signaling: channel.clone(),
            directory: Some(channel as Arc<dyn SessionDirectory>),
            transports: Arc::new(LoopbackFactory::new(candidates)),
            media: Arc::new(StaticMediaSource::new()),
        },
    )
}

async fn wait_for_state(orchestrator: &SessionOrchestrator, wanted: SessionState) -> Result<()> {
    let mut rx = orchestrator.watch_state();
    let reached = tokio::time::timeout(
        DEMO_TIMEOUT,
        rx.wait_for(|state| *state == wanted || state.is_terminal()),
    )
    .await
    .context("Timed out waiting for the call")?
    .map(|state| *state)?;

    if reached != wanted {
        bail!("Call ended in state {} before reaching {}", reached, wanted);
    }
    Ok(())
}

async fn run_demo(config: CallConfig, candidates: usize) -> Result<()> {
    let (caller_link, callee_link) = MemorySignaling::pair();
    let conversation = ConversationId::new("demo");

    let caller = loopback_orchestrator(
        conversation.clone(),
        config.clone(),
        Arc::new(caller_link),
        candidates,
    );
    let callee = loopback_orchestrator(conversation, config, Arc::new(callee_link), candidates);

    let printers = [
        print_events("caller", caller.subscribe()),
        print_events("callee", callee.subscribe()),
    ];

    callee.listen();
    caller.start().await?;

    wait_for_state(&caller, SessionState::Connected).await?;
    wait_for_state(&callee, SessionState::Connected).await?;
    info!("Both parties connected");

    caller.end_session().await?;
    let mut callee_state = callee.watch_state();
    tokio::time::timeout(DEMO_TIMEOUT, callee_state.wait_for(|s| s.is_terminal()))
        .await
        .context("Callee did not observe the end of the call")??;

    callee.stop_listening();
    // Let the printers drain before exiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    for printer in printers {
        printer.abort();
    }

    println!("\nDemo finished: caller {}, callee {}", caller.state(), callee.state());
    Ok(())
}

async fn connect(config: &CallConfig) -> Result<Arc<WsSignalingChannel>> {
    let channel = SignalingClient::new(&config.signaling_url)
        .with_request_timeout(config.signaling_timeout())
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.signaling_url))?;
    info!("Connected to signaling server {}", config.signaling_url);
    Ok(Arc::new(channel))
}

async fn run_call(config: CallConfig, conversation: String) -> Result<()> {
    let channel = connect(&config).await?;
    let orchestrator = loopback_orchestrator(
        ConversationId::new(conversation),
        config,
        channel.clone(),
        DEFAULT_LOOPBACK_CANDIDATES,
    );
    let printer = print_events("call", orchestrator.subscribe());

    orchestrator.start().await?;
    println!("\nCalling. Press Ctrl+C to hang up.\n");

    let mut state = orchestrator.watch_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Hanging up...");
            orchestrator.end_session().await?;
        }
        _ = state.wait_for(|s| s.is_terminal()) => {
            info!("Call is over");
        }
    }

    channel.close();
    printer.abort();
    Ok(())
}

async fn run_answer(config: CallConfig, conversation: String) -> Result<()> {
    let channel = connect(&config).await?;
    let orchestrator = loopback_orchestrator(
        ConversationId::new(conversation.clone()),
        config,
        channel.clone(),
        DEFAULT_LOOPBACK_CANDIDATES,
    );
    let printer = print_events("answer", orchestrator.subscribe());

    orchestrator.listen();
    println!(
        "\nWaiting for calls in conversation {}. Press Ctrl+C to stop.\n",
        conversation
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    orchestrator.stop_listening();
    orchestrator.end_session().await?;

    channel.close();
    printer.abort();
    Ok(())
}

async fn run_join(config: CallConfig, link: String, conversation: String) -> Result<()> {
    let Some((session_id, code)) = parse_conference_link(&link) else {
        bail!("Not a conference link: {}", link);
    };

    let channel = connect(&config).await?;
    let orchestrator = loopback_orchestrator(
        ConversationId::new(conversation),
        config,
        channel.clone(),
        DEFAULT_LOOPBACK_CANDIDATES,
    );
    let printer = print_events("join", orchestrator.subscribe());

    orchestrator.join_by_link(session_id, code).await?;
    println!("\nJoining. Press Ctrl+C to hang up.\n");

    let mut state = orchestrator.watch_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Hanging up...");
            orchestrator.end_session().await?;
        }
        _ = state.wait_for(|s| s.is_terminal()) => {
            info!("Call is over");
        }
    }

    channel.close();
    printer.abort();
    Ok(())
}

fn print_config(config: &CallConfig) -> Result<()> {
    match get_config_path() {
        Some(path) => println!("# {}", path.display()),
        None => println!("# no platform config directory"),
    }
    print!("{}", config.to_toml().map_err(anyhow::Error::msg)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Demo { candidates } => {
            let config = load_config(cli.config.as_ref(), None)?;
            run_demo(config, candidates).await?;
        }
        Commands::Call {
            conversation,
            server,
        } => {
            let config = load_config(cli.config.as_ref(), server)?;
            run_call(config, conversation).await?;
        }
        Commands::Answer {
            conversation,
            server,
        } => {
            let config = load_config(cli.config.as_ref(), server)?;
            run_answer(config, conversation).await?;
        }
        Commands::Join {
            link,
            conversation,
            server,
        } => {
            let config = load_config(cli.config.as_ref(), server)?;
            run_join(config, link, conversation).await?;
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref(), None)?;
            print_config(&config)?;
        }
    }

    Ok(())
}
