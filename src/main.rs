use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use voice_orchestrator::capability::{Attachment, Event};
use voice_orchestrator::{
    BlockingMedium, BlockingPolicy, Capability, CapabilityCore, CapabilityHelper, Client, Config,
    Directive, TokioTimer, Transport,
};

/// Orchestrator - directive sequencing and resource arbitration for voice clients
#[derive(Parser)]
#[command(name = "orchestrator", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration
    Config,
    /// Feed recorded directives through the sequencer and print dispatch order
    Replay {
        /// JSON file: an array of directive envelopes, or
        /// `{"directives": [...], "policies": {...}}`
        file: PathBuf,
        /// How long each directive runs before completing
        #[arg(long, default_value = "100")]
        hold_ms: u64,
        /// Give up waiting for completion after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voice_orchestrator=info",
        1 => "info,voice_orchestrator=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Config => {
            print_config(&config);
            Ok(())
        }
        Command::Replay {
            file,
            hold_ms,
            timeout_secs,
        } => {
            replay(
                config,
                &file,
                Duration::from_millis(hold_ms),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

fn print_config(config: &Config) {
    println!("[focus]");
    println!("reject_policy = {}", config.focus.reject_policy);
    let mut table = config.focus.configurations.clone();
    table.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.focus_type.cmp(&b.focus_type)));
    for entry in &table {
        println!("  {:<10} {}", entry.focus_type, entry.priority);
    }

    let hold = config.play_sync.hold_time;
    println!("\n[play_sync]");
    println!("default_hold = {}s", hold.default.as_secs());
    println!("long_hold = {}s", hold.long.as_secs());
    println!("sync_capabilities = {:?}", config.play_sync.sync_capabilities);

    println!("\n[sequencer]");
    match config.sequencer.directive_timeout {
        Some(timeout) => println!("directive_timeout = {}s", timeout.as_secs()),
        None => println!("directive_timeout = disabled"),
    }

    println!("\n[context]");
    println!("wakeup_word = {}", config.context.wakeup_word);
    println!("os = {}", config.context.os);
}

#[derive(Deserialize)]
struct PolicyEntry {
    medium: String,
    #[serde(default)]
    blocking: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayFile {
    Directives(Vec<Value>),
    Full {
        directives: Vec<Value>,
        #[serde(default)]
        policies: BTreeMap<String, PolicyEntry>,
    },
}

impl ReplayFile {
    fn split(self) -> (Vec<Value>, BTreeMap<String, PolicyEntry>) {
        match self {
            Self::Directives(directives) => (directives, BTreeMap::new()),
            Self::Full {
                directives,
                policies,
            } => (directives, policies),
        }
    }
}

/// Logs outbound events instead of sending them
struct LogTransport;

impl Transport for LogTransport {
    fn send_event(&self, event: &Event) -> voice_orchestrator::Result<()> {
        tracing::info!(event = %serde_json::to_string(event)?, "event");
        Ok(())
    }

    fn send_attachment(&self, attachment: &Attachment) -> voice_orchestrator::Result<()> {
        tracing::info!(
            parent = %attachment.parent_message_id,
            seq = attachment.seq,
            bytes = attachment.data.len(),
            "attachment"
        );
        Ok(())
    }
}

/// Stand-in capability that completes every directive after a fixed hold
struct ReplayCapability {
    core: CapabilityCore,
    policies: Vec<(String, BlockingPolicy)>,
    hold: Duration,
    runtime: Handle,
    order: Arc<Mutex<Vec<String>>>,
}

impl Capability for ReplayCapability {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn version(&self) -> &str {
        self.core.version()
    }

    fn blocking_policies(&self) -> Vec<(String, BlockingPolicy)> {
        self.policies.clone()
    }

    fn initialize(&self, helper: CapabilityHelper) -> voice_orchestrator::Result<()> {
        self.core.attach(helper);
        Ok(())
    }

    fn process_directive(&self, directive: &Arc<Directive>) -> voice_orchestrator::Result<()> {
        self.core.begin_directive(directive);
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{} {}", directive.full_name(), directive.message_id));

        let helper = self
            .core
            .helper()
            .cloned()
            .ok_or_else(|| voice_orchestrator::Error::Capability("not initialized".to_string()))?;
        let message_id = directive.message_id.clone();
        let hold = self.hold;
        self.runtime.spawn(async move {
            tokio::time::sleep(hold).await;
            helper.complete(&message_id);
        });
        Ok(())
    }

    fn cancel_directive(&self, directive: &Arc<Directive>) {
        tracing::info!(directive = %directive.full_name(), message_id = %directive.message_id, "cancelled");
        self.core.drop_directive(directive);
    }

    fn destroy_directive(&self, directive: &Arc<Directive>) {
        self.core.drop_directive(directive);
    }
}

fn parse_policies(
    policies: BTreeMap<String, PolicyEntry>,
) -> anyhow::Result<BTreeMap<String, Vec<(String, BlockingPolicy)>>> {
    let mut by_namespace: BTreeMap<String, Vec<(String, BlockingPolicy)>> = BTreeMap::new();
    for (full_name, entry) in policies {
        let (namespace, name) = full_name
            .split_once('.')
            .with_context(|| format!("policy key must be Namespace.Name: {full_name}"))?;
        let medium = BlockingMedium::from_str(&entry.medium)
            .with_context(|| format!("unknown blocking medium: {}", entry.medium))?;
        by_namespace
            .entry(namespace.to_string())
            .or_default()
            .push((name.to_string(), BlockingPolicy::new(medium, entry.blocking)));
    }
    Ok(by_namespace)
}

async fn replay(config: Config, file: &Path, hold: Duration, timeout: Duration) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let (envelopes, policies) = serde_json::from_str::<ReplayFile>(&raw)?.split();
    let mut policies = parse_policies(policies)?;
    let directives = Directive::parse_response(&json!({ "directives": envelopes }).to_string())?;

    let timer = Arc::new(TokioTimer::from_current()?);
    let client = Client::new(config, Arc::new(LogTransport), timer);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut namespaces: Vec<String> = directives.iter().map(|d| d.namespace.clone()).collect();
    namespaces.sort();
    namespaces.dedup();
    for namespace in namespaces {
        client.add_capability(Arc::new(ReplayCapability {
            policies: policies.remove(&namespace).unwrap_or_default(),
            core: CapabilityCore::new(namespace, "1.0"),
            hold,
            runtime: Handle::current(),
            order: Arc::clone(&order),
        }))?;
    }
    client.initialize()?;

    let total = directives.len();
    tracing::info!(file = %file.display(), directives = total, "replaying");
    for directive in directives {
        let full_name = directive.full_name();
        if let Err(e) = client.handle_directive(directive) {
            tracing::warn!(directive = %full_name, error = %e, "directive rejected");
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let sequencer = client.sequencer();
    while sequencer.active_count() + sequencer.pending_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                active = sequencer.active_count(),
                pending = sequencer.pending_count(),
                "replay timed out"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order = order.lock().unwrap_or_else(PoisonError::into_inner).clone();
    println!("dispatched {} of {total}", order.len());
    for (index, entry) in order.iter().enumerate() {
        println!("{:>3}. {entry}", index + 1);
    }

    client.shutdown();
    Ok(())
}
