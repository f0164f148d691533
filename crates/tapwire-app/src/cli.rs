//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tapwire_bridge::{BridgeConfig, TargetSelector};
use tapwire_proxy::{
    CaManager, ProxyConfig, TargetDomains, DEFAULT_MAX_BODY_CAPTURE, DEFAULT_TARGET_DOMAINS,
};

/// Tapwire - capture traffic to selected sites and extract articles
#[derive(Parser, Debug)]
#[command(name = "tapwire", version, about, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the default `run` command
    #[command(flatten)]
    pub run: RunArgs,
}

impl Cli {
    /// The requested command; `run` when none is given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Run(self.run))
    }
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Database file (default: platform data directory)
    #[arg(long, global = true, env = "TAPWIRE_DB")]
    pub db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy (default)
    Run(RunArgs),

    /// Print the summary of an existing database
    Stats {
        /// Number of recent articles to show
        #[arg(long, default_value_t = 5)]
        recent: i64,
    },

    /// Create the root CA if needed and print its certificate path
    Ca {
        /// CA directory (default: platform data directory)
        #[arg(long, env = "TAPWIRE_CA_DIR")]
        ca_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Proxy listen address
    #[arg(long, default_value = "127.0.0.1:8080", env = "TAPWIRE_LISTEN")]
    pub listen: SocketAddr,

    /// Domain to capture; repeat or separate with commas
    #[arg(
        long = "target",
        value_delimiter = ',',
        default_values_t = DEFAULT_TARGET_DOMAINS.iter().map(|d| d.to_string())
    )]
    pub targets: Vec<String>,

    /// CA directory (default: platform data directory)
    #[arg(long, env = "TAPWIRE_CA_DIR")]
    pub ca_dir: Option<PathBuf>,

    /// Relay HTTPS to target domains instead of intercepting it
    #[arg(long)]
    pub no_tls_intercept: bool,

    /// Instrumentation agent, as [tcp://]host:port[/process]
    #[arg(long, env = "TAPWIRE_AGENT")]
    pub agent: Option<TargetSelector>,

    /// Never ask the agent to launch a browser when none is running
    #[arg(long)]
    pub no_spawn: bool,

    /// Serve the query API on this port
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Bytes of each body kept in the store
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_CAPTURE)]
    pub max_body: usize,

    /// Seconds without progress before a connection is closed
    #[arg(long, default_value_t = 30)]
    pub idle_timeout: u64,

    /// Seconds between logged summaries (0 disables)
    #[arg(long, default_value_t = 10)]
    pub stats_interval: u64,
}

impl RunArgs {
    /// Proxy configuration for these arguments.
    pub fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new()
            .with_addr(self.listen)
            .with_target_domains(TargetDomains::new(&self.targets))
            .with_max_body_capture(self.max_body)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout));

        if self.no_tls_intercept {
            config = config.without_ca();
        } else if let Some(dir) = &self.ca_dir {
            config = config.with_ca_manager(CaManager::new(dir));
        }

        config
    }

    /// Bridge configuration, when an agent was given.
    pub fn bridge_config(&self) -> Option<BridgeConfig> {
        self.agent.clone().map(|selector| {
            let selector = if self.no_spawn {
                selector.without_spawn()
            } else {
                selector
            };
            BridgeConfig::new(selector)
        })
    }

    /// Interval between logged summaries.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}
