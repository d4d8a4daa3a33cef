//! dvs-agent entry point.
//!
//! Loads the configuration, connects one switch per mapped physical network
//! and runs the reconciliation loop until SIGTERM or Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dvs_agent::{
    AgentConfig, AgentDaemon, DvsAgent, DvsSecurityGroupRpc, LoopbackPluginRpc,
    LoopbackSecurityGroupServer, LoopbackStateRpc, NotificationPump, StateReporter,
    VCenterFirewallDriver, DEFAULT_CONFIG_PATH,
};
use dvs_agent_common::{DvsBackend, MemoryDvs, NetworkMap};

/// Neutron DVS agent
#[derive(Parser, Debug)]
#[command(name = "dvs-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config_file: PathBuf,

    /// Host name reported to the control plane
    #[arg(long)]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Seconds between loop iterations
    #[arg(long)]
    polling_interval: Option<u64>,

    /// Only process ports when something changed
    #[arg(long)]
    minimize_polling: bool,
}

/// Initialize tracing/logging.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn load_config(args: &Args) -> Result<AgentConfig, dvs_agent::ConfigError> {
    let mut config = AgentConfig::load_or_default(&args.config_file)?;
    if let Some(ref host) = args.host {
        config.agent.host = host.clone();
    }
    if let Some(interval) = args.polling_interval {
        config.agent.polling_interval_secs = interval;
    }
    if args.minimize_polling {
        config.agent.minimize_polling = true;
    }
    config.validate()?;
    Ok(config)
}

/// Stops the agent on SIGTERM or Ctrl-C.
fn setup_signal_handlers(agent: DvsAgent) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("Agent caught SIGTERM, quitting daemon loop."),
            _ = tokio::signal::ctrl_c() => debug!("Agent caught SIGINT, quitting daemon loop."),
        }
        agent.stop();
    });
    Ok(())
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let mappings = config.bridge_mappings()?;
    let network_map = NetworkMap::from_mappings(&mappings, |dvs_name| {
        info!("Connecting to DVS {} on {}", dvs_name, config.ml2_vmware.vsphere_hostname);
        Ok(Arc::new(MemoryDvs::new(dvs_name)) as Arc<dyn DvsBackend>)
    })
    .context("connecting distributed switches")?;
    info!("Network map: {:?}", network_map);

    let sg_agent = Arc::new(DvsSecurityGroupRpc::new(
        Arc::new(VCenterFirewallDriver),
        Arc::new(LoopbackSecurityGroupServer),
    ));
    let agent = DvsAgent::new(
        Arc::clone(&config),
        network_map,
        Arc::new(LoopbackPluginRpc),
        sg_agent,
    );

    let reporter = StateReporter::new(agent.clone(), Arc::new(LoopbackStateRpc))?;
    let heartbeat = reporter.spawn(config.report_interval());
    let (notifier, pump) = NotificationPump::spawn(agent.clone());
    setup_signal_handlers(agent.clone())?;

    let mut daemon = AgentDaemon::new(agent);
    daemon.rpc_loop().await;

    drop(notifier);
    if let Some(processed) = pump.shutdown(config.quitting_rpc_timeout()).await {
        debug!("{} notifications processed", processed);
    }
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("====================================================================");
    info!("Starting dvs-agent");
    info!("====================================================================");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{} Agent terminated!", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Host: {}", config.agent.host);
    info!("Polling interval: {}s", config.agent.polling_interval_secs);
    info!("Configuration: {:?}", config);

    match run(config).await {
        Ok(()) => {
            info!("dvs-agent exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#} Agent terminated!", e);
            ExitCode::FAILURE
        }
    }
}
