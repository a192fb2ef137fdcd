//! Poll Service (`pollsrv`)
//!
//! Polls Modbus energy meters and reconciles their energy counters into
//! interval records.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use common::ServiceArgs;
use meter_protocols::DataGroup;
use pollsrv::{ModelCatalog, PollService, PollSrvConfig};

#[derive(Debug, Parser)]
#[command(name = "pollsrv", version, about = "Modbus meter polling service")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "POLLSRV_CONFIG", default_value = "config/pollsrv.yaml")]
    config: PathBuf,

    /// Run a single cycle of this group (instant or cumulative), print the
    /// summary as JSON and exit
    #[arg(long, value_name = "GROUP")]
    once: Option<DataGroup>,

    #[command(flatten)]
    common: ServiceArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = common::logging::init_with_config(&args.common.log_config("pollsrv"))?;

    let config = PollSrvConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Validation mode: compile every register schema and exit
    if args.common.validate {
        let catalog = ModelCatalog::load(&config.models, config.poll.max_block_size)?;
        for device in &config.devices {
            catalog.endpoint(device)?;
        }
        debug!("Effective configuration:\n{}", serde_yaml::to_string(&config)?);
        info!(
            "Configuration valid: {} models, {} devices",
            catalog.len(),
            config.devices.len()
        );
        return Ok(());
    }

    let service = PollService::build(&config).await?;

    if let Some(group) = args.once {
        let summary = service.run_once(group).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let token = common::shutdown::shutdown_token();
    info!("pollsrv started");
    service.run(token).await?;
    info!("pollsrv stopped");
    Ok(())
}
