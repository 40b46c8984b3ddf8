use clap::Parser;
use smartthings_gateway::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CREDENTIAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Run the SmartThings gateway: OAuth sign-in, webhook listener and device discovery
#[derive(Parser, Debug)]
#[command(name = "smartthings-gateway", version, about)]
struct Args {
    /// Path to the JSON configuration document
    #[arg(short, long, env = "SMARTTHINGS_GATEWAY_CONFIG")]
    config: PathBuf,

    /// Directory for the token and app-info documents
    #[arg(long, env = "SMARTTHINGS_GATEWAY_PERSIST_DIR")]
    persist_dir: Option<PathBuf>,

    /// Open the authorization URL in a browser when no credential is stored
    #[arg(long)]
    open_browser: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "Gateway stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = GatewayConfig::from_file(&args.config)?;
    if let Some(dir) = args.persist_dir {
        config.persist_dir = Some(dir);
    }

    let gateway = Gateway::new(config)?;
    let authorized = gateway.init().await;

    let server = WebhookServer::new(gateway.clone(), Arc::new(log_device_event));
    server.start().await?;

    if !authorized && args.open_browser {
        let url = gateway.authorization_url();
        if let Err(e) = webbrowser::open(&url) {
            warn!(error = %e, "Could not open a browser; open the authorization URL manually");
        }
    }

    let discovery = tokio::spawn(discover_when_authorized(gateway.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
    discovery.abort();
    server.shutdown().await;
    Ok(())
}

fn log_device_event(event: &DeviceEvent) {
    info!(
        device_id = %event.device_id,
        component = event.component_id.as_deref().unwrap_or("main"),
        capability = %event.capability,
        attribute = %event.attribute,
        value = %event.value,
        "Device attribute changed"
    );
}

async fn discover_when_authorized(gateway: Gateway) {
    while !gateway.tokens().has_credential() {
        tokio::time::sleep(CREDENTIAL_POLL_INTERVAL).await;
    }

    if let Err(e) = discover_devices(&gateway).await {
        error!(error = %e, "Device discovery failed");
    }
}

/// Match configured devices by label and subscribe to their capabilities
async fn discover_devices(gateway: &Gateway) -> Result<()> {
    let selections = &gateway.config().devices;
    if selections.is_empty() {
        info!("No devices configured");
        return Ok(());
    }

    let devices = gateway.get_devices().await?;
    for selection in selections {
        let wanted = selection.device_label.trim();
        let Some(device) = devices
            .iter()
            .find(|d| d.label.as_deref().map(str::trim) == Some(wanted))
        else {
            warn!(label = wanted, "Configured device not found in SmartThings account");
            continue;
        };

        info!(label = wanted, device_id = %device.device_id, "Matched configured device");
        if let Err(e) = gateway.get_status(&device.device_id).await {
            warn!(device_id = %device.device_id, error = %e, "Initial status read failed");
        }

        for capability in &selection.capabilities {
            match gateway.create_subscription(&device.device_id, capability).await {
                Ok(SubscriptionOutcome::Created) => {
                    info!(device_id = %device.device_id, capability = %capability, "Subscribed to capability")
                }
                Ok(SubscriptionOutcome::AlreadySubscribed) => {
                    info!(device_id = %device.device_id, capability = %capability, "Subscription already exists")
                }
                Err(GatewayError::MissingInstallation) => {
                    warn!("Webhook CONFIRMATION has not happened yet; skipping subscriptions");
                    return Ok(());
                }
                Err(e) => {
                    warn!(device_id = %device.device_id, capability = %capability, error = %e, "Subscription failed")
                }
            }
        }
    }

    Ok(())
}
