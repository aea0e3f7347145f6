//! K8S CSI `gRPC` service for emma cloud block storage
//!
//! One binary, two roles: the controller talks to the provider REST
//! API and drives the volume lifecycle, the node agent discovers
//! attached block devices and mounts them into pods. The role is
//! selected with `--runas`.

#![deny(
    anonymous_parameters,
    bare_trait_objects,
    unsafe_code,
    unstable_features,
    unused_extern_crates
)]

// Ignore format and lint to generated code
#[rustfmt::skip]
#[allow(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
mod csi;

mod controller;
mod driver;
mod emma;
mod identity;
mod metrics;
mod mount;
mod node;

use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::ControllerService;
use identity::IdentityService;
use mount::LinuxMounter;
use node::NodeService;

/// Argument name of the CSI socket end point
const END_POINT_ARG_NAME: &str = "endpoint";
/// Argument name of the run-as role
const RUN_AS_ARG_NAME: &str = "runas";
/// Argument name of the provider API base URL
const API_URL_ARG_NAME: &str = "api-url";
/// Argument name of the provider client id
const CLIENT_ID_ARG_NAME: &str = "client-id";
/// Argument name of the provider client secret
const CLIENT_SECRET_ARG_NAME: &str = "client-secret";
/// Argument name of the default datacenter
const DATA_CENTER_ARG_NAME: &str = "datacenter-id";
/// Argument name of the node identifier
const NODE_ID_ARG_NAME: &str = "node-id";
/// Argument name of the log level
const LOG_LEVEL_ARG_NAME: &str = "log-level";
/// Argument name of the JSON log switch
const JSON_LOGS_ARG_NAME: &str = "json-logs";
/// Argument name of the metrics listen address
const METRICS_ADDR_ARG_NAME: &str = "metrics-addr";

/// Default CSI socket of the controller process.
const CONTROLLER_END_POINT: &str = "unix:///var/lib/csi/sockets/pluginproxy/csi.sock";
/// Default CSI socket of the node process.
const NODE_END_POINT: &str = "unix:///csi/csi.sock";

/// Which service set this process runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RunAsRole {
    /// Cluster-wide volume lifecycle against the provider API
    Controller,
    /// Per-worker device discovery and mounting
    Node,
}

impl RunAsRole {
    fn parse(role: &str) -> anyhow::Result<Self> {
        match role {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            _ => anyhow::bail!("invalid runas role {role}, must be controller or node"),
        }
    }
}

/// Parse command line arguments
fn parse_args() -> ArgMatches {
    Command::new("emma-csi-driver")
        .about("CSI driver for emma cloud block storage")
        .version(driver::DRIVER_VERSION)
        .arg(
            Arg::new(RUN_AS_ARG_NAME)
                .short('r')
                .long(RUN_AS_ARG_NAME)
                .value_name("ROLE")
                .default_value("node")
                .help("Set the runtime service, either controller or node"),
        )
        .arg(
            Arg::new(END_POINT_ARG_NAME)
                .short('s')
                .long(END_POINT_ARG_NAME)
                .value_name("SOCKET_FILE")
                .help(
                    "Set the socket end point of the CSI service, \
                        defaults depend on the role",
                ),
        )
        .arg(
            Arg::new(API_URL_ARG_NAME)
                .long(API_URL_ARG_NAME)
                .value_name("URL")
                .default_value(emma::DEFAULT_BASE_URL)
                .help("Set the provider API base URL"),
        )
        .arg(
            Arg::new(CLIENT_ID_ARG_NAME)
                .long(CLIENT_ID_ARG_NAME)
                .value_name("CLIENT_ID")
                .help("Set the provider API client id, required for the controller role"),
        )
        .arg(
            Arg::new(CLIENT_SECRET_ARG_NAME)
                .long(CLIENT_SECRET_ARG_NAME)
                .value_name("CLIENT_SECRET")
                .help("Set the provider API client secret, required for the controller role"),
        )
        .arg(
            Arg::new(DATA_CENTER_ARG_NAME)
                .long(DATA_CENTER_ARG_NAME)
                .value_name("DATACENTER_ID")
                .help("Set the default datacenter, validated at startup when given"),
        )
        .arg(
            Arg::new(NODE_ID_ARG_NAME)
                .short('n')
                .long(NODE_ID_ARG_NAME)
                .value_name("NODE_ID")
                .env("NODE_ID")
                .help(
                    "Set the identifier of this node as known to the \
                        orchestrator, required for the node role",
                ),
        )
        .arg(
            Arg::new(LOG_LEVEL_ARG_NAME)
                .long(LOG_LEVEL_ARG_NAME)
                .value_name("LEVEL")
                .default_value("info")
                .help("Set the log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new(JSON_LOGS_ARG_NAME)
                .long(JSON_LOGS_ARG_NAME)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .arg(
            Arg::new(METRICS_ADDR_ARG_NAME)
                .long(METRICS_ADDR_ARG_NAME)
                .value_name("ADDR")
                .default_value(":8080")
                .help("Set the Prometheus metrics listen address"),
        )
        .get_matches()
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = parse_args();

    let log_level = matches
        .get_one::<String>(LOG_LEVEL_ARG_NAME)
        .expect("log level has a default");
    init_logging(log_level, matches.get_flag(JSON_LOGS_ARG_NAME));

    let run_as = RunAsRole::parse(
        matches
            .get_one::<String>(RUN_AS_ARG_NAME)
            .expect("runas has a default"),
    )?;
    info!(
        role = ?run_as,
        version = driver::DRIVER_VERSION,
        "emma CSI driver starting"
    );

    let metrics_addr = matches
        .get_one::<String>(METRICS_ADDR_ARG_NAME)
        .expect("metrics address has a default")
        .clone();
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(&metrics_addr).await {
            error!(error = %err, "metrics server failed");
        }
    });

    match run_as {
        RunAsRole::Controller => run_controller(&matches).await,
        RunAsRole::Node => run_node(&matches).await,
    }
}

/// Controller role: provider client, identity probe with dependency
/// check, controller service.
async fn run_controller(matches: &ArgMatches) -> anyhow::Result<()> {
    let endpoint = matches
        .get_one::<String>(END_POINT_ARG_NAME)
        .map_or(CONTROLLER_END_POINT, String::as_str);
    let api_url = matches
        .get_one::<String>(API_URL_ARG_NAME)
        .expect("api url has a default");
    let client_id = matches
        .get_one::<String>(CLIENT_ID_ARG_NAME)
        .context("client-id is required for the controller role")?;
    let client_secret = matches
        .get_one::<String>(CLIENT_SECRET_ARG_NAME)
        .context("client-secret is required for the controller role")?;

    let client = emma::Client::connect(api_url, client_id, client_secret)
        .await
        .context("failed to initialise provider API client")?;
    let client = Arc::new(client);

    match client.get_data_centers().await {
        Ok(data_centers) => {
            info!(count = data_centers.len(), "discovered data centers");
            for data_center in data_centers.iter().take(10) {
                info!(
                    id = %data_center.id,
                    name = %data_center.name,
                    provider = %data_center.provider_name,
                    location = %data_center.location_name,
                    "data center available"
                );
            }
        }
        Err(err) => warn!(error = %err, "failed to discover data centers"),
    }

    if let Some(data_center_id) = matches.get_one::<String>(DATA_CENTER_ARG_NAME) {
        client
            .validate_data_center(data_center_id)
            .await
            .with_context(|| format!("invalid default datacenter {data_center_id}"))?;
        info!(%data_center_id, "default datacenter validated");
    }

    let identity = IdentityService::new(Some(Arc::clone(&client)));
    let controller = ControllerService::new(client);

    info!(endpoint, "starting controller service");
    driver::serve(endpoint, identity, Some(controller), None).await
}

/// Node role: device discovery and mount engine behind the node
/// service.
async fn run_node(matches: &ArgMatches) -> anyhow::Result<()> {
    let endpoint = matches
        .get_one::<String>(END_POINT_ARG_NAME)
        .map_or(NODE_END_POINT, String::as_str);
    let node_id = matches
        .get_one::<String>(NODE_ID_ARG_NAME)
        .context("node-id is required (set the flag or the NODE_ID environment variable)")?;

    let identity = IdentityService::new(None);
    let node = NodeService::new(node_id.clone(), Arc::new(LinuxMounter::new()));

    info!(endpoint, %node_id, "starting node service");
    driver::serve(endpoint, identity, None, Some(node)).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_as_role_parses_both_roles() {
        assert_eq!(RunAsRole::parse("controller").unwrap(), RunAsRole::Controller);
        assert_eq!(RunAsRole::parse("node").unwrap(), RunAsRole::Node);
        assert!(RunAsRole::parse("both").is_err());
    }
}
