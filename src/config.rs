//! Configuration surface of the CARISMA daemon.
//!
//! Values are resolved in three layers: built-in defaults, the optional
//! JSON config file at `/opt/carisma/conf/carisma.json`, and command line
//! flags. Later layers win.

use std::path::Path;

use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use log::error;
use serde::{Deserialize, Serialize};

/// Default location of the config file.
pub const CONFIG_FILE_PATH: &str = "/opt/carisma/conf/carisma.json";

/// Name of the static cluster sidecars reach the control plane through.
pub const XDS_CLUSTER_NAME: &str = "xds-cluster";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub enable_debug_mode: bool,
    pub emulate_container_runtime: bool,
    pub enable_central_mode: bool,
    pub enable_discovery: bool,
    pub central_node: String,
    pub node: String,
    pub status_mgr_port: u16,
    #[serde(rename = "gRPCPort")]
    pub grpc_port: u16,
    pub udp_port: u16,
    pub udp_delay: u64,
    pub udp_timeout: u64,
    pub ingress_port: u16,
    pub egress_port: u16,
    pub admin_port: u16,
    pub default_container_registry_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        let node = match hostname::get() {
            Ok(h) => h.to_string_lossy().into_owned(),
            Err(e) => {
                error!("Could not determine hostname: {}", e);
                String::new()
            }
        };

        Self {
            enable_debug_mode: false,
            emulate_container_runtime: false,
            enable_central_mode: false,
            enable_discovery: false,
            central_node: "carisma-central".into(),
            node,
            status_mgr_port: 8010,
            grpc_port: 8016,
            udp_port: 8829,
            udp_delay: 5,
            udp_timeout: 60,
            ingress_port: 8000,
            egress_port: 9000,
            admin_port: 9901,
            default_container_registry_domain: "docker.io".into(),
        }
    }
}

/// Command line flags. Every flag shadows the config field of the same name.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "carisma", about = "CARISMA service mesh orchestrator")]
pub struct Args {
    /// Enable the debug mode
    #[arg(long)]
    pub enable_debug_mode: bool,
    /// Run with an emulated container runtime
    #[arg(long)]
    pub emulate_container_runtime: bool,
    /// Enable the central mode for the current node
    #[arg(long)]
    pub enable_central_mode: bool,
    /// Enable UDP-based discovery of the central node
    #[arg(long)]
    pub enable_discovery: bool,
    /// The hostname of the central node
    #[arg(long)]
    pub central_node: Option<String>,
    /// The hostname of the current node
    #[arg(long)]
    pub node: Option<String>,
    /// The port for the status manager to listen on
    #[arg(long)]
    pub status_manager_port: Option<u16>,
    /// The port for the gRPC server to listen on
    #[arg(long)]
    pub grpc_port: Option<u16>,
    /// The UDP port for node discovery
    #[arg(long)]
    pub udp_port: Option<u16>,
    /// The delay between UDP discovery messages, in seconds
    #[arg(long)]
    pub udp_delay: Option<u64>,
    /// The maximum time to wait for a UDP broadcast message, in seconds
    #[arg(long)]
    pub udp_timeout: Option<u64>,
    /// The ingress port for the sidecar to listen on
    #[arg(long)]
    pub ingress_port: Option<u16>,
    /// The egress port for the sidecar to listen on
    #[arg(long)]
    pub egress_port: Option<u16>,
    /// The default container registry domain used for normalizing image names
    #[arg(long)]
    pub default_container_registry_domain: Option<String>,
}

impl Config {
    /// Loads the configuration from the default file location and the
    /// supplied command line flags.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE_PATH), args)
    }

    /// Loads the configuration from an explicit file location. A missing
    /// file is fine; a present but malformed one aborts startup.
    pub fn load_from(path: &Path, args: &Args) -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed("CARISMA_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.apply_args(args);
        config.fix();

        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if args.enable_debug_mode {
            self.enable_debug_mode = true;
        }
        if args.emulate_container_runtime {
            self.emulate_container_runtime = true;
        }
        if args.enable_central_mode {
            self.enable_central_mode = true;
        }
        if args.enable_discovery {
            self.enable_discovery = true;
        }
        if let Some(ref v) = args.central_node {
            self.central_node = v.clone();
        }
        if let Some(ref v) = args.node {
            self.node = v.clone();
        }
        if let Some(v) = args.status_manager_port {
            self.status_mgr_port = v;
        }
        if let Some(v) = args.grpc_port {
            self.grpc_port = v;
        }
        if let Some(v) = args.udp_port {
            self.udp_port = v;
        }
        if let Some(v) = args.udp_delay {
            self.udp_delay = v;
        }
        if let Some(v) = args.udp_timeout {
            self.udp_timeout = v;
        }
        if let Some(v) = args.ingress_port {
            self.ingress_port = v;
        }
        if let Some(v) = args.egress_port {
            self.egress_port = v;
        }
        if let Some(ref v) = args.default_container_registry_domain {
            self.default_container_registry_domain = v.clone();
        }
    }

    // On the central node the configured central hostname always refers to
    // the node itself.
    fn fix(&mut self) {
        if self.enable_central_mode {
            self.central_node = self.node.clone();
        }
    }
}
