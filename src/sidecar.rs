//! Sidecar proxy lifecycle and bootstrap configuration.
//!
//! Every node runs an Envoy sidecar that consumes its routing program from
//! the control plane over the aggregated discovery stream. The bootstrap
//! rendered here only pins the node identity and the static `xds-cluster`
//! pointing at the central gRPC endpoint; everything else arrives
//! dynamically. The bootstrap is JSON, which the proxy accepts through
//! `--config-yaml`.

use anyhow::Result;
use bollard::models::PortBinding;
use log::debug;
use serde_json::json;

use crate::config::{Config, XDS_CLUSTER_NAME};
use crate::runtime::image::parse_fqin;
use crate::runtime::{Manager, PortBindings};

/// Sidecar container image.
pub const SIDECAR_IMAGE_NAME: &str = "envoyproxy/envoy:distroless-v1.27-latest";

const SIDECAR_CLUSTER_NAME: &str = "envoy-cluster";

/// Renders the sidecar bootstrap configuration for a node.
pub fn bootstrap_config_with_node_id(cfg: &Config, node_id: &str) -> Result<String> {
    let mut bootstrap = json!({
        "node": {
            "id": node_id,
            "cluster": SIDECAR_CLUSTER_NAME,
        },
        "dynamic_resources": {
            "lds_config": { "ads": {}, "resource_api_version": "V3" },
            "cds_config": { "ads": {}, "resource_api_version": "V3" },
            "ads_config": {
                "api_type": "GRPC",
                "transport_api_version": "V3",
                "grpc_services": [
                    { "envoy_grpc": { "cluster_name": XDS_CLUSTER_NAME } }
                ],
            },
        },
        "static_resources": {
            "clusters": [{
                "name": XDS_CLUSTER_NAME,
                "type": "STRICT_DNS",
                "dns_lookup_family": "V4_ONLY",
                "typed_extension_protocol_options": {
                    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                        "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                        "explicit_http_config": { "http2_protocol_options": {} },
                    },
                },
                "load_assignment": {
                    "cluster_name": XDS_CLUSTER_NAME,
                    "endpoints": [{
                        "lb_endpoints": [{
                            "endpoint": {
                                "address": {
                                    "socket_address": {
                                        "address": cfg.central_node,
                                        "port_value": cfg.grpc_port,
                                    },
                                },
                            },
                        }],
                    }],
                },
            }],
        },
    });

    if cfg.enable_debug_mode {
        bootstrap["admin"] = json!({
            "address": {
                "socket_address": { "address": "0.0.0.0", "port_value": cfg.admin_port },
            },
        });
    }

    Ok(serde_json::to_string_pretty(&bootstrap)?)
}

/// Pulls and starts the sidecar container with its ports bound to the
/// host.
pub async fn run_sidecar(manager: &dyn Manager, cfg: &Config, node_id: &str) -> Result<()> {
    let bootstrap = bootstrap_config_with_node_id(cfg, node_id)?;

    let mut port_map = PortBindings::with_capacity(3);
    for port in [cfg.ingress_port, cfg.egress_port, cfg.admin_port] {
        port_map.insert(
            port.to_string(),
            vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }],
        );
    }

    let image = parse_fqin(SIDECAR_IMAGE_NAME, &cfg.default_container_registry_domain)?;
    debug!("Starting sidecar container {}", image);

    manager
        .pull_image_and_create_container(
            &image,
            Some(vec!["--config-yaml".into(), bootstrap]),
            Some(port_map),
            false,
        )
        .await?;

    Ok(())
}

/// Removes the sidecar container and its image.
pub async fn stop_sidecar(manager: &dyn Manager, cfg: &Config) -> Result<()> {
    let image = parse_fqin(SIDECAR_IMAGE_NAME, &cfg.default_container_registry_domain)?;

    manager.remove_image_and_container(&image, false).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            central_node: "carisma-central".into(),
            grpc_port: 8016,
            admin_port: 9901,
            ..Config::default()
        }
    }

    #[test]
    fn bootstrap_pins_node_identity_and_control_plane() {
        let bootstrap = bootstrap_config_with_node_id(&test_config(), "node-3").expect("render");
        let parsed: serde_json::Value = serde_json::from_str(&bootstrap).expect("json");

        assert_eq!(parsed["node"]["id"], "node-3");
        assert_eq!(parsed["static_resources"]["clusters"][0]["name"], "xds-cluster");

        let endpoint = &parsed["static_resources"]["clusters"][0]["load_assignment"]["endpoints"]
            [0]["lb_endpoints"][0]["endpoint"]["address"]["socket_address"];
        assert_eq!(endpoint["address"], "carisma-central");
        assert_eq!(endpoint["port_value"], 8016);

        assert!(parsed.get("admin").is_none());
    }

    #[test]
    fn debug_mode_exposes_the_admin_listener() {
        let cfg = Config {
            enable_debug_mode: true,
            ..test_config()
        };

        let bootstrap = bootstrap_config_with_node_id(&cfg, "node-0").expect("render");
        let parsed: serde_json::Value = serde_json::from_str(&bootstrap).expect("json");

        assert_eq!(parsed["admin"]["address"]["socket_address"]["port_value"], 9901);
    }
}
