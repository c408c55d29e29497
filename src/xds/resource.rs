//! Route table and listener compilation.

use log::debug;

use crate::config::{Config, XDS_CLUSTER_NAME};
use crate::proto::xds::v1::{
    http_connection_manager, listener, HttpConnectionManager, Listener, Route,
    RouteConfiguration, RouteMatch, SocketAddress, VirtualHost,
};
use crate::registry::ServiceConfigSnapshot;

use super::cluster::generate_cluster_name;

pub(crate) const GRPC_ROUTE_NAME: &str = "grpc_route";
pub(crate) const LOCAL_GRPC_ROUTE_NAME: &str = "local_grpc_route";
const GRPC_VHOST_NAME: &str = "grpc_vhost";
const LOCAL_GRPC_VHOST_NAME: &str = "local_grpc_vhost";
const INGRESS_STAT_PREFIX: &str = "ingress_http";
const EGRESS_STAT_PREFIX: &str = "egress_http";
const INGRESS_LISTENER_NAME: &str = "ingress_listener";
const EGRESS_LISTENER_NAME: &str = "egress_listener";
const ANY_ADDRESS: &str = "0.0.0.0";

/// Compiles the two route tables for one target node: `grpc_route`
/// (egress, remote routes first, then local ones) and `local_grpc_route`
/// (ingress, local routes only). Both carry a single wildcard virtual
/// host.
pub(crate) fn make_routes(
    services: &ServiceConfigSnapshot,
    local_node_id: &str,
) -> Vec<RouteConfiguration> {
    let mut routes = Vec::new();
    let mut local_routes = Vec::new();

    for (node_id, service_config) in services {
        for bundle_id in service_config.keys() {
            let is_local = node_id == local_node_id;
            let cluster_id = generate_cluster_name(bundle_id, is_local);

            let route = Route {
                r#match: Some(RouteMatch {
                    prefix: format!("/{}", bundle_id),
                    grpc_only: true,
                }),
                cluster: cluster_id.clone(),
            };

            debug!(
                "Registering {} route /{} -> {} for {}",
                if is_local { "local" } else { "remote" },
                bundle_id,
                cluster_id,
                local_node_id
            );

            if is_local {
                local_routes.push(route);
            } else {
                routes.push(route);
            }
        }
    }

    let mut egress_routes = routes;
    egress_routes.extend(local_routes.iter().cloned());

    vec![
        RouteConfiguration {
            name: GRPC_ROUTE_NAME.into(),
            virtual_hosts: vec![VirtualHost {
                name: GRPC_VHOST_NAME.into(),
                domains: vec!["*".into()],
                routes: egress_routes,
            }],
        },
        RouteConfiguration {
            name: LOCAL_GRPC_ROUTE_NAME.into(),
            virtual_hosts: vec![VirtualHost {
                name: LOCAL_GRPC_VHOST_NAME.into(),
                domains: vec!["*".into()],
                routes: local_routes,
            }],
        },
    ]
}

fn make_http_connection_manager(stat_prefix: &str, route_config_name: &str) -> HttpConnectionManager {
    HttpConnectionManager {
        codec_type: http_connection_manager::CodecType::Auto as i32,
        stat_prefix: stat_prefix.into(),
        route_config_name: route_config_name.into(),
        config_source_cluster: XDS_CLUSTER_NAME.into(),
    }
}

/// Compiles the static listener pair: ingress bound to the configured
/// ingress port serving `local_grpc_route`, egress bound to the egress
/// port serving `grpc_route`.
pub(crate) fn make_listeners(cfg: &Config) -> Vec<Listener> {
    debug!(
        "Registering ingress listener on port {} and egress listener on port {}",
        cfg.ingress_port, cfg.egress_port
    );

    vec![
        Listener {
            name: INGRESS_LISTENER_NAME.into(),
            address: Some(SocketAddress {
                address: ANY_ADDRESS.into(),
                port_value: cfg.ingress_port as u32,
            }),
            traffic_direction: listener::TrafficDirection::Inbound as i32,
            http_connection_manager: Some(make_http_connection_manager(
                INGRESS_STAT_PREFIX,
                LOCAL_GRPC_ROUTE_NAME,
            )),
        },
        Listener {
            name: EGRESS_LISTENER_NAME.into(),
            address: Some(SocketAddress {
                address: ANY_ADDRESS.into(),
                port_value: cfg.egress_port as u32,
            }),
            traffic_direction: listener::TrafficDirection::Outbound as i32,
            http_connection_manager: Some(make_http_connection_manager(
                EGRESS_STAT_PREFIX,
                GRPC_ROUTE_NAME,
            )),
        },
    ]
}
