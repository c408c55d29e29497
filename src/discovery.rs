//! UDP bootstrap discovery.
//!
//! The central node periodically broadcasts its gRPC endpoint; satellites
//! without a configured central node listen for those beacons and adopt
//! the first one they can decode. Packets start with the ASCII magic
//! `$CARISMA$` followed by a type byte and a self-describing JSON payload.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::interval;

use crate::config::Config;

const MAGIC: &[u8] = b"$CARISMA$";
const BROADCAST_ADDR: &str = "255.255.255.255";

/// Type of a CARISMA discovery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    Broadcast = 1,
}

/// Beacon announcing the central node's gRPC endpoint as `<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub hostname: String,
}

impl BroadcastMessage {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Encodes the message as magic, type byte, JSON payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + 32);
        bytes.extend_from_slice(MAGIC);
        bytes.push(MessageType::Broadcast as u8);
        serde_json::to_writer(&mut bytes, self)?;

        Ok(bytes)
    }

    /// Decodes a previously encoded broadcast message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if !is_carisma_message(bytes) {
            bail!("not a CARISMA message");
        }

        serde_json::from_slice(&bytes[MAGIC.len() + 1..]).context("malformed broadcast payload")
    }
}

/// Checks whether the byte sequence carries the CARISMA magic.
pub fn is_carisma_message(bytes: &[u8]) -> bool {
    bytes.len() > MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// Determines the message type of a CARISMA packet.
pub fn message_type(bytes: &[u8]) -> MessageType {
    if !is_carisma_message(bytes) {
        return MessageType::Invalid;
    }

    match bytes[MAGIC.len()] {
        1 => MessageType::Broadcast,
        _ => MessageType::Invalid,
    }
}

/// A UDP socket prepared for sending and receiving discovery broadcasts.
pub struct BroadcastService {
    socket: UdpSocket,
}

impl BroadcastService {
    pub fn new(cfg: &Config) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", cfg.udp_port).parse()?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // In debug mode we reuse address and port to ease up debugging
        if cfg.enable_debug_mode {
            socket.set_reuse_address(true)?;
            socket.set_reuse_port(true)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.set_broadcast(true)?;

        Ok(Self { socket })
    }

    /// Blocks the caller and broadcasts the supplied message on every tick.
    pub async fn repeatedly_write_message(
        &self,
        port: u16,
        msg: &BroadcastMessage,
        delay: Duration,
    ) -> Result<()> {
        let target = format!("{}:{}", BROADCAST_ADDR, port);
        let data = msg.to_bytes()?;

        let mut ticker = interval(delay);
        ticker.tick().await; // the first tick fires immediately

        loop {
            ticker.tick().await;
            self.socket.send_to(&data, target.as_str()).await?;
            debug!("Sent UDP broadcast packet");
        }
    }

    /// Tries to read a packet within the specified time.
    pub async fn read_packet_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 1024];

        let (len, addr) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .context("timed out waiting for a discovery broadcast")??;
        buf.truncate(len);

        debug!("Received UDP broadcast packet from {}", addr);

        Ok((buf, addr))
    }
}

/// Runs the discovery protocol for this node: the central node starts a
/// background beacon; a satellite without a configured central node blocks
/// until one is discovered and records its hostname in the config.
pub async fn handle_discovery(cfg: &mut Config) {
    let service = match BroadcastService::new(cfg) {
        Ok(service) => service,
        Err(e) => {
            error!("Could not set up discovery socket: {}", e);
            return;
        }
    };

    if cfg.enable_central_mode {
        let msg = BroadcastMessage::new(format!("{}:{}", cfg.node, cfg.grpc_port));
        let port = cfg.udp_port;
        let delay = Duration::from_secs(cfg.udp_delay);

        tokio::spawn(async move {
            if let Err(e) = service.repeatedly_write_message(port, &msg, delay).await {
                error!("Discovery beacon stopped: {}", e);
            }
        });
    } else if cfg.central_node.is_empty() {
        let timeout = Duration::from_secs(cfg.udp_timeout);

        loop {
            let (packet, _) = match service.read_packet_with_timeout(timeout).await {
                Ok(read) => read,
                Err(e) => {
                    error!("Discovery failed: {}", e);
                    return;
                }
            };

            if message_type(&packet) != MessageType::Broadcast {
                continue;
            }

            match BroadcastMessage::decode(&packet) {
                Ok(msg) => {
                    // the beacon carries "<host>:<port>"; the gRPC port is
                    // configured separately
                    let host = msg
                        .hostname
                        .split_once(':')
                        .map(|(host, _)| host.to_string())
                        .unwrap_or(msg.hostname);

                    info!("Discovered central node {}", host);
                    cfg.central_node = host;

                    break;
                }
                Err(e) => {
                    error!("Ignoring undecodable discovery packet: {}", e);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_is_identity() {
        let msg = BroadcastMessage::new("127.0.0.1:8016");

        let bytes = msg.to_bytes().expect("encode");
        let decoded = BroadcastMessage::decode(&bytes).expect("decode");

        assert_eq!(decoded, msg);
    }

    #[test]
    fn recognizes_the_magic() {
        let bytes = BroadcastMessage::new("127.0.0.1").to_bytes().expect("encode");

        assert!(is_carisma_message(&bytes));
        assert!(!is_carisma_message(b"$NOTCARISMA$ hello"));
        assert!(!is_carisma_message(b"$CAR"));
    }

    #[test]
    fn identifies_the_message_type() {
        let bytes = BroadcastMessage::new("127.0.0.1").to_bytes().expect("encode");

        assert_eq!(message_type(&bytes), MessageType::Broadcast);

        let mut unknown = bytes.clone();
        unknown[MAGIC.len()] = 0x7f;
        assert_eq!(message_type(&unknown), MessageType::Invalid);
        assert_eq!(message_type(b"random noise"), MessageType::Invalid);
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(1);
        bytes.extend_from_slice(b"{not json");

        assert!(BroadcastMessage::decode(&bytes).is_err());
    }
}
