//! Container runtime abstraction.
//!
//! The orchestrator only ever talks to the [`Manager`] trait; the Docker
//! implementation is the production backend, while the emulated one backs
//! debugging sessions and tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use bollard::models::PortBinding;
use serde::Deserialize;

pub mod docker;
pub mod emulated;
pub mod image;

pub use docker::DockerManager;
pub use emulated::EmulatedManager;
pub use image::Image;

/// Name of the bundle descriptor file at the container filesystem root.
pub const BUNDLE_CONFIG_FILE_NAME: &str = "info.json";

pub(crate) const WILDCARD_IP: &str = "0.0.0.0";

/// Host port bindings keyed by container port (e.g. `"8000/tcp"`).
pub type PortBindings = HashMap<String, Vec<PortBinding>>;

/// Information related to a concrete container instance.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub first_name: String,
    pub image: String,
    pub ports: String,
    pub status: String,
}

/// The bundle descriptor every in-car app ships as `info.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    pub bundle_id: String,
}

/// Common container manager interface.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Returns the list of containers present on the machine.
    async fn containers(&self) -> Result<Vec<Container>>;

    /// Starts a container identified by its ID.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stops a container identified by its ID.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Pulls the requested image, creates a container with all ports
    /// published and the supplied bindings, and starts it. Returns the
    /// bundle ID and service port when bundle verification is requested.
    async fn pull_image_and_create_container(
        &self,
        name: &str,
        args: Option<Vec<String>>,
        port_bindings: Option<PortBindings>,
        verify_bundle_config: bool,
    ) -> Result<(String, i32)>;

    /// Removes the specified image and its associated container. Returns
    /// the bundle ID and service port when bundle verification is
    /// requested.
    async fn remove_image_and_container(
        &self,
        name: &str,
        verify_bundle_config: bool,
    ) -> Result<(String, i32)>;

    /// Closes the connection to the underlying container engine.
    async fn close(&self) -> Result<()>;
}
