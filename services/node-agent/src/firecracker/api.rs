//! Firecracker HTTP API client.
//!
//! Every call before `InstanceStart` configures the VM; afterwards only
//! actions and info queries are valid.

use std::path::Path;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use super::config::{BootSource, DriveConfig, MachineConfig, NetworkInterface};

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

/// Instance information from `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    /// `Not started`, `Running` or `Paused`.
    pub state: String,
    pub vmm_version: String,
}

/// Firecracker API client bound to one VM's socket.
pub struct FirecrackerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
        }
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<(), ApiError> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", config).await
    }

    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        self.put(&format!("/drives/{}", config.drive_id), config).await
    }

    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        self.put(&format!("/network-interfaces/{}", config.iface_id), config)
            .await
    }

    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.put("/actions", &Action { action_type: "InstanceStart" })
            .await
    }

    /// Asks the guest to shut down. Only honoured by x86_64 guests.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.put("/actions", &Action { action_type: "SendCtrlAltDel" })
            .await
    }

    pub async fn get_instance_info(&self) -> Result<InstanceInfo, ApiError> {
        let body = self.send(Method::GET, "/", Body::empty()).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let bytes = serde_json::to_vec(body)?;
        self.send(Method::PUT, path, Body::from(bytes)).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Body,
    ) -> Result<impl Buf, ApiError> {
        debug!(method = %method, path, "Firecracker API request");

        let request = Request::builder()
            .method(method)
            .uri(Uri::new(&self.socket_path, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            Ok(body)
        } else {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            error!(status = %status, path, message = %message, "Firecracker API error");
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}
