//! Access gate for administrative HTTP endpoints.
//! When the guarded capability is disabled every request, whatever its method, path or query
//! parameters, is answered with the same pre-rendered JSON body:
//! `{"error": "<capability> is not available for this cluster. To enable it, set the configuration key '<key>'."}`.
//! The gate has no state, the body is rendered once when the gate is built.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use tracing::{debug, info};

const ENV_GATE_ENABLED: &str = "PROCWIN_GATE_ENABLED";
const ENV_GATE_CAPABILITY: &str = "PROCWIN_GATE_CAPABILITY";
const ENV_GATE_CONFIG_KEY: &str = "PROCWIN_GATE_CONFIG_KEY";
const ENV_GATE_PORT: &str = "PROCWIN_GATE_PORT";

/// Error types for the access gate
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),
    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Requests are passed through to the guarded router only when enabled.
    pub enabled: bool,
    /// Human readable name of the guarded capability.
    pub capability: String,
    /// Configuration key which enables the capability.
    pub config_key: String,
    pub port: u16,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capability: "Web submission interface".to_owned(),
            config_key: "jobmanager.web.submit.enable".to_owned(),
            port: 8443,
        }
    }
}

/// This implementation is to load the gate configuration from env variables
impl TryFrom<HashMap<String, String>> for GateConfig {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut config = GateConfig::default();

        if let Some(enabled) = env_vars.get(ENV_GATE_ENABLED) {
            config.enabled = enabled.trim().parse().map_err(|e| {
                Error::Config(format!(
                    "Parsing {ENV_GATE_ENABLED}(set to '{enabled}'): {e:?}"
                ))
            })?;
        }

        if let Some(capability) = env_vars.get(ENV_GATE_CAPABILITY) {
            config.capability = capability.to_owned();
        }

        if let Some(config_key) = env_vars.get(ENV_GATE_CONFIG_KEY) {
            config.config_key = config_key.to_owned();
        }

        if let Some(port) = env_vars.get(ENV_GATE_PORT) {
            config.port = port.trim().parse().map_err(|e| {
                Error::Config(format!("Parsing {ENV_GATE_PORT}(set to '{port}'): {e:?}"))
            })?;
        }

        Ok(config)
    }
}

/// Answers every request with a fixed denial while the capability is disabled.
#[derive(Debug, Clone)]
pub struct AccessGate {
    enabled: bool,
    body: Bytes,
}

impl AccessGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            enabled: config.enabled,
            body: render_denial(&config.capability, &config.config_key),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The JSON body returned for every denied request.
    pub fn denial_body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `inner` as is when the capability is enabled, otherwise a router which denies every
    /// request.
    pub fn router(self, inner: Router) -> Router {
        if self.enabled {
            return inner;
        }
        Router::new().fallback(deny_handler).with_state(self)
    }

    /// Start the gate server on the specified address
    pub async fn start_server(self, addr: SocketAddr, inner: Router) -> Result<()> {
        let router = self.router(inner);

        info!(?addr, "Starting access gate server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Server(format!("Server error: {e}")))?;

        Ok(())
    }
}

fn render_denial(capability: &str, config_key: &str) -> Bytes {
    let message = format!(
        "{capability} is not available for this cluster. To enable it, set the configuration key '{config_key}'."
    );
    // escaping a string into a JSON string literal cannot fail
    let message = serde_json::Value::String(message).to_string();
    Bytes::from(format!("{{\"error\": {message}}}"))
}

/// Denial handler, path and query parameters are ignored
async fn deny_handler(State(gate): State<AccessGate>) -> impl IntoResponse {
    debug!("Denied request to a disabled capability");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        gate.body.clone(),
    )
}
