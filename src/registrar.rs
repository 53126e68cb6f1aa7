//! Registration of service deployments with the server's control plane.
use std::{sync::Arc, thread, time::Duration};

use reqwest::{Url, blocking::Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::ManagerConfig,
    constants::{
        DEPLOYMENTS_PATH, HTTP_CONNECT_TIMEOUT, REGISTRATION_ATTEMPTS, REGISTRATION_BASE_DELAY,
        REGISTRATION_REQUEST_TIMEOUT, USER_AGENT,
    },
    error::{ManagerError, RegistrationError, TransportError},
};

/// Body of a deployment registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub uri: String,
    /// Overwrite an existing deployment at the same URI.
    pub force: bool,
}

/// Delivers a registration request to the control plane.
pub trait ControlPlaneTransport: Send + Sync {
    fn register(&self, request: &RegistrationRequest) -> Result<(), TransportError>;
}

/// JSON-over-HTTP transport posting to `<control_plane>/deployments`.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    endpoint: String,
}

impl HttpControlPlane {
    pub fn new(control_plane: &str) -> Result<Self, TransportError> {
        let endpoint = format!("{}{DEPLOYMENTS_PATH}", control_plane.trim_end_matches('/'));
        if let Err(err) = Url::parse(&endpoint) {
            return Err(TransportError::InvalidEndpoint {
                endpoint,
                reason: err.to_string(),
            });
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(REGISTRATION_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ControlPlaneTransport for HttpControlPlane {
    fn register(&self, request: &RegistrationRequest) -> Result<(), TransportError> {
        let response = self.client.post(&self.endpoint).json(request).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Bounded exponential backoff between registration attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: REGISTRATION_ATTEMPTS,
            base_delay: REGISTRATION_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based):
    /// `base_delay * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Registers deployments, retrying transient failures.
#[derive(Clone)]
pub struct ServiceRegistrar {
    transport: Arc<dyn ControlPlaneTransport>,
    policy: RetryPolicy,
    force: bool,
    default_uri: String,
    sleeper: Sleeper,
}

impl ServiceRegistrar {
    /// Registrar posting to the configured control plane.
    pub fn from_config(config: &ManagerConfig) -> Result<Self, ManagerError> {
        let transport =
            HttpControlPlane::new(&config.control_plane).map_err(ManagerError::ControlPlaneClient)?;
        Ok(Self::new(Arc::new(transport), &config.deployment_uri))
    }

    pub fn new(transport: Arc<dyn ControlPlaneTransport>, default_uri: &str) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            force: true,
            default_uri: default_uri.to_string(),
            sleeper: Arc::new(thread::sleep),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether registrations overwrite an existing deployment (default `true`).
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Replaces the function used to wait between attempts.
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn default_uri(&self) -> &str {
        &self.default_uri
    }

    /// Registers the configured deployment URI.
    pub fn register_default(&self) -> Result<(), RegistrationError> {
        self.register_service(&self.default_uri)
    }

    /// Registers `uri`, making up to `max_attempts` attempts.
    ///
    /// Every failure is retried, including explicit rejections. The delay
    /// grows as `base_delay * 2^attempt` and no delay follows the last attempt.
    pub fn register_service(&self, uri: &str) -> Result<(), RegistrationError> {
        let request = RegistrationRequest {
            uri: uri.to_string(),
            force: self.force,
        };
        let attempts = self.policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.transport.register(&request) {
                Ok(()) => {
                    info!("Registered deployment '{uri}' on attempt {attempt}");
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    warn!("Registration of '{uri}' failed after {attempt} attempts: {source}");
                    return Err(RegistrationError::RegistrationFailed {
                        uri: uri.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        "Registration attempt {attempt} for '{uri}' failed: {err}; retrying in {:?}",
                        delay
                    );
                    (self.sleeper)(delay);
                    attempt += 1;
                }
            }
        }
    }
}
