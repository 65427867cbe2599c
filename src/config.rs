use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when `provider.role` is not set
pub const ROLE_ENV_VAR: &str = "AWS_LAMBDA_ROLE_ARN";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy and control API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where application records are kept
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Function provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control API (deploy, activate, ...)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Bearer token for the control API.
    /// If not set, a random token is generated at startup and logged
    pub control_token: Option<String>,

    /// Max time to wait for a function invocation, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time a deploy request may take, activation wait included
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    /// Largest request body forwarded to a function
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Largest deploy request accepted by the control API
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,

    /// Run concurrent deploys of the same app one at a time
    #[serde(default)]
    pub serialize_deploys: bool,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            control_port: default_control_port(),
            control_bind: default_control_bind(),
            control_token: None,
            request_timeout_secs: default_request_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
            serialize_deploys: false,
        }
    }
}

/// Registry storage backend
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryType {
    /// Process-local map, lost on restart (default)
    #[default]
    Memory,
    /// SQLite file
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default, rename = "type")]
    pub registry_type: RegistryType,

    /// Database file for the sqlite registry
    #[serde(default = "default_registry_path")]
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: RegistryType::default(),
            path: default_registry_path(),
        }
    }
}

/// Function provider kind
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Lambda-compatible REST API (default)
    #[default]
    Lambda,
    /// In-process functions, for local runs and tests
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default, rename = "type")]
    pub provider_type: ProviderType,

    /// Base URL of the Lambda-compatible API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Execution role for created functions (falls back to AWS_LAMBDA_ROLE_ARN)
    pub role: Option<String>,

    /// Runtime identifier for created functions
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Handler entry point for created functions
    #[serde(default = "default_handler")]
    pub handler: String,

    /// Instruction set for created functions
    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Execution timeout configured on created functions, in seconds
    #[serde(default = "default_function_timeout")]
    pub function_timeout_secs: u64,

    /// How long to wait for a created/updated function to become invokable
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,

    /// How often to poll the function state while waiting
    #[serde(default = "default_activation_poll_interval")]
    pub activation_poll_interval_ms: u64,
}

impl ProviderConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    pub fn activation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.activation_poll_interval_ms)
    }

    /// The configured role, or the one from the environment
    pub fn resolve_role(&self) -> Option<String> {
        self.role
            .clone()
            .or_else(|| std::env::var(ROLE_ENV_VAR).ok())
            .filter(|r| !r.is_empty())
    }

    /// Validate the provider configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.activation_poll_interval_ms == 0 {
            return Err("provider: 'activation_poll_interval_ms' must be greater than 0".to_string());
        }

        if self.provider_type == ProviderType::Lambda {
            if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
                return Err(format!(
                    "provider: 'endpoint' must be an http(s) URL, got '{}'",
                    self.endpoint
                ));
            }
            if self.resolve_role().is_none() {
                return Err(format!(
                    "provider: lambda provider requires 'role' or {}",
                    ROLE_ENV_VAR
                ));
            }
        }

        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            endpoint: default_endpoint(),
            role: None,
            runtime: default_runtime(),
            handler: default_handler(),
            architecture: default_architecture(),
            function_timeout_secs: default_function_timeout(),
            activation_timeout_secs: default_activation_timeout(),
            activation_poll_interval_ms: default_activation_poll_interval(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    9999
}

fn default_control_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_deploy_timeout() -> u64 {
    120
}

fn default_max_body_bytes() -> usize {
    6 * 1024 * 1024
}

fn default_max_artifact_bytes() -> usize {
    70 * 1024 * 1024
}

fn default_registry_path() -> String {
    "./fngate.db".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4566".to_string()
}

fn default_runtime() -> String {
    "nodejs20.x".to_string()
}

fn default_handler() -> String {
    "index.handler".to_string()
}

fn default_architecture() -> String {
    "arm64".to_string()
}

fn default_function_timeout() -> u64 {
    60
}

fn default_activation_timeout() -> u64 {
    60
}

fn default_activation_poll_interval() -> u64 {
    100
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(e);
        }

        if self.server.port != 0 && self.server.port == self.server.control_port {
            errors.push(format!(
                "server: proxy and control API cannot share port {}",
                self.server.port
            ));
        }

        if self.server.max_body_bytes == 0 {
            errors.push("server: 'max_body_bytes' must be greater than 0".to_string());
        }

        if self.registry.registry_type == RegistryType::Sqlite && self.registry.path.is_empty() {
            errors.push("registry: sqlite registry requires 'path'".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
