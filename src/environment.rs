//! Runtime environment detection
//!
//! Classifies the host from process environment variables. Serverless markers
//! take precedence over container markers; a process with neither is `Local`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Set by the function-as-a-service runtime for every invocation
const SERVERLESS_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
const SERVERLESS_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";
const SERVERLESS_MEMORY_SIZE: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
const EXECUTION_ENV: &str = "AWS_EXECUTION_ENV";

/// Container orchestration metadata endpoints
const CONTAINER_METADATA_V4: &str = "ECS_CONTAINER_METADATA_URI_V4";
const CONTAINER_METADATA: &str = "ECS_CONTAINER_METADATA_URI";
const KUBERNETES_SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";

/// Where the process is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEnvironment {
    /// Function-as-a-service host with a hard deadline and memory-proportional CPU
    ConstrainedServerless,
    /// Long-running container with orchestrator-assigned resources
    ManagedContainer,
    /// Unconstrained local process
    Local,
}

impl RuntimeEnvironment {
    /// Stable lowercase name used in logs, metrics labels and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnvironment::ConstrainedServerless => "constrained_serverless",
            RuntimeEnvironment::ManagedContainer => "managed_container",
            RuntimeEnvironment::Local => "local",
        }
    }

    /// Whether submissions must fail fast instead of blocking
    pub fn is_constrained(&self) -> bool {
        matches!(self, RuntimeEnvironment::ConstrainedServerless)
    }
}

impl fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "constrained_serverless" | "serverless" | "lambda" => Ok(RuntimeEnvironment::ConstrainedServerless),
            "managed_container" | "container" | "ecs" => Ok(RuntimeEnvironment::ManagedContainer),
            "local" => Ok(RuntimeEnvironment::Local),
            other => Err(format!("unknown runtime environment: {other}")),
        }
    }
}

/// Result of inspecting the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    /// Detected environment class
    pub environment: RuntimeEnvironment,
    /// Configured memory ceiling in MB, when the platform advertises one
    pub memory_hint_mb: Option<u64>,
}

/// Detect the runtime environment from the current process environment.
pub fn detect() -> RuntimeEnvironment {
    profile().environment
}

/// Detect the environment and extract the memory hint from the current process.
pub fn profile() -> EnvironmentProfile {
    profile_with(|key| std::env::var(key).ok())
}

/// Classify using an arbitrary variable lookup.
///
/// Lets callers and tests supply signals without touching the real process
/// environment.
pub fn detect_with<F>(lookup: F) -> RuntimeEnvironment
where
    F: Fn(&str) -> Option<String>,
{
    profile_with(lookup).environment
}

/// Build a full [`EnvironmentProfile`] from an arbitrary variable lookup.
pub fn profile_with<F>(lookup: F) -> EnvironmentProfile
where
    F: Fn(&str) -> Option<String>,
{
    let present = |key: &str| lookup(key).map(|v| !v.trim().is_empty()).unwrap_or(false);
    let execution_env = lookup(EXECUTION_ENV).unwrap_or_default();

    let environment = if present(SERVERLESS_FUNCTION_NAME)
        || present(SERVERLESS_RUNTIME_API)
        || execution_env.starts_with("AWS_Lambda_")
    {
        RuntimeEnvironment::ConstrainedServerless
    } else if present(CONTAINER_METADATA_V4)
        || present(CONTAINER_METADATA)
        || present(KUBERNETES_SERVICE_HOST)
        || execution_env.starts_with("AWS_ECS_")
    {
        RuntimeEnvironment::ManagedContainer
    } else {
        RuntimeEnvironment::Local
    };

    let memory_hint_mb = match environment {
        RuntimeEnvironment::ConstrainedServerless => lookup(SERVERLESS_MEMORY_SIZE)
            .and_then(|v| v.trim().parse::<u64>().ok()),
        _ => None,
    };

    debug!(
        environment = %environment,
        memory_hint_mb = ?memory_hint_mb,
        "Detected runtime environment"
    );

    EnvironmentProfile {
        environment,
        memory_hint_mb,
    }
}
