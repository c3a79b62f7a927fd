//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Environment variable naming the tenant units run for
pub const TENANT_ENV: &str = "FLOWNODE_TENANT";

/// Settings shared by every unit of work the executor runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tenant reported in failure context
    #[serde(default)]
    pub tenant: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Read configuration from `FLOWNODE_*` environment variables
    pub fn from_env() -> Self {
        Self {
            tenant: std::env::var(TENANT_ENV).ok().filter(|t| !t.is_empty()),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
