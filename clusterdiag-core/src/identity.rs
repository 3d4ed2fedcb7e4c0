//! Instance identity and clock collaborators.

use crate::config::InstanceConfig;
use crate::types::fold_instance_name;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Environment variable that overrides the detected instance id.
pub const INSTANCE_ID_ENV: &str = "CLUSTERDIAG_INSTANCE_ID";

const SHORT_PREFIX_LEN: usize = 8;
const SHORT_HASH_BYTES: usize = 3;

/// Stable identifiers of the current process within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    full_id: String,
    short_id: String,
}

impl InstanceIdentity {
    /// Identity with a short id derived from `full_id`.
    ///
    /// The short id prefixes archived file names, so it must differ for
    /// every distinct full id, including ids that share a long common prefix
    /// (`web-server-1`, `web-server-2`). It is a readable prefix plus a
    /// digest of the case-folded full id.
    pub fn new(full_id: impl Into<String>) -> Self {
        let full_id = full_id.into();
        let short_id = derive_short_id(&full_id);
        Self { full_id, short_id }
    }

    pub fn with_short_id(mut self, short_id: impl Into<String>) -> Self {
        self.short_id = short_id.into();
        self
    }

    /// Resolve identity from config, then `CLUSTERDIAG_INSTANCE_ID`, then the host name.
    pub fn from_config(config: &InstanceConfig) -> Self {
        let full_id = config
            .id
            .clone()
            .or_else(|| std::env::var(INSTANCE_ID_ENV).ok())
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(hostname);

        let identity = Self::new(full_id);
        match &config.short_id {
            Some(short) if !short.trim().is_empty() => identity.with_short_id(short.clone()),
            _ => identity,
        }
    }

    pub fn full_instance_id(&self) -> &str {
        &self.full_id
    }

    pub fn short_instance_id(&self) -> &str {
        &self.short_id
    }
}

fn derive_short_id(full_id: &str) -> String {
    let prefix = full_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(SHORT_PREFIX_LEN)
        .collect::<String>()
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(fold_instance_name(full_id).as_bytes());
    let digest = hex::encode(&hasher.finalize()[..SHORT_HASH_BYTES]);

    if prefix.is_empty() {
        digest
    } else {
        format!("{}-{}", prefix, digest)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Source of UTC time for session ids and end stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
