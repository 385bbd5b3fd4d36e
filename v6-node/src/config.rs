use std::path::PathBuf;

use clap::Parser;

/// Node agent configuration, grounded on the teacher's clap::Args-derived
/// config struct (`OperatorConfig`): one flat struct, CLI flags with env
/// fallbacks, no interactive wizard.
#[derive(Debug, Clone, Parser)]
#[command(name = "v6-node-agent")]
pub struct NodeConfig {
    #[arg(long, env = "V6_COORDINATOR_URL")]
    pub coordinator_url: String,

    #[arg(long, env = "V6_API_KEY")]
    pub api_key: String,

    #[arg(long, env = "V6_PRIVATE_KEY_FILE")]
    pub private_key_file: PathBuf,

    #[arg(long, env = "V6_DATA_ROOT", default_value = "/var/lib/v6-node")]
    pub data_root: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub max_concurrent_tasks: usize,

    #[arg(long, default_value_t = 256)]
    pub task_queue_capacity: usize,

    #[arg(long, default_value_t = 30)]
    pub initializing_timeout_seconds: u64,

    /// Image glob allowlist; empty means "allow any image" (dev only).
    #[arg(long, value_delimiter = ',')]
    pub allowed_algorithms: Vec<String>,

    /// Dev-only override for a coordinator advertising itself as
    /// "localhost" from inside a container network. Left configurable per
    /// an explicit upstream open question rather than hardcoded.
    #[arg(long, env = "V6_HOST_URI_OVERRIDE")]
    pub host_uri_override: Option<String>,

    /// Upload completed results to the coordinator's `/blobstream` store
    /// rather than PATCHing ciphertext inline. Requires the coordinator to
    /// have its own blob store enabled.
    #[arg(long, env = "V6_USE_BLOB_STORAGE", default_value_t = false)]
    pub use_blob_storage: bool,
}

impl NodeConfig {
    pub fn image_is_allowed(&self, image: &str) -> bool {
        if self.allowed_algorithms.is_empty() {
            return true;
        }
        self.allowed_algorithms.iter().any(|pattern| glob_match(pattern, image))
    }
}

/// `*`-only glob matcher: sufficient for image allowlists like
/// `harbor.example.org/algorithms/*`.
fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, suffix)) => value.starts_with(prefix) && value.ends_with(suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_match() {
        assert!(glob_match("harbor.example.org/algo/*", "harbor.example.org/algo/avg:1"));
        assert!(!glob_match("harbor.example.org/algo/*", "other.registry/algo/avg:1"));
    }
}
