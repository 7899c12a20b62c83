//! Configuration for the reconciliation service

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ledger configuration
    pub ledger: deposit_ledger::Config,

    /// HTTP listen address
    pub http_listen_addr: String,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Balance oracle configuration
    pub oracle: OracleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: deposit_ledger::Config::default(),
            http_listen_addr: "0.0.0.0:8080".to_string(),
            log_json: false,
            oracle: OracleConfig::default(),
        }
    }
}

/// ERC-20 balance oracle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Primary JSON-RPC endpoint
    pub rpc_url: String,

    /// Endpoints tried in order when the primary fails
    pub fallback_urls: Vec<String>,

    /// Token contract queried with `balanceOf`
    pub token_address: String,

    /// Per-request timeout
    pub timeout_ms: u64,

    /// What to do when no endpoint answers
    pub failure_policy: FailurePolicy,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://eth.llamarpc.com".to_string(),
            fallback_urls: Vec::new(),
            token_address: "0x9d82c77578FE4114ba55fAbb43F6F4c4650ae85d".to_string(),
            timeout_ms: 8000,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

/// Reaction to an oracle failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Fail the reconciliation
    #[default]
    Abort,
    /// Reconcile against a zero target (legacy behaviour)
    ZeroTarget,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "zero-target" | "zero_target" => Ok(FailurePolicy::ZeroTarget),
            other => Err(Error::Config(format!("Unknown oracle failure policy: {}", other))),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.ledger.apply_env()?;

        if let Ok(addr) = std::env::var("RECONCILER_HTTP_ADDR") {
            self.http_listen_addr = addr;
        }
        if let Ok(json) = std::env::var("RECONCILER_LOG_JSON") {
            self.log_json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Ok(url) = std::env::var("ORACLE_RPC_URL") {
            self.oracle.rpc_url = url;
        }
        if let Ok(token) = std::env::var("ORACLE_TOKEN_ADDRESS") {
            self.oracle.token_address = token;
        }
        if let Ok(policy) = std::env::var("ORACLE_FAILURE_POLICY") {
            self.oracle.failure_policy = policy.parse()?;
        }

        self.validate()
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.http_listen_addr.parse().map_err(|e| {
            Error::Config(format!("Invalid listen address {:?}: {}", self.http_listen_addr, e))
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.listen_addr()?;

        if self.oracle.rpc_url.trim().is_empty() {
            return Err(Error::Config("oracle.rpc_url must not be empty".to_string()));
        }
        if !is_hex_address(&self.oracle.token_address) {
            return Err(Error::Config(format!(
                "oracle.token_address is not a 20-byte hex address: {}",
                self.oracle.token_address
            )));
        }
        if self.oracle.timeout_ms == 0 {
            return Err(Error::Config("oracle.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// `0x` followed by 40 hex digits
pub(crate) fn is_hex_address(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.oracle.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconciler.toml");
        std::fs::write(
            &path,
            r#"
http_listen_addr = "127.0.0.1:9090"

[ledger]
data_dir = "/tmp/ledger"

[ledger.reconciliation]
tolerance = "0.01"

[oracle]
rpc_url = "http://localhost:8545"
fallback_urls = ["http://localhost:8546"]
failure_policy = "zero-target"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.http_listen_addr, "127.0.0.1:9090");
        assert_eq!(config.ledger.reconciliation.tolerance, dec!(0.01));
        assert_eq!(config.oracle.fallback_urls.len(), 1);
        assert_eq!(config.oracle.failure_policy, FailurePolicy::ZeroTarget);
        assert_eq!(config.oracle.timeout_ms, 8000);
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("abort".parse::<FailurePolicy>().unwrap(), FailurePolicy::Abort);
        assert_eq!(
            "Zero-Target".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::ZeroTarget
        );
        assert!("ignore".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.oracle.token_address = "0x1234".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.http_listen_addr = "not an address".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_hex_address() {
        assert!(is_hex_address("0xdd7fc80cafb2f055fb6a519d4043c29ea76a7ce1"));
        assert!(!is_hex_address("dd7fc80cafb2f055fb6a519d4043c29ea76a7ce1"));
        assert!(!is_hex_address("0xzz7fc80cafb2f055fb6a519d4043c29ea76a7ce1"));
    }
}
