//! Balance oracles
//!
//! The reconciliation target is the owner's token balance as reported by an
//! external source. [`Erc20BalanceOracle`] reads it from an Ethereum JSON-RPC
//! endpoint with `eth_call` (`balanceOf(address)` and `decimals()`), trying
//! fallback endpoints with exponential backoff.

use crate::{config::OracleConfig, Error, Result};
use async_trait::async_trait;
use deposit_ledger::OwnerKey;
use reqwest::Client;
use rust_decimal::Decimal;
use tokio::sync::OnceCell;

/// `balanceOf(address)` selector
const BALANCE_OF_SELECTOR: &str = "70a08231";

/// `decimals()` selector
const DECIMALS_SELECTOR: &str = "313ce567";

/// Largest scale a `Decimal` can carry
const MAX_DECIMALS: u32 = 28;

/// Source of the authoritative balance an owner's rows are reconciled to
#[async_trait]
pub trait BalanceOracle: Send + Sync {
    /// Current balance of `owner`, never negative
    async fn target_balance(&self, owner: &OwnerKey) -> Result<Decimal>;
}

/// Oracle returning the same balance for every owner
#[derive(Debug, Clone, Copy)]
pub struct FixedBalanceOracle {
    balance: Decimal,
}

impl FixedBalanceOracle {
    /// Create oracle answering `balance`
    pub fn new(balance: Decimal) -> Self {
        Self { balance }
    }
}

#[async_trait]
impl BalanceOracle for FixedBalanceOracle {
    async fn target_balance(&self, _owner: &OwnerKey) -> Result<Decimal> {
        Ok(self.balance)
    }
}

/// ERC-20 `balanceOf` over JSON-RPC
#[derive(Debug)]
pub struct Erc20BalanceOracle {
    primary_url: String,
    fallback_urls: Vec<String>,
    token_address: String,
    http: Client,
    decimals: OnceCell<u32>,
}

impl Erc20BalanceOracle {
    /// Create oracle from configuration
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            primary_url: config.rpc_url.clone(),
            fallback_urls: config.fallback_urls.clone(),
            token_address: config.token_address.to_ascii_lowercase(),
            http,
            decimals: OnceCell::new(),
        })
    }

    /// Call an RPC method with failover and exponential backoff
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let urls = std::iter::once(&self.primary_url).chain(self.fallback_urls.iter());
        let max_attempts = 1 + self.fallback_urls.len();
        let mut backoff_ms = 100u64;
        let mut last_error = String::from("no endpoint configured");

        for (attempt, url) in urls.enumerate() {
            if attempt > 0 {
                tracing::debug!(backoff_ms, "Backing off before next RPC endpoint");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(10_000);
            }

            let response = match self.http.post(url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts,
                        "RPC request failed"
                    );
                    last_error = e.to_string();
                    continue;
                }
            };

            if !response.status().is_success() {
                tracing::warn!(
                    url = %url,
                    status = %response.status(),
                    attempt = attempt + 1,
                    max_attempts,
                    "RPC endpoint returned error status"
                );
                last_error = format!("HTTP {}", response.status());
                continue;
            }

            let json: serde_json::Value = response.json().await?;
            if let Some(err) = json.get("error").filter(|err| !err.is_null()) {
                return Err(Error::Oracle(format!("RPC error: {}", err)));
            }

            if attempt > 0 {
                tracing::info!(url = %url, attempt = attempt + 1, "RPC request succeeded on fallback");
            }
            return Ok(json["result"].clone());
        }

        Err(Error::Oracle(format!(
            "All RPC endpoints failed after {} attempts: {}",
            max_attempts, last_error
        )))
    }

    /// `eth_call` against the token contract, returning the raw word
    async fn eth_call(&self, data: String) -> Result<u128> {
        let params = serde_json::json!([{ "to": self.token_address, "data": data }, "latest"]);
        let result = self.call("eth_call", params).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| Error::Oracle(format!("eth_call returned non-string result: {}", result)))?;
        parse_uint256(hex)
    }

    /// Token decimals, fetched once
    async fn decimals(&self) -> Result<u32> {
        self.decimals
            .get_or_try_init(|| async {
                let raw = self.eth_call(format!("0x{}", DECIMALS_SELECTOR)).await?;
                u32::try_from(raw)
                    .ok()
                    .filter(|decimals| *decimals <= MAX_DECIMALS)
                    .ok_or_else(|| Error::Oracle(format!("unsupported token decimals: {}", raw)))
            })
            .await
            .copied()
    }
}

#[async_trait]
impl BalanceOracle for Erc20BalanceOracle {
    async fn target_balance(&self, owner: &OwnerKey) -> Result<Decimal> {
        let data = balance_of_call_data(owner)?;
        let raw = self.eth_call(data).await?;
        let decimals = self.decimals().await?;
        let balance = scale_balance(raw, decimals)?;

        tracing::debug!(owner = %owner, %balance, decimals, "Fetched token balance");
        Ok(balance)
    }
}

/// ABI-encoded `balanceOf(owner)`
fn balance_of_call_data(owner: &OwnerKey) -> Result<String> {
    let address = owner.as_str();
    if !crate::config::is_hex_address(address) {
        return Err(Error::Oracle(format!("owner is not a hex address: {}", owner)));
    }
    Ok(format!("0x{}{:0>64}", BALANCE_OF_SELECTOR, &address[2..]))
}

/// Parse a hex `uint256` that must fit into 128 bits
fn parse_uint256(hex: &str) -> Result<u128> {
    let digits = hex
        .strip_prefix("0x")
        .ok_or_else(|| Error::Oracle(format!("not a hex quantity: {}", hex)))?;
    if digits.is_empty() {
        return Err(Error::Oracle("empty eth_call result (no contract at address?)".to_string()));
    }

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(0);
    }
    if significant.len() > 32 {
        return Err(Error::Oracle(format!("uint256 does not fit into 128 bits: {}", hex)));
    }
    u128::from_str_radix(significant, 16)
        .map_err(|e| Error::Oracle(format!("invalid hex quantity {}: {}", hex, e)))
}

/// Raw token units scaled down by `decimals`
fn scale_balance(raw: u128, decimals: u32) -> Result<Decimal> {
    i128::try_from(raw)
        .ok()
        .and_then(|raw| Decimal::try_from_i128_with_scale(raw, decimals).ok())
        .map(|balance| balance.normalize())
        .ok_or_else(|| Error::Oracle(format!("balance {} out of decimal range", raw)))
}
