//! Venue endpoint types and websocket URLs
//!
//! The venue splits its websocket surface into four channels: public market
//! data (partial and full feed) and private trade data (partial and full feed).
//! Private channels only open once a session credential exists.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Logical websocket channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Public market data, partial feed
    MarketData,
    /// Public market data, full feed
    MarketDataRpcFull,
    /// Private trade/account data, partial feed
    TradeData,
    /// Private trade/account data, full feed
    TradeDataRpcFull,
}

impl EndpointType {
    /// Every endpoint, in connect order
    pub const ALL: [EndpointType; 4] = [
        EndpointType::MarketData,
        EndpointType::MarketDataRpcFull,
        EndpointType::TradeData,
        EndpointType::TradeDataRpcFull,
    ];

    /// Whether a session credential must exist before the transport may open
    #[inline]
    pub fn requires_credential(&self) -> bool {
        matches!(self, EndpointType::TradeData | EndpointType::TradeDataRpcFull)
    }

    /// Position in `ALL`
    #[inline]
    pub const fn index(&self) -> usize {
        match self {
            EndpointType::MarketData => 0,
            EndpointType::MarketDataRpcFull => 1,
            EndpointType::TradeData => 2,
            EndpointType::TradeDataRpcFull => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::MarketData => "market_data",
            EndpointType::MarketDataRpcFull => "market_data_rpc_full",
            EndpointType::TradeData => "trade_data",
            EndpointType::TradeDataRpcFull => "trade_data_rpc_full",
        }
    }

    /// Path of the feed below the host
    fn path(&self) -> &'static str {
        match self {
            EndpointType::MarketData | EndpointType::TradeData => "/ws",
            EndpointType::MarketDataRpcFull | EndpointType::TradeDataRpcFull => "/ws/full",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrvtEnv {
    Prod,
    #[default]
    Testnet,
    Staging,
    Dev,
}

impl GrvtEnv {
    fn market_data_host(&self) -> &'static str {
        match self {
            GrvtEnv::Prod => "wss://market-data.grvt.io",
            GrvtEnv::Testnet => "wss://market-data.testnet.grvt.io",
            GrvtEnv::Staging => "wss://market-data.staging.gravitymarkets.io",
            GrvtEnv::Dev => "wss://market-data.dev.gravitymarkets.io",
        }
    }

    fn trades_host(&self) -> &'static str {
        match self {
            GrvtEnv::Prod => "wss://trades.grvt.io",
            GrvtEnv::Testnet => "wss://trades.testnet.grvt.io",
            GrvtEnv::Staging => "wss://trades.staging.gravitymarkets.io",
            GrvtEnv::Dev => "wss://trades.dev.gravitymarkets.io",
        }
    }

    /// Default websocket URL for an endpoint in this environment
    pub fn ws_url(&self, endpoint: EndpointType) -> String {
        let host = if endpoint.requires_credential() {
            self.trades_host()
        } else {
            self.market_data_host()
        };
        format!("{}{}", host, endpoint.path())
    }
}

/// Errors building the URL table
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid url for {endpoint}: {source}")]
    InvalidUrl {
        endpoint: EndpointType,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme for {endpoint}: {scheme} (expected ws or wss)")]
    UnsupportedScheme { endpoint: EndpointType, scheme: String },
    #[error("no url configured for {0}")]
    Missing(EndpointType),
}

/// Validated per-endpoint URL table
#[derive(Debug, Clone)]
pub struct EndpointUrls {
    urls: HashMap<EndpointType, Url>,
}

impl EndpointUrls {
    /// Build the table for an environment
    pub fn for_env(env: GrvtEnv) -> Result<Self, EndpointError> {
        Self::with_overrides(env, &HashMap::new())
    }

    /// Build the table for an environment, replacing individual endpoints
    pub fn with_overrides(
        env: GrvtEnv,
        overrides: &HashMap<EndpointType, String>,
    ) -> Result<Self, EndpointError> {
        let mut urls = HashMap::with_capacity(EndpointType::ALL.len());
        for endpoint in EndpointType::ALL {
            let raw = overrides
                .get(&endpoint)
                .cloned()
                .unwrap_or_else(|| env.ws_url(endpoint));
            urls.insert(endpoint, parse_ws_url(endpoint, &raw)?);
        }
        Ok(Self { urls })
    }

    /// URL for an endpoint
    pub fn get(&self, endpoint: EndpointType) -> Result<&Url, EndpointError> {
        self.urls.get(&endpoint).ok_or(EndpointError::Missing(endpoint))
    }
}

fn parse_ws_url(endpoint: EndpointType, raw: &str) -> Result<Url, EndpointError> {
    let url = Url::parse(raw).map_err(|source| EndpointError::InvalidUrl { endpoint, source })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(EndpointError::UnsupportedScheme {
            endpoint,
            scheme: other.to_string(),
        }),
    }
}
