//! Vertex Protocol perps integration.
//!
//! Engine gateway (queries + signed executes) and the archive indexer
//! (prices, match history, rewards), both JSON over HTTPS.
//!
//! Engine:  https://gateway.prod.vertexprotocol.com/v1  (`/query`, `/execute`)
//! Indexer: https://archive.prod.vertexprotocol.com/v1
//!
//! All prices and amounts on the wire are X18 fixed-point integers encoded
//! as strings. Orders are EIP-712 signed with the account's key; the
//! verifying contract for an order is `address(product_id)`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use rand::Rng;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::ExchangeGateway;
use crate::types::{Fill, Instrument, OrderIntent, OrderResult, ProductId, RewardCoefficient, Side};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_ENGINE_URL: &str = "https://gateway.prod.vertexprotocol.com/v1";
pub const DEFAULT_INDEXER_URL: &str = "https://archive.prod.vertexprotocol.com/v1";
/// Arbitrum One.
pub const DEFAULT_CHAIN_ID: u64 = 42161;

const GATEWAY_NAME: &str = "vertex";
const X18: Decimal = dec!(1000000000000000000);
const QUANTITY_DECIMALS: u32 = 18;

const ORDER_TYPE: &str =
    "Order(bytes32 sender,int128 priceX18,int128 amount,uint64 expiration,uint64 nonce)";
const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const DOMAIN_NAME: &str = "Vertex";
const DOMAIN_VERSION: &str = "0.0.1";

/// Orders are accepted until `recv_time`, encoded in the nonce's high bits.
const NONCE_RECV_WINDOW_MS: i64 = 90_000;

#[derive(Debug, Clone)]
pub struct VertexConfig {
    pub engine_url: String,
    pub indexer_url: String,
    pub chain_id: u64,
    pub subaccount_name: String,
    pub request_timeout: Duration,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            indexer_url: DEFAULT_INDEXER_URL.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            subaccount_name: "default".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// API response types (Vertex JSON → Rust)
// ---------------------------------------------------------------------------

/// `{ "status": "success", "data": ... }` wrapper used by engine queries.
#[derive(Debug, Deserialize)]
struct EngineEnvelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubaccountInfo {
    /// `[initial, maintenance, unweighted]`.
    healths: Vec<HealthEntry>,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    health: String,
}

#[derive(Debug, Deserialize)]
struct MaxOrderSize {
    max_order_size: String,
}

#[derive(Debug, Deserialize)]
struct AllProducts {
    #[serde(default)]
    perp_products: Vec<PerpProduct>,
}

#[derive(Debug, Deserialize)]
struct PerpProduct {
    product_id: ProductId,
    book_info: BookInfo,
}

#[derive(Debug, Deserialize)]
struct BookInfo {
    size_increment: String,
    min_size: String,
}

#[derive(Debug, Deserialize)]
struct PerpPrices {
    index_price_x18: String,
}

#[derive(Debug, Deserialize)]
struct MatchesResponse {
    #[serde(default)]
    matches: Vec<MatchEvent>,
}

#[derive(Debug, Deserialize)]
struct MatchEvent {
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    submission_idx: Option<String>,
    #[serde(default)]
    post_balance: Value,
}

#[derive(Debug, Deserialize)]
struct RewardsResponse {
    #[serde(default, alias = "epochs")]
    rewards: Vec<RewardEpoch>,
}

#[derive(Debug, Deserialize)]
struct RewardEpoch {
    #[serde(default)]
    global_rewards: Vec<GlobalReward>,
}

#[derive(Debug, Deserialize)]
struct GlobalReward {
    product_id: ProductId,
    reward_coefficient: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Vertex gateway client bound to one subaccount.
pub struct VertexClient {
    http: Client,
    config: VertexConfig,
    wallet: LocalWallet,
    subaccount: [u8; 32],
}

impl VertexClient {
    /// Create a client signing with `private_key` (hex, optional `0x`).
    pub fn new(private_key: &SecretString, config: VertexConfig) -> Result<Self> {
        let wallet = private_key
            .expose_secret()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| anyhow!("Invalid private key: {e}"))?
            .with_chain_id(config.chain_id);

        let subaccount = subaccount_bytes(wallet.address(), &config.subaccount_name)?;

        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent("CYCLER/0.1.0 (perp-position-cycler)")
            .build()
            .context("Failed to build HTTP client for Vertex")?;

        info!(
            address = ?wallet.address(),
            subaccount = %config.subaccount_name,
            chain_id = config.chain_id,
            "Vertex client initialised"
        );

        Ok(Self {
            http,
            config,
            wallet,
            subaccount,
        })
    }

    pub fn subaccount_hex(&self) -> String {
        format!("0x{}", hex::encode(self.subaccount))
    }

    fn address_hex(&self) -> String {
        format!("{:?}", self.wallet.address())
    }

    // -- Internal helpers ------------------------------------------------

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        debug!(url, body = %body, "Vertex request");

        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Vertex request to {url} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Vertex API error {status}: {text}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse Vertex response from {url}"))
    }

    /// Engine query; unwraps the `status`/`data` envelope.
    async fn query<T: DeserializeOwned>(&self, body: Value) -> Result<T> {
        let url = format!("{}/query", self.config.engine_url);
        let raw = self.post_json(&url, &body).await?;
        let envelope: EngineEnvelope<T> =
            serde_json::from_value(raw).context("Unexpected Vertex query response shape")?;

        if envelope.status != "success" {
            anyhow::bail!(
                "Vertex query failed: {}",
                envelope.error.unwrap_or_else(|| envelope.status.clone())
            );
        }
        envelope.data.context("Vertex query returned no data")
    }

    async fn indexer<T: DeserializeOwned>(&self, body: Value) -> Result<T> {
        let raw = self.post_json(&self.config.indexer_url, &body).await?;
        serde_json::from_value(raw).context("Unexpected Vertex indexer response shape")
    }

    /// EIP-712 digest of an order for `product_id`.
    fn order_digest(&self, intent: &OrderIntent) -> Result<[u8; 32]> {
        let price_x18 = to_x18_int(intent.limit_price)?;
        let amount = raw_int(intent.amount)?;
        let expiration = u64::try_from(intent.expiration.timestamp())
            .context("Order expiration before epoch")?;

        let struct_hash = keccak256(encode(&[
            Token::FixedBytes(keccak256(ORDER_TYPE).to_vec()),
            Token::FixedBytes(self.subaccount.to_vec()),
            int128_token(price_x18),
            int128_token(amount),
            Token::Uint(U256::from(expiration)),
            Token::Uint(U256::from(intent.nonce)),
        ]));

        let domain_separator = keccak256(encode(&[
            Token::FixedBytes(keccak256(DOMAIN_TYPE).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
            Token::Uint(U256::from(self.config.chain_id)),
            Token::Address(order_verifying_contract(intent.product_id)),
        ]));

        let mut encoded = Vec::with_capacity(66);
        encoded.extend_from_slice(b"\x19\x01");
        encoded.extend_from_slice(&domain_separator);
        encoded.extend_from_slice(&struct_hash);
        Ok(keccak256(&encoded))
    }

    /// Build the signed `place_order` payload.
    fn signed_place_order(&self, intent: &OrderIntent) -> Result<Value> {
        let digest = self.order_digest(intent)?;
        let signature = self
            .wallet
            .sign_hash(H256::from(digest))
            .map_err(|e| anyhow!("Failed to sign order: {e}"))?;

        Ok(json!({
            "place_order": {
                "product_id": intent.product_id,
                "order": {
                    "sender": self.subaccount_hex(),
                    "priceX18": to_x18_int(intent.limit_price)?.to_string(),
                    "amount": raw_int(intent.amount)?.to_string(),
                    "expiration": intent.expiration.timestamp().to_string(),
                    "nonce": intent.nonce.to_string(),
                },
                "signature": format!("0x{}", hex::encode(signature.to_vec())),
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// 20-byte owner address followed by the subaccount name padded to 12 bytes.
fn subaccount_bytes(owner: Address, name: &str) -> Result<[u8; 32]> {
    let name = name.as_bytes();
    if name.len() > 12 {
        anyhow::bail!("Subaccount name longer than 12 bytes");
    }
    let mut out = [0u8; 32];
    out[..20].copy_from_slice(owner.as_bytes());
    out[20..20 + name.len()].copy_from_slice(name);
    Ok(out)
}

fn order_verifying_contract(product_id: ProductId) -> Address {
    Address::from_low_u64_be(u64::from(product_id))
}

/// Two's-complement ABI word for an int128.
fn int128_token(value: i128) -> Token {
    let word = if value >= 0 {
        U256::from(value as u128)
    } else {
        (!U256::from(value.unsigned_abs())).overflowing_add(U256::one()).0
    };
    Token::Int(word)
}

fn from_x18(raw: &str) -> Result<Decimal> {
    let value = Decimal::from_str(raw).with_context(|| format!("Invalid X18 value: {raw}"))?;
    Ok(value / X18)
}

fn to_x18_int(value: Decimal) -> Result<i128> {
    value
        .checked_mul(X18)
        .context("X18 overflow")?
        .trunc()
        .to_i128()
        .context("X18 value does not fit int128")
}

/// Integral raw amount (drops any fractional dust).
fn raw_int(value: Decimal) -> Result<i128> {
    value.trunc().to_i128().context("Raw amount does not fit int128")
}

fn parse_raw(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid raw amount: {raw}"))
}

/// Base-asset balance (raw) carried by a match event's `post_balance`.
fn post_base_amount(post_balance: &Value) -> Option<Decimal> {
    let base = post_balance.get("base")?;
    let amount = base
        .pointer("/perp/balance/amount")
        .or_else(|| base.pointer("/spot/balance/amount"))
        .or_else(|| base.get("amount"))?;
    match amount {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Match events, newest first, as fills. An event whose base post-balance
/// cannot be read fails the whole batch: skipping it would make an older
/// fill look like the latest one.
fn fills_from_matches(matches: Vec<MatchEvent>) -> Result<Vec<Fill>> {
    matches
        .into_iter()
        .map(|m| {
            let post_base_balance = post_base_amount(&m.post_balance).with_context(|| {
                format!("Match event {:?} has no readable base post-balance", m.digest)
            })?;
            Ok(Fill {
                post_base_balance,
                digest: m.digest,
                submission_idx: m.submission_idx.and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

/// Display digits implied by a power-of-ten size increment.
fn digits_for_increment(size_increment: Decimal, decimals: u32) -> u32 {
    let mut digits = decimals;
    let mut step = Decimal::ONE;
    while digits > 0 && step * Decimal::TEN <= size_increment {
        step *= Decimal::TEN;
        digits -= 1;
    }
    digits
}

fn product_name(product_id: ProductId) -> String {
    match product_id {
        2 => "BTC-PERP".to_string(),
        4 => "ETH-PERP".to_string(),
        id => format!("PERP-{id}"),
    }
}

// ---------------------------------------------------------------------------
// ExchangeGateway trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeGateway for VertexClient {
    /// Initial health of the subaccount, in quote units.
    async fn account_health(&self) -> Result<Decimal> {
        let info: SubaccountInfo = self
            .query(json!({ "type": "subaccount_info", "subaccount": self.subaccount_hex() }))
            .await?;
        let initial = info
            .healths
            .first()
            .context("subaccount_info returned no health entries")?;
        from_x18(&initial.health)
    }

    /// Index price from the indexer.
    async fn mark_price(&self, product_id: ProductId) -> Result<Decimal> {
        let prices: PerpPrices = self
            .indexer(json!({ "perp_prices": { "product_id": product_id } }))
            .await?;
        from_x18(&prices.index_price_x18)
    }

    async fn max_order_size(&self, product_id: ProductId, side: Side, price: Decimal) -> Result<Decimal> {
        let resp: MaxOrderSize = self
            .query(json!({
                "type": "max_order_size",
                "sender": self.subaccount_hex(),
                "product_id": product_id,
                "price_x18": to_x18_int(price)?.to_string(),
                "direction": side.as_str(),
            }))
            .await?;
        parse_raw(&resp.max_order_size)
    }

    async fn instrument(&self, product_id: ProductId) -> Result<Instrument> {
        self.list_instruments()
            .await?
            .into_iter()
            .find(|i| i.product_id == product_id)
            .with_context(|| format!("Vertex has no perp product {product_id}"))
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let products: AllProducts = self.query(json!({ "type": "all_products" })).await?;

        let mut instruments = Vec::with_capacity(products.perp_products.len());
        for p in products.perp_products {
            let size_increment = parse_raw(&p.book_info.size_increment)?;
            instruments.push(Instrument {
                product_id: p.product_id,
                name: product_name(p.product_id),
                decimals: QUANTITY_DECIMALS,
                digits: digits_for_increment(size_increment, QUANTITY_DECIMALS),
                min_size: parse_raw(&p.book_info.min_size)?,
                size_increment,
            });
        }

        debug!(count = instruments.len(), "Vertex perp products loaded");
        Ok(instruments)
    }

    /// Global reward coefficients for the latest epoch.
    async fn reward_coefficients(&self) -> Result<Vec<RewardCoefficient>> {
        let resp: RewardsResponse = self
            .indexer(json!({ "rewards": { "address": self.address_hex(), "limit": 1 } }))
            .await?;
        let epoch = resp
            .rewards
            .into_iter()
            .next()
            .context("Vertex rewards returned no epochs")?;

        epoch
            .global_rewards
            .into_iter()
            .map(|r| {
                Ok(RewardCoefficient {
                    product_id: r.product_id,
                    coefficient: from_x18(&r.reward_coefficient)?,
                })
            })
            .collect()
    }

    async fn recent_fills(&self, product_id: ProductId, limit: usize) -> Result<Vec<Fill>> {
        let resp: MatchesResponse = self
            .indexer(json!({
                "matches": {
                    "subaccount": self.subaccount_hex(),
                    "product_ids": [product_id],
                    "limit": limit,
                }
            }))
            .await?;

        fills_from_matches(resp.matches)
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let payload = self.signed_place_order(intent)?;
        let url = format!("{}/execute", self.config.engine_url);
        let raw = self.post_json(&url, &payload).await?;

        let status = raw.get("status").and_then(Value::as_str).unwrap_or("unknown");
        if status == "success" {
            Ok(OrderResult::success(raw))
        } else {
            let message = raw
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or(status)
                .to_string();
            Ok(OrderResult::rejected(message, raw))
        }
    }

    /// `(recv_time_ms << 20) + random`, recv time 90s ahead of now.
    fn order_nonce(&self) -> u64 {
        let recv_time = (Utc::now().timestamp_millis() + NONCE_RECV_WINDOW_MS) as u64;
        let jitter: u64 = rand::thread_rng().gen_range(0..1000);
        (recv_time << 20) + jitter
    }

    fn name(&self) -> &'static str {
        GATEWAY_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
