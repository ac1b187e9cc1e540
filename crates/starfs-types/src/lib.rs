//! Shared types for StarFS
//!
//! This crate contains the wire messages, ledger values and node settings
//! shared by the core library, the node and the CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ledger balances are unsigned and never go below zero
pub type Amount = u128;

/// Client-issued handle correlating a metadata request with its response
pub type RequestId = u64;

/// Age after which a proof-of-work token is no longer accepted
pub const FRESHNESS_WINDOW_MS: i64 = 5_000;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DIFFICULTY: u64 = 1_000;
pub const DEFAULT_STEP: u64 = 8;

// ============================================================================
// Identity Types
// ============================================================================

/// Opaque identifier of a ledger account or peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-request discriminator chosen by the requester.
///
/// A seed prevents a token from being redeemed twice in one epoch and
/// correlates a chunk response with the window that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(pub u64);

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Proof of Work
// ============================================================================

/// Proof that `difficulty` hash attempts (on average) were spent for `address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowToken {
    /// Expected number of hash attempts needed to meet the target
    pub difficulty: u64,
    pub address: Address,
    pub seed: Seed,
    pub nonce: u64,
    /// Mint time in milliseconds since the unix epoch
    pub time: i64,
}

// ============================================================================
// Client Protocol
// ============================================================================

/// Requests sent by a downloading client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Request {
    File(FileRequest),
    Download(DownloadRequest),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::File(_) => "file",
            Request::Download(_) => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    pub id: RequestId,
    pub hash: String,
}

/// A chunk request. The window `[start, end]` is inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub hash: String,
    pub start: u64,
    pub end: u64,
    pub seed: Seed,
    pub nonce: u64,
    pub time: i64,
}

impl DownloadRequest {
    /// Number of characters covered by the window
    pub fn width(&self) -> u64 {
        window_width(self.start, self.end)
    }
}

/// Width of the inclusive window `[start, end]`
pub fn window_width(start: u64, end: u64) -> u64 {
    end.saturating_sub(start).saturating_add(1)
}

/// Responses sent by a serving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Response {
    File(FileInfo),
    Download(Chunk),
}

/// File metadata: everything a client needs to price its chunk requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: RequestId,
    /// Work required per character requested
    pub difficulty: u64,
    /// Ledger identity of the serving node
    pub address: Address,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub seed: Seed,
    pub content: String,
}

/// A server frame: either a response or an error in its place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Data { data: Response },
    Error { error: String },
}

impl Reply {
    pub fn data(response: Response) -> Self {
        Reply::Data { data: response }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            error: message.into(),
        }
    }
}

// ============================================================================
// Ledger Types
// ============================================================================

/// Address-ordered copy of every balance in a ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerSnapshot(#[serde(with = "hex_amount_map")] pub BTreeMap<Address, Amount>);

impl LedgerSnapshot {
    pub fn balance(&self, address: &Address) -> Option<Amount> {
        self.0.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_supply(&self) -> Amount {
        self.0.values().fold(0, |acc, v| acc.saturating_add(*v))
    }
}

impl FromIterator<(Address, Amount)> for LedgerSnapshot {
    fn from_iter<I: IntoIterator<Item = (Address, Amount)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A ledger mutation as replicated between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "lowercase")]
pub enum LedgerCall {
    Redeem(PowToken),
    Mint {
        to: Address,
        #[serde(with = "hex_amount")]
        amount: Amount,
    },
    Burn {
        to: Address,
        #[serde(with = "hex_amount")]
        amount: Amount,
    },
}

impl LedgerCall {
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::Redeem(_) => "redeem",
            LedgerCall::Mint { .. } => "mint",
            LedgerCall::Burn { .. } => "burn",
        }
    }

    /// Replay key for mempool dedupe
    pub fn seed(&self) -> Option<Seed> {
        match self {
            LedgerCall::Redeem(token) => Some(token.seed),
            _ => None,
        }
    }
}

/// Frames exchanged on a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum PeerMessage {
    Hello { address: Address },
    State { snapshot: LedgerSnapshot },
    Call { call: LedgerCall },
}

/// Amounts travel as `0x`-prefixed hex strings
pub mod hex_amount {
    use super::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", amount))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<Amount, String> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("Amount must start with 0x: {}", s))?;
        Amount::from_str_radix(digits, 16).map_err(|e| format!("Invalid amount {}: {}", s, e))
    }
}

mod hex_amount_map {
    use super::{Address, Amount};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<Address, Amount>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (address, amount) in map {
            out.serialize_entry(address, &format!("0x{:x}", amount))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<Address, Amount>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<Address, String> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(address, amount)| {
                super::hex_amount::parse(&amount)
                    .map(|amount| (address, amount))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Node settings. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's ledger identity; chunk redemptions credit it
    pub address: Address,
    pub port: u16,
    /// Work required per character served
    pub difficulty: u64,
    /// Chunk width used by clients
    pub step: u64,
    pub epoch_interval_ms: u64,
    pub freshness_ms: i64,
    /// Upper bound on waiting for peer snapshots after a new connection
    pub convergence_timeout_ms: u64,
    /// Nominal annual yield paid to well-behaved peers
    pub nominal_yield: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: Address::from("0x0000000000000000000000000000000000000000"),
            port: DEFAULT_PORT,
            difficulty: DEFAULT_DIFFICULTY,
            step: DEFAULT_STEP,
            epoch_interval_ms: 60_000,
            freshness_ms: FRESHNESS_WINDOW_MS,
            convergence_timeout_ms: 10_000,
            nominal_yield: 0.05,
        }
    }
}

/// Body of the node's `GET /status` endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: Address,
    pub difficulty: u64,
    pub step: u64,
    pub files: usize,
    pub peers: usize,
    #[serde(with = "hex_amount")]
    pub balance: Amount,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum LedgerEvent {
    Minted {
        to: Address,
        amount: Amount,
    },
    Burned {
        to: Address,
        amount: Amount,
    },
    Redeemed {
        address: Address,
        amount: Amount,
        seed: Seed,
    },
    PeerDropped {
        peer: Address,
    },
    EpochSettled {
        rewarded: usize,
        slashed: usize,
        net_reputation: i64,
        block_yield: f64,
    },
    Desync {
        net_reputation: i64,
    },
    StateAdopted {
        accounts: usize,
    },
}
