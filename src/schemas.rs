use crate::consts::{MEMPOOL_HEIGHT, OUTPOINT_KEY_LEN, SCORE_HEIGHT_FACTOR, UTXO_HEADER_LEN};
use crate::utils::hash_to_hex;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TxHash = [u8; 32];

/// `txid(32) ‖ index(u32 LE)`; identifies one output everywhere in the system.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutpointKey([u8; OUTPOINT_KEY_LEN]);

impl OutpointKey {
    pub fn new(hash: &TxHash, index: u32) -> Self {
        let mut key = [0u8; OUTPOINT_KEY_LEN];
        key[..32].copy_from_slice(hash);
        key[32..].copy_from_slice(&index.to_le_bytes());
        Self(key)
    }

    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let arr: [u8; OUTPOINT_KEY_LEN] = raw.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn txid(&self) -> TxHash {
        let mut h = [0u8; 32];
        h.copy_from_slice(&self.0[..32]);
        h
    }

    pub fn index(&self) -> u32 {
        u32::from_le_bytes([self.0[32], self.0[33], self.0[34], self.0[35]])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OutpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash_to_hex(&self.txid()), self.index())
    }
}

impl fmt::Debug for OutpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutpointKey({self})")
    }
}

/// Locking-script families the classifiers know about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2pk,
    Multisig,
    NullData,
    SensibleFt,
    SensibleUnique,
    SensibleNft,
    #[default]
    Unknown,
}

impl ScriptType {
    pub fn tag(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2pk => "p2pk",
            ScriptType::Multisig => "multisig",
            ScriptType::NullData => "nulldata",
            ScriptType::SensibleFt => "sensible_ft",
            ScriptType::SensibleUnique => "sensible_unique",
            ScriptType::SensibleNft => "sensible_nft",
            ScriptType::Unknown => "unknown",
        }
    }

    /// Data carriers can never be spent and never become UTXOs.
    pub fn is_unspendable(&self) -> bool {
        matches!(self, ScriptType::NullData)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Fungible,
    NonFungible,
    Unique,
}

/// Token metadata pulled out of a matching locking script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenInfo {
    pub kind: Option<TokenKind>,
    pub code_hash: Vec<u8>,
    pub genesis_id: Vec<u8>,
    /// FT amount, or NFT token index.
    pub data_value: u64,
    pub decimals: u64,
    pub name: String,
    pub symbol: String,
}

/// Result of running a locking script through the classifier chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub script_type: ScriptType,
    pub address_pkh: Vec<u8>,
    pub token: Option<TokenInfo>,
}

#[derive(Clone, Debug)]
pub struct TxIn {
    pub prev_hash: TxHash,
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// The outpoint this input consumes.
    pub spent_key: OutpointKey,
    /// This transaction's hash plus this input's own index.
    pub input_point: OutpointKey,
}

#[derive(Clone, Debug)]
pub struct TxOut {
    pub satoshi: u64,
    pub script: Vec<u8>,
    pub outpoint: OutpointKey,
    pub class: Classification,
    pub unspendable: bool,
}

impl TxOut {
    pub fn token(&self) -> Option<&TokenInfo> {
        self.class.token.as_ref()
    }
}

#[derive(Clone, Debug)]
pub struct Tx {
    pub raw: Vec<u8>,
    pub hash: TxHash,
    pub hash_hex: String,
    pub size: u32,
    pub version: u32,
    pub locktime: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Filled by the serial stage once every input is resolved.
    pub inputs_value: u64,
    /// Filled while output rows are built.
    pub outputs_value: u64,
}

/// Projection of one unspent output, as held in the delta maps and the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoRecord {
    pub height: u32,
    pub position: u64,
    pub satoshi: u64,
    pub script: Vec<u8>,
    pub script_type: ScriptType,
    pub address_pkh: Vec<u8>,
    pub token_kind: Option<TokenKind>,
    pub code_hash: Vec<u8>,
    pub genesis_id: Vec<u8>,
    pub data_value: u64,
    pub decimals: u64,
    pub name: String,
    pub symbol: String,
}

impl UtxoRecord {
    /// Zero-value record substituted for an outpoint nothing could resolve.
    pub fn placeholder() -> Self {
        Self::default()
    }

    /// Clears every field but keeps the script buffer's allocation.
    pub fn reset(&mut self) {
        self.height = 0;
        self.position = 0;
        self.satoshi = 0;
        self.script.clear();
        self.script_type = ScriptType::Unknown;
        self.address_pkh.clear();
        self.token_kind = None;
        self.code_hash.clear();
        self.genesis_id.clear();
        self.data_value = 0;
        self.decimals = 0;
        self.name.clear();
        self.symbol.clear();
    }

    /// Fill from a freshly decoded output at `position` in the mempool projection.
    pub fn fill_from_output(&mut self, out: &TxOut, position: u64) {
        self.height = MEMPOOL_HEIGHT;
        self.position = position;
        self.satoshi = out.satoshi;
        self.script.clear();
        self.script.extend_from_slice(&out.script);
        self.apply_classification(&out.class);
    }

    pub fn apply_classification(&mut self, class: &Classification) {
        self.script_type = class.script_type;
        self.address_pkh.clear();
        self.address_pkh.extend_from_slice(&class.address_pkh);
        match &class.token {
            Some(t) => {
                self.token_kind = t.kind;
                self.code_hash.clone_from(&t.code_hash);
                self.genesis_id.clone_from(&t.genesis_id);
                self.data_value = t.data_value;
                self.decimals = t.decimals;
                self.name.clone_from(&t.name);
                self.symbol.clone_from(&t.symbol);
            }
            None => {
                self.token_kind = None;
                self.code_hash.clear();
                self.genesis_id.clear();
                self.data_value = 0;
                self.decimals = 0;
                self.name.clear();
                self.symbol.clear();
            }
        }
    }

    pub fn is_nft(&self) -> bool {
        self.token_kind == Some(TokenKind::NonFungible)
    }

    /// Carries usable token classification (20-byte code hash, >=20-byte genesis).
    pub fn has_token(&self) -> bool {
        self.code_hash.len() == 20 && self.genesis_id.len() >= 20
    }

    pub fn has_address(&self) -> bool {
        self.address_pkh.len() == 20
    }

    /// `code_hash ‖ genesis_id`
    pub fn token_id(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.code_hash.len() + self.genesis_id.len());
        v.extend_from_slice(&self.code_hash);
        v.extend_from_slice(&self.genesis_id);
        v
    }

    /// Sort key of a record in height/position ordered sets.
    pub fn score(&self) -> u64 {
        (self.height as u64)
            .wrapping_mul(SCORE_HEIGHT_FACTOR)
            .wrapping_add(self.position)
    }

    /// height(u32 LE) ‖ position(u64 LE) ‖ satoshi(u64 LE) ‖ script
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(UTXO_HEADER_LEN + self.script.len());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(&self.satoshi.to_le_bytes());
        buf.extend_from_slice(&self.script);
        buf
    }

    /// Inverse of [`encode`](Self::encode). Classification fields are left untouched;
    /// callers re-run the classifier over `script`.
    pub fn decode_into(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() < UTXO_HEADER_LEN {
            return Err(anyhow!("utxo encoding too short: {} bytes", raw.len()));
        }
        self.height = u32::from_le_bytes(raw[0..4].try_into()?);
        self.position = u64::from_le_bytes(raw[4..12].try_into()?);
        self.satoshi = u64::from_le_bytes(raw[12..20].try_into()?);
        self.script.clear();
        self.script.extend_from_slice(&raw[UTXO_HEADER_LEN..]);
        Ok(())
    }
}

/// Running totals for one token observed while resolving inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenSummary {
    pub kind: Option<TokenKind>,
    pub nft_index: u64,
    pub code_hash: Vec<u8>,
    pub genesis_id: Vec<u8>,
    pub in_satoshi: u64,
    pub in_data_value: u64,
}

/// Analytical-store row shapes. Binary columns serialize as hex.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxRow {
    #[serde(with = "hex::serde")]
    pub txid: Vec<u8>,
    pub nin: u32,
    pub nout: u32,
    pub txsize: u32,
    pub locktime: u32,
    pub invalue: u64,
    pub outvalue: u64,
    #[serde(with = "hex::serde")]
    pub rawtx: Vec<u8>,
    pub height: u32,
    pub txidx: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutRow {
    #[serde(with = "hex::serde")]
    pub utxid: Vec<u8>,
    pub vout: u32,
    #[serde(with = "hex::serde")]
    pub address: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub codehash: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub genesis: Vec<u8>,
    pub data_value: u64,
    pub satoshi: u64,
    pub script_type: ScriptType,
    #[serde(with = "hex::serde")]
    pub script_pk: Vec<u8>,
    pub height: u32,
    pub utxidx: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInRow {
    pub height: u32,
    pub txidx: u64,
    #[serde(with = "hex::serde")]
    pub txid: Vec<u8>,
    pub idx: u32,
    #[serde(with = "hex::serde")]
    pub script_sig: Vec<u8>,
    pub nsequence: u32,
    pub height_txo: u32,
    pub utxidx: u64,
    #[serde(with = "hex::serde")]
    pub utxid: Vec<u8>,
    pub vout: u32,
    #[serde(with = "hex::serde")]
    pub address: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub codehash: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub genesis: Vec<u8>,
    pub data_value: u64,
    pub satoshi: u64,
    pub script_type: ScriptType,
    #[serde(with = "hex::serde")]
    pub script_pk: Vec<u8>,
}
