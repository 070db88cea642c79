use crate::consts::{
    K_ADDR_UTXO, K_BALANCE, K_FT_BALANCE, K_FT_SUMMARY, K_FT_UTXO, K_NFT_OWNERS, K_NFT_SUMMARY,
    K_NFT_UTXO, K_SPENT_ADDR_UTXO, K_SPENT_FT_UTXO, K_SPENT_NFT_UTXO, K_SPENT_UTXO, K_UTXO,
    PROJECTION_NS,
};
use crate::runtime::mdb::Mdb;
use crate::schemas::{OutpointKey, UtxoRecord};
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use rocksdb::DB;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const TAG_RAW: u8 = b'u';
const TAG_ZSET: u8 = b'z';
const TAG_COUNTER: u8 = b'c';
const TAG_REGISTRY: u8 = b'r';

/// How projection structure names are namespaced for the cache deployment.
pub trait KeyGrouping: Send + Sync {
    fn namespace(&self) -> String;
}

/// Single node: plain `mp` namespace.
pub struct NoGrouping;

impl KeyGrouping for NoGrouping {
    fn namespace(&self) -> String {
        PROJECTION_NS.to_string()
    }
}

/// Clustered deployments: `{mp}` so every projection key hashes to one slot.
pub struct HashTagGrouping;

impl KeyGrouping for HashTagGrouping {
    fn namespace(&self) -> String {
        format!("{{{PROJECTION_NS}}}")
    }
}

pub fn parse_key_grouping(s: &str) -> Result<Box<dyn KeyGrouping>> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "none" => Ok(Box::new(NoGrouping)),
        "hash-tag" | "hash_tag" | "hashtag" => Ok(Box::new(HashTagGrouping)),
        other => bail!("invalid value for key_grouping: {other} (use none | hash-tag)"),
    }
}

/// The three disjoint record sets one cycle externalizes.
pub struct UtxoDelta<'a> {
    /// Created this cycle and still unspent.
    pub restore: &'a HashMap<OutpointKey, UtxoRecord>,
    /// Created by an earlier cycle, spent in this one.
    pub remove: &'a HashMap<OutpointKey, UtxoRecord>,
    /// Confirmed outputs spent by mempool transactions.
    pub spend: &'a HashMap<OutpointKey, UtxoRecord>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub restored: usize,
    pub removed: usize,
    pub spent: usize,
    pub counters_pruned: usize,
}

/// Fast key/value cache holding confirmed UTXOs and the mempool projection.
pub trait UtxoCache: Send + Sync {
    /// Raw encodings of confirmed UTXOs, one round-trip, in key order.
    fn get_confirmed(&self, keys: &[OutpointKey]) -> Result<Vec<Option<Vec<u8>>>>;
    /// Write restore/remove/spend in one batch, pruning counters that reach zero.
    fn apply_delta(&self, delta: &UtxoDelta<'_>) -> Result<DeltaStats>;
    /// Bulk-delete every structure listed in the registry. Returns keys removed.
    fn wipe_projection(&self) -> Result<usize>;
    /// Number of structures currently registered.
    fn registry_len(&self) -> Result<usize>;
}

fn structure_key(tag: u8, name: &[u8], member: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(3 + name.len() + member.len());
    k.push(tag);
    k.extend_from_slice(&(name.len() as u16).to_be_bytes());
    k.extend_from_slice(name);
    k.extend_from_slice(member);
    k
}

fn registry_key(tag: u8, name: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(4 + name.len());
    k.push(TAG_REGISTRY);
    k.extend_from_slice(&structure_key(tag, name, &[]));
    k
}

fn raw_key(key: &OutpointKey) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + 36);
    k.push(TAG_RAW);
    k.extend_from_slice(key.as_bytes());
    k
}

fn decode_counter(raw: &[u8]) -> i64 {
    raw.try_into().map(i64::from_le_bytes).unwrap_or(0)
}

/// Accumulates one delta before it hits the write batch.
#[derive(Default)]
struct DeltaPlan {
    raw_put: Vec<(OutpointKey, Vec<u8>)>,
    raw_del: Vec<OutpointKey>,
    zadd: Vec<(Vec<u8>, Vec<u8>, u64)>,
    zrem: Vec<(Vec<u8>, Vec<u8>)>,
    counters: HashMap<(Vec<u8>, Vec<u8>), i64>,
}

impl DeltaPlan {
    fn incr(&mut self, name: Vec<u8>, member: Vec<u8>, by: i64) {
        let c = self.counters.entry((name, member)).or_insert(0);
        *c = c.saturating_add(by);
    }
}

/// Signed counter delta for an unsigned amount. Token amounts come from
/// unchecked script data, so anything above `i64::MAX` yields `None`.
fn signed_amount(amount: u64, sign: i64) -> Option<i64> {
    i64::try_from(amount).ok().map(|a| sign * a)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Restore,
    Remove,
    Spend,
}

/// RocksDB-backed cache. Confirmed UTXOs live under `utxo/` (written by the
/// block indexer), the projection under `mempool/`.
pub struct RocksUtxoCache {
    confirmed: Mdb,
    projection: Mdb,
    ns: String,
}

impl RocksUtxoCache {
    pub fn new(db: Arc<DB>, grouping: &dyn KeyGrouping) -> Self {
        Self {
            confirmed: Mdb::from_db(db.clone(), b"utxo/"),
            projection: Mdb::from_db(db, b"mempool/"),
            ns: grouping.namespace(),
        }
    }

    /// `namespace ‖ suffix ‖ parts…`
    pub fn structure_name(&self, suffix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let mut n = Vec::with_capacity(self.ns.len() + suffix.len() + 80);
        n.extend_from_slice(self.ns.as_bytes());
        n.extend_from_slice(suffix);
        for p in parts {
            n.extend_from_slice(p);
        }
        n
    }

    /// Write a confirmed UTXO the way the block indexer does.
    pub fn put_confirmed(&self, key: &OutpointKey, rec: &UtxoRecord) -> Result<()> {
        self.confirmed.put(key.as_bytes(), &rec.encode()).context("put confirmed utxo")
    }

    pub fn projection_raw(&self, key: &OutpointKey) -> Result<Option<Vec<u8>>> {
        Ok(self.projection.get(&raw_key(key))?)
    }

    /// Members of an ordered set, ascending by score.
    pub fn zset_members(&self, name: &[u8]) -> Result<Vec<(Vec<u8>, u64)>> {
        let prefix = structure_key(TAG_ZSET, name, &[]);
        let mut out: Vec<(Vec<u8>, u64)> = self
            .projection
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(k, v)| {
                let score = v.as_slice().try_into().map(u64::from_be_bytes).unwrap_or(0);
                (k[prefix.len()..].to_vec(), score)
            })
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }

    pub fn counter(&self, name: &[u8], member: &[u8]) -> Result<i64> {
        let raw = self.projection.get(&structure_key(TAG_COUNTER, name, member))?;
        Ok(raw.as_deref().map(decode_counter).unwrap_or(0))
    }

    fn plan_record(&self, plan: &mut DeltaPlan, op: Op, key: &OutpointKey, rec: &UtxoRecord) {
        let score = rec.score();
        let member = key.as_bytes().to_vec();
        match op {
            Op::Restore => {
                plan.raw_put.push((*key, rec.encode()));
                plan.zadd.push((self.structure_name(K_UTXO, &[]), member.clone(), score));
            }
            Op::Remove => {
                plan.raw_del.push(*key);
                plan.zrem.push((self.structure_name(K_UTXO, &[]), member.clone()));
            }
            Op::Spend => {
                plan.zadd.push((self.structure_name(K_SPENT_UTXO, &[]), member.clone(), score));
            }
        }

        if !rec.has_address() {
            return;
        }
        let addr = rec.address_pkh.as_slice();
        let sign: i64 = if op == Op::Restore { 1 } else { -1 };

        match op {
            Op::Restore => {
                plan.zadd.push((self.structure_name(K_ADDR_UTXO, &[addr]), member.clone(), score))
            }
            Op::Remove => plan.zrem.push((self.structure_name(K_ADDR_UTXO, &[addr]), member.clone())),
            Op::Spend => plan.zadd.push((
                self.structure_name(K_SPENT_ADDR_UTXO, &[addr]),
                member.clone(),
                score,
            )),
        }
        match signed_amount(rec.satoshi, sign) {
            Some(by) => plan.incr(self.structure_name(K_BALANCE, &[]), addr.to_vec(), by),
            None => warn!("[cache] {key} satoshi {} exceeds counter range, balance skipped", rec.satoshi),
        }

        if !rec.has_token() {
            return;
        }
        let code = rec.code_hash.as_slice();
        let genesis = rec.genesis_id.as_slice();
        let token_id = rec.token_id();

        if rec.is_nft() {
            let mut nft_member = member;
            nft_member.extend_from_slice(&rec.data_value.to_le_bytes());
            match op {
                Op::Restore => plan.zadd.push((
                    self.structure_name(K_NFT_UTXO, &[code, genesis, addr]),
                    nft_member,
                    score,
                )),
                Op::Remove => plan
                    .zrem
                    .push((self.structure_name(K_NFT_UTXO, &[code, genesis, addr]), nft_member)),
                Op::Spend => plan.zadd.push((
                    self.structure_name(K_SPENT_NFT_UTXO, &[code, genesis, addr]),
                    nft_member,
                    score,
                )),
            }
            plan.incr(self.structure_name(K_NFT_OWNERS, &[code, genesis]), addr.to_vec(), sign);
            plan.incr(self.structure_name(K_NFT_SUMMARY, &[addr]), token_id, sign);
        } else {
            match op {
                Op::Restore => plan.zadd.push((
                    self.structure_name(K_FT_UTXO, &[code, genesis, addr]),
                    member,
                    score,
                )),
                Op::Remove => {
                    plan.zrem.push((self.structure_name(K_FT_UTXO, &[code, genesis, addr]), member))
                }
                Op::Spend => plan.zadd.push((
                    self.structure_name(K_SPENT_FT_UTXO, &[code, genesis, addr]),
                    member,
                    score,
                )),
            }
            let Some(amount) = signed_amount(rec.data_value, sign) else {
                warn!(
                    "[cache] {key} token amount {} exceeds counter range, balances skipped",
                    rec.data_value
                );
                return;
            };
            plan.incr(self.structure_name(K_FT_BALANCE, &[code, genesis]), addr.to_vec(), amount);
            plan.incr(self.structure_name(K_FT_SUMMARY, &[addr]), token_id, amount);
        }
    }
}

impl UtxoCache for RocksUtxoCache {
    fn get_confirmed(&self, keys: &[OutpointKey]) -> Result<Vec<Option<Vec<u8>>>> {
        let raw: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        self.confirmed.multi_get(&raw).context("confirmed utxo multi_get")
    }

    fn apply_delta(&self, delta: &UtxoDelta<'_>) -> Result<DeltaStats> {
        let mut plan = DeltaPlan::default();
        for (k, r) in delta.restore {
            self.plan_record(&mut plan, Op::Restore, k, r);
        }
        for (k, r) in delta.remove {
            self.plan_record(&mut plan, Op::Remove, k, r);
        }
        for (k, r) in delta.spend {
            self.plan_record(&mut plan, Op::Spend, k, r);
        }

        // current counter values, one round-trip
        let counter_keys: Vec<((Vec<u8>, Vec<u8>), i64)> = plan.counters.drain().collect();
        let lookup: Vec<Vec<u8>> = counter_keys
            .iter()
            .map(|((name, member), _)| structure_key(TAG_COUNTER, name, member))
            .collect();
        let current = self.projection.multi_get(&lookup).context("counter multi_get")?;

        let mut registry: HashSet<Vec<u8>> = HashSet::new();
        let mut pruned = 0usize;

        self.projection
            .bulk_write(|wb| {
                if !plan.raw_put.is_empty() || !plan.raw_del.is_empty() {
                    registry.insert(registry_key(TAG_RAW, self.ns.as_bytes()));
                }
                for (k, v) in &plan.raw_put {
                    wb.put(&raw_key(k), v);
                }
                for (name, member, score) in &plan.zadd {
                    wb.put(&structure_key(TAG_ZSET, name, member), &score.to_be_bytes());
                    registry.insert(registry_key(TAG_ZSET, name));
                }
                for k in &plan.raw_del {
                    wb.delete(&raw_key(k));
                }
                for (name, member) in &plan.zrem {
                    wb.delete(&structure_key(TAG_ZSET, name, member));
                }
                for ((((name, _), by), key), cur) in
                    counter_keys.iter().zip(lookup.iter()).zip(current.iter())
                {
                    let before = cur.as_deref().map(decode_counter).unwrap_or(0);
                    let after = before.saturating_add(*by);
                    if after == 0 {
                        if cur.is_some() {
                            pruned += 1;
                        }
                        wb.delete(key);
                    } else {
                        wb.put(key, &after.to_le_bytes());
                        registry.insert(registry_key(TAG_COUNTER, name));
                    }
                }
                for r in &registry {
                    wb.put(r, &[]);
                }
            })
            .context("apply utxo delta")?;

        let stats = DeltaStats {
            restored: delta.restore.len(),
            removed: delta.remove.len(),
            spent: delta.spend.len(),
            counters_pruned: pruned,
        };
        debug!("[cache] delta applied: {stats:?}");
        Ok(stats)
    }

    fn wipe_projection(&self) -> Result<usize> {
        let entries = self.projection.scan_prefix_keys(&[TAG_REGISTRY])?;
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        for reg in &entries {
            // r ‖ tag ‖ len ‖ name
            let Some(&tag) = reg.get(1) else { continue };
            let scope = if tag == TAG_RAW { vec![TAG_RAW] } else { reg[1..].to_vec() };
            doomed.extend(self.projection.scan_prefix_keys(&scope)?);
        }
        let removed = doomed.len();
        self.projection
            .bulk_write(|wb| {
                for k in doomed.iter().chain(entries.iter()) {
                    wb.delete(k);
                }
            })
            .context("wipe mempool projection")?;
        Ok(removed)
    }

    fn registry_len(&self) -> Result<usize> {
        Ok(self.projection.scan_prefix_keys(&[TAG_REGISTRY])?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MEMPOOL_HEIGHT;
    use crate::runtime::mdb::open_db;
    use crate::schemas::TokenKind;
    use tempfile::TempDir;

    fn cache() -> (TempDir, RocksUtxoCache) {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path()).unwrap();
        (dir, RocksUtxoCache::new(db, &NoGrouping))
    }

    fn addr_rec(position: u64, satoshi: u64) -> UtxoRecord {
        UtxoRecord {
            height: MEMPOOL_HEIGHT,
            position,
            satoshi,
            script: vec![0x51],
            address_pkh: vec![0xaa; 20],
            ..Default::default()
        }
    }

    fn ft_rec(position: u64, amount: u64) -> UtxoRecord {
        UtxoRecord {
            token_kind: Some(TokenKind::Fungible),
            code_hash: vec![0xc0; 20],
            genesis_id: vec![0x9e; 20],
            data_value: amount,
            ..addr_rec(position, 1)
        }
    }

    fn one(key: OutpointKey, rec: UtxoRecord) -> HashMap<OutpointKey, UtxoRecord> {
        HashMap::from([(key, rec)])
    }

    #[test]
    fn grouping_namespaces() {
        assert_eq!(NoGrouping.namespace(), "mp");
        assert_eq!(HashTagGrouping.namespace(), "{mp}");
        assert!(parse_key_grouping("hash-tag").is_ok());
        assert!(parse_key_grouping("ring").is_err());
    }

    #[test]
    fn restore_then_remove_balances_to_zero() {
        let (_d, c) = cache();
        let key = OutpointKey::new(&[1; 32], 0);
        let empty = HashMap::new();

        let restore = one(key, addr_rec(3, 500));
        c.apply_delta(&UtxoDelta { restore: &restore, remove: &empty, spend: &empty }).unwrap();
        assert_eq!(c.projection_raw(&key).unwrap(), Some(addr_rec(3, 500).encode()));
        let utxo_set = c.zset_members(&c.structure_name(K_UTXO, &[])).unwrap();
        assert_eq!(utxo_set, vec![(key.as_bytes().to_vec(), addr_rec(3, 500).score())]);
        assert_eq!(c.counter(&c.structure_name(K_BALANCE, &[]), &[0xaa; 20]).unwrap(), 500);

        let stats =
            c.apply_delta(&UtxoDelta { restore: &empty, remove: &restore, spend: &empty }).unwrap();
        assert_eq!(stats.counters_pruned, 1);
        assert_eq!(c.projection_raw(&key).unwrap(), None);
        assert!(c.zset_members(&c.structure_name(K_UTXO, &[])).unwrap().is_empty());
        assert_eq!(c.counter(&c.structure_name(K_BALANCE, &[]), &[0xaa; 20]).unwrap(), 0);
    }

    #[test]
    fn spend_marks_and_debits() {
        let (_d, c) = cache();
        let empty = HashMap::new();
        let key = OutpointKey::new(&[2; 32], 1);
        let rec = ft_rec(0, 40);
        c.apply_delta(&UtxoDelta { restore: &empty, remove: &empty, spend: &one(key, rec) })
            .unwrap();

        assert_eq!(c.zset_members(&c.structure_name(K_SPENT_UTXO, &[])).unwrap().len(), 1);
        let fb = c.structure_name(K_FT_BALANCE, &[&[0xc0; 20], &[0x9e; 20]]);
        assert_eq!(c.counter(&fb, &[0xaa; 20]).unwrap(), -40);
        let spent_fu = c.structure_name(K_SPENT_FT_UTXO, &[&[0xc0; 20], &[0x9e; 20], &[0xaa; 20]]);
        assert_eq!(c.zset_members(&spent_fu).unwrap().len(), 1);
        // spends never write the raw record
        assert_eq!(c.projection_raw(&key).unwrap(), None);
    }

    #[test]
    fn oversized_token_amounts_skip_counters() {
        let (_d, c) = cache();
        let empty = HashMap::new();
        let fb = c.structure_name(K_FT_BALANCE, &[&[0xc0; 20], &[0x9e; 20]]);

        let spent_key = OutpointKey::new(&[6; 32], 0);
        let spend = one(spent_key, ft_rec(0, 1 << 63));
        c.apply_delta(&UtxoDelta { restore: &empty, remove: &empty, spend: &spend }).unwrap();
        assert_eq!(c.counter(&fb, &[0xaa; 20]).unwrap(), 0);
        let spent_fu = c.structure_name(K_SPENT_FT_UTXO, &[&[0xc0; 20], &[0x9e; 20], &[0xaa; 20]]);
        assert_eq!(c.zset_members(&spent_fu).unwrap().len(), 1, "still marked spent");

        let restore: HashMap<_, _> = [
            (OutpointKey::new(&[7; 32], 0), ft_rec(1, u64::MAX)),
            (OutpointKey::new(&[7; 32], 1), ft_rec(2, 25)),
        ]
        .into_iter()
        .collect();
        c.apply_delta(&UtxoDelta { restore: &restore, remove: &empty, spend: &empty }).unwrap();
        assert_eq!(c.counter(&fb, &[0xaa; 20]).unwrap(), 25);
        assert_eq!(c.zset_members(&c.structure_name(K_UTXO, &[])).unwrap().len(), 2);
    }

    #[test]
    fn counter_deltas_saturate() {
        let (_d, c) = cache();
        let empty = HashMap::new();
        let restore: HashMap<_, _> = (0..3u8)
            .map(|i| (OutpointKey::new(&[8; 32], i as u32), ft_rec(i as u64, i64::MAX as u64)))
            .collect();
        c.apply_delta(&UtxoDelta { restore: &restore, remove: &empty, spend: &empty }).unwrap();
        let fb = c.structure_name(K_FT_BALANCE, &[&[0xc0; 20], &[0x9e; 20]]);
        assert_eq!(c.counter(&fb, &[0xaa; 20]).unwrap(), i64::MAX);
    }

    #[test]
    fn nft_members_carry_token_index() {
        let (_d, c) = cache();
        let empty = HashMap::new();
        let key = OutpointKey::new(&[3; 32], 0);
        let rec = UtxoRecord {
            token_kind: Some(TokenKind::NonFungible),
            data_value: 7,
            genesis_id: vec![0x5e; 36],
            ..ft_rec(0, 0)
        };
        c.apply_delta(&UtxoDelta { restore: &one(key, rec), remove: &empty, spend: &empty })
            .unwrap();
        let nu = c.structure_name(K_NFT_UTXO, &[&[0xc0; 20], &[0x5e; 36], &[0xaa; 20]]);
        let members = c.zset_members(&nu).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(&members[0].0[36..], &7u64.to_le_bytes());
        let owners = c.structure_name(K_NFT_OWNERS, &[&[0xc0; 20], &[0x5e; 36]]);
        assert_eq!(c.counter(&owners, &[0xaa; 20]).unwrap(), 1);
    }

    #[test]
    fn wipe_empties_registry_and_structures() {
        let (_d, c) = cache();
        let empty = HashMap::new();
        let restore: HashMap<_, _> = (0..4u8)
            .map(|i| (OutpointKey::new(&[i; 32], 0), ft_rec(i as u64, 10)))
            .collect();
        c.apply_delta(&UtxoDelta { restore: &restore, remove: &empty, spend: &empty }).unwrap();
        assert!(c.registry_len().unwrap() > 0);

        let removed = c.wipe_projection().unwrap();
        assert!(removed >= 4);
        assert_eq!(c.registry_len().unwrap(), 0);
        assert!(c.projection.scan_prefix_keys(b"").unwrap().is_empty());
    }

    #[test]
    fn confirmed_lookup_is_separate_from_projection() {
        let (_d, c) = cache();
        let key = OutpointKey::new(&[4; 32], 2);
        let rec = UtxoRecord { height: 100, position: 5, satoshi: 9, ..Default::default() };
        c.put_confirmed(&key, &rec).unwrap();
        let other = OutpointKey::new(&[5; 32], 0);
        let got = c.get_confirmed(&[key, other]).unwrap();
        assert_eq!(got, vec![Some(rec.encode()), None]);
        assert_eq!(c.projection_raw(&key).unwrap(), None);
    }
}
