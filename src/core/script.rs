use crate::schemas::{Classification, ScriptType, TokenInfo, TokenKind};
use crate::utils::hash160;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

const SENSIBLE_TAG: &[u8] = b"sensible";
/// proto_version(4) ‖ proto_type(4) ‖ "sensible"(8)
const SENSIBLE_TAIL_LEN: usize = 16;
const SENSIBLE_ID_LEN: usize = 36;
const GENESIS_HASH_LEN: usize = 20;
const ADDRESS_LEN: usize = 20;

const PROTO_TYPE_FT: u32 = 1;
const PROTO_TYPE_UNIQUE: u32 = 2;
const PROTO_TYPE_NFT: u32 = 3;

/// Given locking-script bytes, recognise one script family.
///
/// Returning `None` hands the script to the next classifier in a [`ClassifierChain`].
pub trait ScriptClassifier: Send + Sync {
    fn classify(&self, script: &[u8]) -> Option<Classification>;
}

/// Runs classifiers in order; the first match wins, otherwise `Unknown`.
pub struct ClassifierChain {
    classifiers: Vec<Box<dyn ScriptClassifier>>,
}

impl ClassifierChain {
    pub fn new(classifiers: Vec<Box<dyn ScriptClassifier>>) -> Self {
        Self { classifiers }
    }

    pub fn push(&mut self, classifier: Box<dyn ScriptClassifier>) {
        self.classifiers.push(classifier);
    }
}

impl Default for ClassifierChain {
    fn default() -> Self {
        Self::new(vec![Box::new(SensibleTokenClassifier), Box::new(StandardClassifier)])
    }
}

impl ScriptClassifier for ClassifierChain {
    fn classify(&self, script: &[u8]) -> Option<Classification> {
        self.classifiers
            .iter()
            .find_map(|c| c.classify(script))
            .or_else(|| Some(Classification::default()))
    }
}

/// Classify through `classifier`, falling back to `Unknown`.
pub fn classify_or_unknown(classifier: &dyn ScriptClassifier, script: &[u8]) -> Classification {
    classifier.classify(script).unwrap_or_default()
}

/// P2PKH, P2SH, P2PK, bare multisig and data carriers.
pub struct StandardClassifier;

impl ScriptClassifier for StandardClassifier {
    fn classify(&self, s: &[u8]) -> Option<Classification> {
        if s.len() == 25
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == 0x14
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
        {
            return Some(with_address(ScriptType::P2pkh, &s[3..23]));
        }
        if s.len() == 23 && s[0] == OP_HASH160 && s[1] == 0x14 && s[22] == OP_EQUAL {
            return Some(with_address(ScriptType::P2sh, &s[2..22]));
        }
        if (s.len() == 35 && s[0] == 0x21 || s.len() == 67 && s[0] == 0x41)
            && s[s.len() - 1] == OP_CHECKSIG
        {
            let pubkey = &s[1..s.len() - 1];
            return Some(with_address(ScriptType::P2pk, &hash160(pubkey)));
        }
        if is_data_carrier(s) {
            return Some(Classification { script_type: ScriptType::NullData, ..Default::default() });
        }
        if s.len() >= 3
            && (OP_1..=OP_16).contains(&s[0])
            && (OP_1..=OP_16).contains(&s[s.len() - 2])
            && s[s.len() - 1] == OP_CHECKMULTISIG
        {
            return Some(Classification { script_type: ScriptType::Multisig, ..Default::default() });
        }
        None
    }
}

fn with_address(script_type: ScriptType, addr: &[u8]) -> Classification {
    Classification { script_type, address_pkh: addr.to_vec(), token: None }
}

fn is_data_carrier(s: &[u8]) -> bool {
    matches!(s, [OP_RETURN, ..] | [OP_0, OP_RETURN, ..])
}

/// Token contracts that end `<code> OP_RETURN <data>` with a `sensible` tagged tail.
pub struct SensibleTokenClassifier;

impl ScriptClassifier for SensibleTokenClassifier {
    fn classify(&self, script: &[u8]) -> Option<Classification> {
        let (code_len, data) = last_push(script)?;
        if code_len == 0 || script[code_len - 1] != OP_RETURN {
            return None;
        }
        if data.len() < SENSIBLE_TAIL_LEN || !data.ends_with(SENSIBLE_TAG) {
            return None;
        }
        let tail = data.len() - SENSIBLE_TAIL_LEN;
        let proto_type = read_u32(data, tail + 4)?;
        let body = &data[..tail];
        let code_hash = hash160(&script[..code_len]).to_vec();

        let (script_type, address, token) = match proto_type {
            PROTO_TYPE_FT => parse_ft(body)?,
            PROTO_TYPE_UNIQUE => parse_unique(body)?,
            PROTO_TYPE_NFT => parse_nft(body)?,
            _ => return None,
        };
        Some(Classification {
            script_type,
            address_pkh: address,
            token: Some(TokenInfo { code_hash, ..token }),
        })
    }
}

type Parsed = (ScriptType, Vec<u8>, TokenInfo);

// name(20) symbol(10) is_genesis(1) decimals(1) address(20) amount(8) genesis_hash(20) sensible_id(36)
fn parse_ft(body: &[u8]) -> Option<Parsed> {
    const LEN: usize = 20 + 10 + 1 + 1 + ADDRESS_LEN + 8 + GENESIS_HASH_LEN + SENSIBLE_ID_LEN;
    let f = body.len().checked_sub(LEN)?;
    let name = trim_str(&body[f..f + 20]);
    let symbol = trim_str(&body[f + 20..f + 30]);
    let decimals = body[f + 31] as u64;
    let address = body[f + 32..f + 52].to_vec();
    let amount = read_u64(body, f + 52)?;
    let genesis = body[f + 60..f + 80].to_vec();
    Some((
        ScriptType::SensibleFt,
        address,
        TokenInfo {
            kind: Some(TokenKind::Fungible),
            genesis_id: genesis,
            data_value: amount,
            decimals,
            name,
            symbol,
            ..Default::default()
        },
    ))
}

// custom_data(*) address(20) genesis_hash(20) sensible_id(36)
fn parse_unique(body: &[u8]) -> Option<Parsed> {
    const LEN: usize = ADDRESS_LEN + GENESIS_HASH_LEN + SENSIBLE_ID_LEN;
    let f = body.len().checked_sub(LEN)?;
    let address = body[f..f + 20].to_vec();
    let genesis = body[f + 20..f + 40].to_vec();
    Some((
        ScriptType::SensibleUnique,
        address,
        TokenInfo { kind: Some(TokenKind::Unique), genesis_id: genesis, ..Default::default() },
    ))
}

// metaid_outpoint(36) is_genesis(1) address(20) total_supply(8) token_index(8) genesis_hash(20) sensible_id(36)
fn parse_nft(body: &[u8]) -> Option<Parsed> {
    const LEN: usize = 36 + 1 + ADDRESS_LEN + 8 + 8 + GENESIS_HASH_LEN + SENSIBLE_ID_LEN;
    let f = body.len().checked_sub(LEN)?;
    let address = body[f + 37..f + 57].to_vec();
    let token_index = read_u64(body, f + 65)?;
    let sensible_id = body[f + 93..f + 129].to_vec();
    Some((
        ScriptType::SensibleNft,
        address,
        TokenInfo {
            kind: Some(TokenKind::NonFungible),
            genesis_id: sensible_id,
            data_value: token_index,
            ..Default::default()
        },
    ))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(b: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(at..at + 8)?.try_into().ok()?))
}

fn trim_str(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Walk the script's ops. If the final op is a data push that runs exactly to
/// the end of the script, return (offset of that push op, pushed data).
pub fn last_push(script: &[u8]) -> Option<(usize, &[u8])> {
    let mut pc = 0usize;
    let mut last: Option<(usize, usize, usize)> = None;
    while pc < script.len() {
        let op_start = pc;
        let op = script[pc];
        pc += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let l = *script.get(pc)? as usize;
                pc += 1;
                l
            }
            OP_PUSHDATA2 => {
                let l = u16::from_le_bytes(script.get(pc..pc + 2)?.try_into().ok()?) as usize;
                pc += 2;
                l
            }
            OP_PUSHDATA4 => {
                let l = u32::from_le_bytes(script.get(pc..pc + 4)?.try_into().ok()?) as usize;
                pc += 4;
                l
            }
            _ => {
                last = None;
                continue;
            }
        };
        let end = pc.checked_add(len)?;
        if end > script.len() {
            return None;
        }
        last = Some((op_start, pc, end));
        pc = end;
    }
    let (op_start, data_start, data_end) = last?;
    Some((op_start, &script[data_start..data_end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scripts;

    #[test]
    fn classifies_p2pkh() {
        let s = scripts::p2pkh(&[9u8; 20]);
        let c = ClassifierChain::default().classify(&s).unwrap();
        assert_eq!(c.script_type, ScriptType::P2pkh);
        assert_eq!(c.address_pkh, vec![9u8; 20]);
        assert!(c.token.is_none());
    }

    #[test]
    fn classifies_p2sh_and_p2pk() {
        let chain = ClassifierChain::default();
        let p2sh = scripts::p2sh(&[3u8; 20]);
        assert_eq!(chain.classify(&p2sh).unwrap().script_type, ScriptType::P2sh);

        let mut p2pk = vec![0x21];
        p2pk.extend_from_slice(&[2u8; 33]);
        p2pk.push(OP_CHECKSIG);
        let c = chain.classify(&p2pk).unwrap();
        assert_eq!(c.script_type, ScriptType::P2pk);
        assert_eq!(c.address_pkh, hash160(&[2u8; 33]).to_vec());
    }

    #[test]
    fn data_carriers_are_unspendable() {
        let chain = ClassifierChain::default();
        for s in [scripts::op_return(b"hello"), vec![OP_0, OP_RETURN, 0x01, 0xff]] {
            let c = chain.classify(&s).unwrap();
            assert_eq!(c.script_type, ScriptType::NullData);
            assert!(c.script_type.is_unspendable());
        }
    }

    #[test]
    fn unknown_scripts_fall_through() {
        let c = ClassifierChain::default().classify(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(c.script_type, ScriptType::Unknown);
        assert!(c.address_pkh.is_empty());
    }

    #[test]
    fn extracts_fungible_token() {
        let s = scripts::sensible_ft(scripts::CODE, "Token", "TK", 8, &[5u8; 20], 1_000, &[6u8; 20]);
        let c = ClassifierChain::default().classify(&s).unwrap();
        assert_eq!(c.script_type, ScriptType::SensibleFt);
        assert_eq!(c.address_pkh, vec![5u8; 20]);
        let t = c.token.unwrap();
        assert_eq!(t.kind, Some(TokenKind::Fungible));
        assert_eq!(t.name, "Token");
        assert_eq!(t.symbol, "TK");
        assert_eq!(t.decimals, 8);
        assert_eq!(t.data_value, 1_000);
        assert_eq!(t.genesis_id, vec![6u8; 20]);
        assert_eq!(t.code_hash.len(), 20);
    }

    #[test]
    fn extracts_nft_with_sensible_id_as_genesis() {
        let s = scripts::sensible_nft(scripts::CODE, &[4u8; 20], 17, &[8u8; 36]);
        let c = ClassifierChain::default().classify(&s).unwrap();
        assert_eq!(c.script_type, ScriptType::SensibleNft);
        let t = c.token.unwrap();
        assert_eq!(t.kind, Some(TokenKind::NonFungible));
        assert_eq!(t.data_value, 17);
        assert_eq!(t.genesis_id, vec![8u8; 36]);
    }

    #[test]
    fn extracts_unique() {
        let s = scripts::sensible_unique(scripts::CODE, b"custom", &[1u8; 20], &[2u8; 20]);
        let c = ClassifierChain::default().classify(&s).unwrap();
        assert_eq!(c.script_type, ScriptType::SensibleUnique);
        assert_eq!(c.address_pkh, vec![1u8; 20]);
        assert_eq!(c.token.unwrap().kind, Some(TokenKind::Unique));
    }

    #[test]
    fn rejects_tail_without_op_return() {
        let mut s = scripts::sensible_ft(scripts::CODE, "T", "T", 0, &[5u8; 20], 1, &[6u8; 20]);
        // replace the OP_RETURN before the final push
        let (code_len, _) = last_push(&s).unwrap();
        s[code_len - 1] = 0x75;
        assert!(SensibleTokenClassifier.classify(&s).is_none());
    }

    #[test]
    fn last_push_handles_pushdata_forms() {
        let mut s = vec![OP_DUP, OP_PUSHDATA1, 3, 1, 2, 3];
        assert_eq!(last_push(&s), Some((1, &[1u8, 2, 3][..])));
        s.push(OP_CHECKSIG);
        assert_eq!(last_push(&s), None);
        assert_eq!(last_push(&[0x05, 1, 2]), None);
    }
}
