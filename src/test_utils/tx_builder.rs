use crate::schemas::TxHash;
use crate::utils::hash256;

/// Builds legacy-serialized raw transactions byte by byte.
#[derive(Clone, Debug)]
pub struct TxBuilder {
    version: u32,
    locktime: u32,
    inputs: Vec<(TxHash, u32, Vec<u8>, u32)>,
    outputs: Vec<(u64, Vec<u8>)>,
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TxBuilder {
    pub fn new() -> Self {
        Self { version: 1, locktime: 0, inputs: Vec::new(), outputs: Vec::new() }
    }

    /// One final input spending `prev:vout`, one P2PKH output of `value`.
    pub fn simple(prev: TxHash, vout: u32, value: u64) -> Self {
        Self::new().input(prev, vout, vec![], u32::MAX).output(value, scripts::p2pkh(&[0x11; 20]))
    }

    pub fn version(mut self, v: u32) -> Self {
        self.version = v;
        self
    }

    pub fn locktime(mut self, l: u32) -> Self {
        self.locktime = l;
        self
    }

    pub fn input(mut self, prev: TxHash, vout: u32, script_sig: Vec<u8>, sequence: u32) -> Self {
        self.inputs.push((prev, vout, script_sig, sequence));
        self
    }

    pub fn output(mut self, value: u64, script: Vec<u8>) -> Self {
        self.outputs.push((value, script));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact(&mut out, self.inputs.len() as u64);
        for (prev, vout, sig, seq) in &self.inputs {
            out.extend_from_slice(prev);
            out.extend_from_slice(&vout.to_le_bytes());
            write_compact(&mut out, sig.len() as u64);
            out.extend_from_slice(sig);
            out.extend_from_slice(&seq.to_le_bytes());
        }
        write_compact(&mut out, self.outputs.len() as u64);
        for (value, script) in &self.outputs {
            out.extend_from_slice(&value.to_le_bytes());
            write_compact(&mut out, script.len() as u64);
            out.extend_from_slice(script);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    /// Internal-order hash of the built transaction.
    pub fn txid(&self) -> TxHash {
        hash256(&self.build())
    }
}

pub fn write_compact(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub mod scripts {
    /// Contract body made only of non-push opcodes so it walks cleanly.
    pub const CODE: &[u8] = &[0x76, 0xa9, 0x87, 0x75, 0x7c, 0x93];

    pub fn p2pkh(pkh: &[u8; 20]) -> Vec<u8> {
        let mut s = vec![0x76, 0xa9, 0x14];
        s.extend_from_slice(pkh);
        s.extend_from_slice(&[0x88, 0xac]);
        s
    }

    pub fn p2sh(sh: &[u8; 20]) -> Vec<u8> {
        let mut s = vec![0xa9, 0x14];
        s.extend_from_slice(sh);
        s.push(0x87);
        s
    }

    pub fn op_return(data: &[u8]) -> Vec<u8> {
        let mut s = vec![0x6a];
        push_data(&mut s, data);
        s
    }

    pub fn push_data(s: &mut Vec<u8>, data: &[u8]) {
        match data.len() {
            0..=0x4b => s.push(data.len() as u8),
            0x4c..=0xff => {
                s.push(0x4c);
                s.push(data.len() as u8);
            }
            _ => {
                s.push(0x4d);
                s.extend_from_slice(&(data.len() as u16).to_le_bytes());
            }
        }
        s.extend_from_slice(data);
    }

    fn fixed(raw: &[u8], len: usize) -> Vec<u8> {
        let mut v = raw.to_vec();
        v.resize(len, 0);
        v
    }

    fn contract(code: &[u8], body: Vec<u8>, proto_type: u32) -> Vec<u8> {
        let mut data = body;
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&proto_type.to_le_bytes());
        data.extend_from_slice(b"sensible");
        let mut s = code.to_vec();
        s.push(0x6a);
        push_data(&mut s, &data);
        s
    }

    pub fn sensible_ft(
        code: &[u8],
        name: &str,
        symbol: &str,
        decimals: u8,
        address: &[u8; 20],
        amount: u64,
        genesis: &[u8; 20],
    ) -> Vec<u8> {
        let mut body = fixed(name.as_bytes(), 20);
        body.extend(fixed(symbol.as_bytes(), 10));
        body.push(0); // is_genesis
        body.push(decimals);
        body.extend_from_slice(address);
        body.extend_from_slice(&amount.to_le_bytes());
        body.extend_from_slice(genesis);
        body.extend_from_slice(&[0xee; 36]);
        contract(code, body, 1)
    }

    pub fn sensible_unique(
        code: &[u8],
        custom: &[u8],
        address: &[u8; 20],
        genesis: &[u8; 20],
    ) -> Vec<u8> {
        let mut body = custom.to_vec();
        body.extend_from_slice(address);
        body.extend_from_slice(genesis);
        body.extend_from_slice(&[0xee; 36]);
        contract(code, body, 2)
    }

    pub fn sensible_nft(
        code: &[u8],
        address: &[u8; 20],
        token_index: u64,
        sensible_id: &[u8; 36],
    ) -> Vec<u8> {
        let mut body = vec![0u8; 36]; // metaid outpoint
        body.push(0); // is_genesis
        body.extend_from_slice(address);
        body.extend_from_slice(&100u64.to_le_bytes()); // total supply
        body.extend_from_slice(&token_index.to_le_bytes());
        body.extend_from_slice(&[0xdd; 20]); // genesis hash
        body.extend_from_slice(sensible_id);
        contract(code, body, 3)
    }
}
