use crate::core::script::{ScriptClassifier, classify_or_unknown};
use crate::schemas::{OutpointKey, Tx, TxHash, TxIn, TxOut};
use crate::utils::{hash_to_hex, hash256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {offset}: need {need} more bytes")]
    Truncated { offset: usize, need: usize },
    #[error("{trailing} trailing bytes after transaction end")]
    TrailingBytes { trailing: usize },
    #[error("declared count {count} at offset {offset} exceeds remaining data")]
    CountOverflow { offset: usize, count: u64 },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated { offset: self.pos, need: n - self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn hash(&mut self) -> Result<TxHash, DecodeError> {
        let mut h = [0u8; 32];
        h.copy_from_slice(self.take(32)?);
        Ok(h)
    }

    /// Compact size: < 0xfd inline, 0xfd/0xfe/0xff prefix a 2/4/8-byte LE value.
    fn compact_size(&mut self) -> Result<u64, DecodeError> {
        match self.u8()? {
            0xfd => Ok(self.u16()? as u64),
            0xfe => Ok(self.u32()? as u64),
            0xff => self.u64(),
            n => Ok(n as u64),
        }
    }

    /// A count of items, each at least `min_item` bytes long.
    fn count(&mut self, min_item: usize) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let count = self.compact_size()?;
        if count.saturating_mul(min_item as u64) > self.remaining() as u64 {
            return Err(DecodeError::CountOverflow { offset, count });
        }
        Ok(count as usize)
    }

    fn var_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.count(1)?;
        self.take(len)
    }
}

/// Decode a legacy-serialized transaction, hash it, and classify every output.
///
/// The only validity check is structural: the declared layout must consume the
/// buffer exactly.
pub fn decode_tx(raw: Vec<u8>, classifier: &dyn ScriptClassifier) -> Result<Tx, DecodeError> {
    let hash = hash256(&raw);
    let mut cur = Cursor::new(&raw);

    let version = cur.u32()?;

    // prev hash(32) + vout(4) + script len(1) + sequence(4)
    let n_in = cur.count(41)?;
    let mut inputs = Vec::with_capacity(n_in);
    for idx in 0..n_in {
        let prev_hash = cur.hash()?;
        let prev_vout = cur.u32()?;
        let script_sig = cur.var_bytes()?.to_vec();
        let sequence = cur.u32()?;
        inputs.push(TxIn {
            prev_hash,
            prev_vout,
            script_sig,
            sequence,
            spent_key: OutpointKey::new(&prev_hash, prev_vout),
            input_point: OutpointKey::new(&hash, idx as u32),
        });
    }

    // value(8) + script len(1)
    let n_out = cur.count(9)?;
    let mut outputs = Vec::with_capacity(n_out);
    for idx in 0..n_out {
        let satoshi = cur.u64()?;
        let script = cur.var_bytes()?.to_vec();
        let class = classify_or_unknown(classifier, &script);
        let unspendable = class.script_type.is_unspendable();
        outputs.push(TxOut {
            satoshi,
            script,
            outpoint: OutpointKey::new(&hash, idx as u32),
            class,
            unspendable,
        });
    }

    let locktime = cur.u32()?;

    if cur.remaining() != 0 {
        return Err(DecodeError::TrailingBytes { trailing: cur.remaining() });
    }

    let size = raw.len() as u32;
    Ok(Tx {
        raw,
        hash,
        hash_hex: hash_to_hex(&hash),
        size,
        version,
        locktime,
        inputs,
        outputs,
        inputs_value: 0,
        outputs_value: 0,
    })
}
