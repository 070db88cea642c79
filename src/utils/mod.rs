use bitcoin::hashes::{Hash, hash160, sha256d};
use std::time::{Duration, Instant};

/// Double SHA-256 of `data`, in internal byte order.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

/// Display form of a 32-byte hash: bytes reversed, then hex.
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    let mut rev = *hash;
    rev.reverse();
    hex::encode(rev)
}

/// Inverse of [`hash_to_hex`].
pub fn hex_to_hash(s: &str) -> Option<[u8; 32]> {
    let raw = hex::decode(s.trim()).ok()?;
    let mut arr: [u8; 32] = raw.try_into().ok()?;
    arr.reverse();
    Some(arr)
}

/// Rate-limited throughput line: txs processed since the last report.
pub struct SpeedTracker {
    last_report: Instant,
    txs_since_report: u64,
    total_txs: u64,
    interval: Duration,
}

impl SpeedTracker {
    pub fn new(interval: Duration) -> Self {
        Self { last_report: Instant::now(), txs_since_report: 0, total_txs: 0, interval }
    }

    /// Record a finished cycle. Returns the line to log when the interval has elapsed.
    pub fn record(&mut self, txs: usize, carryover_len: usize) -> Option<String> {
        self.txs_since_report += txs as u64;
        self.total_txs += txs as u64;
        let elapsed = self.last_report.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let rate = self.txs_since_report as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let line = format!(
            "{} txs in {} ({:.1} tx/s), total {}, carryover {}",
            self.txs_since_report,
            fmt_duration(elapsed),
            rate,
            self.total_txs,
            carryover_len
        );
        self.txs_since_report = 0;
        self.last_report = Instant::now();
        Some(line)
    }

    pub fn total(&self) -> u64 {
        self.total_txs
    }
}

/// Pretty format a `Duration` like `3h 07m`, `12m 05s`, or `42s`.
pub fn fmt_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hash_is_reversed() {
        let mut h = [0u8; 32];
        h[0] = 0xab;
        let s = hash_to_hex(&h);
        assert!(s.ends_with("ab"));
        assert_eq!(hex_to_hash(&s), Some(h));
    }

    #[test]
    fn hash256_matches_known_vector() {
        // sha256d("") = 5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456
        assert_eq!(
            hex::encode(hash256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn speed_tracker_rate_limits() {
        let mut t = SpeedTracker::new(Duration::from_secs(3600));
        assert!(t.record(10, 0).is_none());
        assert_eq!(t.total(), 10);

        let mut t = SpeedTracker::new(Duration::ZERO);
        let line = t.record(5, 3).unwrap();
        assert!(line.contains("carryover 3"));
    }

    #[test]
    fn fmt_duration_units() {
        assert_eq!(fmt_duration(Duration::from_secs(42)), "42s");
        assert_eq!(fmt_duration(Duration::from_secs(725)), "12m 05s");
        assert_eq!(fmt_duration(Duration::from_secs(3 * 3600 + 7 * 60)), "3h 07m");
    }
}
