use crate::consts::SEQUENCE_FINAL;
use crate::schemas::{Tx, TxHash};
use std::collections::HashSet;

/// Final unless a nonzero locktime is paired with a non-final input sequence.
pub fn is_final(tx: &Tx) -> bool {
    tx.locktime == 0 || tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// Excluded this cycle: itself non-final, or spending anything already in `skip`.
///
/// `skip` must be filled in arrival order for the cascade to hold.
pub fn is_non_final(tx: &Tx, skip: &HashSet<TxHash>) -> bool {
    !is_final(tx) || tx.inputs.iter().any(|i| skip.contains(&i.prev_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::decode_tx;
    use crate::core::script::ClassifierChain;
    use crate::test_utils::TxBuilder;

    fn tx(builder: TxBuilder) -> Tx {
        decode_tx(builder.build(), &ClassifierChain::default()).unwrap()
    }

    #[test]
    fn zero_locktime_is_final() {
        let t = tx(TxBuilder::new().locktime(0).input([1; 32], 0, vec![], 0).output(1, vec![0x51]));
        assert!(is_final(&t));
    }

    #[test]
    fn locktime_with_max_sequences_is_final() {
        let t = tx(TxBuilder::new()
            .locktime(500)
            .input([1; 32], 0, vec![], u32::MAX)
            .input([2; 32], 0, vec![], u32::MAX)
            .output(1, vec![0x51]));
        assert!(is_final(&t));
    }

    #[test]
    fn locktime_with_open_sequence_is_non_final() {
        let t = tx(TxBuilder::new()
            .locktime(500)
            .input([1; 32], 0, vec![], u32::MAX)
            .input([2; 32], 0, vec![], 7)
            .output(1, vec![0x51]));
        assert!(!is_final(&t));
        assert!(is_non_final(&t, &HashSet::new()));
    }

    #[test]
    fn spending_a_skipped_tx_cascades() {
        let t = tx(TxBuilder::simple([9; 32], 0, 1));
        let mut skip = HashSet::new();
        assert!(!is_non_final(&t, &skip));
        skip.insert([9; 32]);
        assert!(is_non_final(&t, &skip));
    }
}
