use crate::core::BlockHeader;
use crate::utils::{Hash256, DIGEST_LEN};
use num_bigint::{BigInt, Sign};
use ring::digest::{Context, SHA256};
use std::ops::ShlAssign;
use std::sync::atomic::{AtomicBool, Ordering};

/// Highest difficulty that can ever be met (a 256-bit hash with 256 leading zeros)
pub const MAX_DIFFICULTY: u32 = (DIGEST_LEN * 8) as u32;

/// Nonce search over a fixed header.
///
/// A hash meets difficulty `d` when, read as a big-endian unsigned integer,
/// it is below `2^(256 - d)`. That is the same as having at least `d` leading
/// zero bits. Difficulty 0 accepts every hash; anything above 256 accepts none.
pub struct ProofOfWork {
    prefix: Context,
    difficulty: u32,
}

/// What a nonce search ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found {
        nonce: u64,
        hash: Hash256,
        hashes_tried: u64,
    },
    Cancelled {
        hashes_tried: u64,
    },
    Exhausted {
        hashes_tried: u64,
    },
}

impl ProofOfWork {
    pub fn new(header: &BlockHeader) -> ProofOfWork {
        let mut prefix = Context::new(&SHA256);
        prefix.update(&header.preimage_without_nonce());
        ProofOfWork {
            prefix,
            difficulty: header.difficulty,
        }
    }

    /// Exclusive upper bound a hash must stay under, `None` when unsatisfiable
    pub fn target_for(difficulty: u32) -> Option<BigInt> {
        if difficulty > MAX_DIFFICULTY {
            return None;
        }
        let mut target = BigInt::from(1);
        target.shl_assign(MAX_DIFFICULTY - difficulty);
        Some(target)
    }

    pub fn meets_target(hash: &Hash256, difficulty: u32) -> bool {
        match Self::target_for(difficulty) {
            Some(target) => BigInt::from_bytes_be(Sign::Plus, hash.as_bytes()) < target,
            None => false,
        }
    }

    /// Recompute the header hash and check it against the declared difficulty
    pub fn validate(header: &BlockHeader) -> bool {
        Self::meets_target(&header.hash(), header.difficulty)
    }

    /// Header hash for `nonce`; identical to hashing the full canonical header
    pub fn seal(header: &BlockHeader, nonce: u64) -> Hash256 {
        ProofOfWork::new(header).hash_with_nonce(nonce)
    }

    pub fn hash_with_nonce(&self, nonce: u64) -> Hash256 {
        let mut context = self.prefix.clone();
        context.update(&nonce.to_be_bytes());
        let digest = context.finish();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(digest.as_ref());
        Hash256::from_bytes(out)
    }

    /// Average number of attempts needed at `difficulty`
    pub fn expected_hashes(difficulty: u32) -> f64 {
        2f64.powi(difficulty.min(MAX_DIFFICULTY) as i32)
    }

    /// Try nonces from `start_nonce` upwards (wrapping) until one meets the
    /// target, `cancel` is raised, or every nonce has been tried.
    ///
    /// `cancel` is polled and `on_progress(hashes_tried, last_hash)` called
    /// every `check_interval` attempts.
    pub fn search<F>(
        &self,
        start_nonce: u64,
        check_interval: u64,
        cancel: &AtomicBool,
        mut on_progress: F,
    ) -> SearchOutcome
    where
        F: FnMut(u64, &Hash256),
    {
        if self.difficulty > MAX_DIFFICULTY {
            return SearchOutcome::Exhausted { hashes_tried: 0 };
        }
        let interval = check_interval.max(1);
        let mut nonce = start_nonce;
        let mut hashes_tried: u64 = 0;

        loop {
            if hashes_tried % interval == 0 && cancel.load(Ordering::Acquire) {
                return SearchOutcome::Cancelled { hashes_tried };
            }

            let hash = self.hash_with_nonce(nonce);
            hashes_tried += 1;

            // Leading-zero count is the cheap form of the target comparison
            if hash.leading_zero_bits() >= self.difficulty {
                return SearchOutcome::Found {
                    nonce,
                    hash,
                    hashes_tried,
                };
            }

            if hashes_tried % interval == 0 {
                on_progress(hashes_tried, &hash);
            }

            if hashes_tried == u64::MAX {
                return SearchOutcome::Exhausted { hashes_tried };
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, BodySource, Transaction};

    fn hash_with_prefix(prefix: &[u8]) -> Hash256 {
        let mut bytes = [0xffu8; DIGEST_LEN];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Hash256::from_bytes(bytes)
    }

    fn candidate(difficulty: u32) -> Block {
        let coinbase = Transaction::coinbase("miner", 50, 0, 1).unwrap();
        Block::candidate_at(
            1,
            Block::genesis().hash(),
            BodySource::Structured(vec![coinbase]),
            difficulty,
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_meets_target_counts_leading_zero_bits() {
        // 0x000f.. has 12 leading zero bits
        let hash = hash_with_prefix(&[0x00, 0x0f]);
        assert!(ProofOfWork::meets_target(&hash, 0));
        assert!(ProofOfWork::meets_target(&hash, 12));
        assert!(!ProofOfWork::meets_target(&hash, 13));

        assert!(ProofOfWork::meets_target(&Hash256::ZERO, 256));
        assert!(!ProofOfWork::meets_target(&Hash256::ZERO, 257));
    }

    #[test]
    fn test_target_comparison_matches_zero_bit_count() {
        for prefix in [[0x00u8, 0x01], [0x07, 0xff], [0x80, 0x00], [0x00, 0x00]] {
            let hash = hash_with_prefix(&prefix);
            for difficulty in 0..=20 {
                assert_eq!(
                    ProofOfWork::meets_target(&hash, difficulty),
                    hash.leading_zero_bits() >= difficulty
                );
            }
        }
    }

    #[test]
    fn test_higher_difficulty_has_smaller_target() {
        let easy = ProofOfWork::target_for(1).unwrap();
        let hard = ProofOfWork::target_for(2).unwrap();
        assert!(hard < easy);
        assert!(ProofOfWork::target_for(MAX_DIFFICULTY + 1).is_none());
    }

    #[test]
    fn test_seal_matches_full_header_hash() {
        let block = candidate(4);
        let header = block.header().clone();
        for nonce in [0u64, 1, 12345, u64::MAX] {
            let mut h = header.clone();
            h.nonce = nonce;
            assert_eq!(ProofOfWork::seal(&header, nonce), h.hash());
        }
    }

    #[test]
    fn test_search_finds_valid_nonce() {
        let block = candidate(8);
        let pow = ProofOfWork::new(block.header());
        let cancel = AtomicBool::new(false);
        match pow.search(0, 1000, &cancel, |_, _| {}) {
            SearchOutcome::Found { nonce, hash, .. } => {
                let sealed = block.seal(nonce);
                assert_eq!(sealed.hash(), hash);
                assert!(sealed.is_sealed());
                assert!(ProofOfWork::validate(sealed.header()));
            }
            other => panic!("expected a nonce, got {other:?}"),
        }
    }

    #[test]
    fn test_search_honours_cancel_flag() {
        let block = candidate(200);
        let pow = ProofOfWork::new(block.header());
        let cancel = AtomicBool::new(true);
        assert_eq!(
            pow.search(0, 10, &cancel, |_, _| {}),
            SearchOutcome::Cancelled { hashes_tried: 0 }
        );
    }

    #[test]
    fn test_search_reports_progress() {
        let block = candidate(200);
        let pow = ProofOfWork::new(block.header());
        let cancel = AtomicBool::new(false);
        let mut reports = Vec::new();
        let outcome = pow.search(0, 100, &cancel, |tried, _| {
            reports.push(tried);
            if tried >= 500 {
                cancel.store(true, Ordering::Release);
            }
        });
        assert_eq!(reports, vec![100, 200, 300, 400, 500]);
        assert_eq!(outcome, SearchOutcome::Cancelled { hashes_tried: 500 });
    }

    #[test]
    fn test_unsatisfiable_difficulty_is_exhausted_immediately() {
        let block = candidate(MAX_DIFFICULTY + 1);
        let pow = ProofOfWork::new(block.header());
        let cancel = AtomicBool::new(false);
        assert_eq!(
            pow.search(0, 10, &cancel, |_, _| {}),
            SearchOutcome::Exhausted { hashes_tried: 0 }
        );
    }
}
