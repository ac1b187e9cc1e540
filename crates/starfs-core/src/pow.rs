//! Proof-of-work engine
//!
//! Difficulty is the expected number of hash attempts: a hash passes when it is
//! at most `(2^256 - 1) / difficulty`, so the target shrinks as difficulty grows.

use crate::error::StarfsError;
use primitive_types::U256;
use serde::Serialize;
use sha2::{Digest, Sha256};
use starfs_types::{Address, PowToken, Seed};
use tracing::debug;

#[derive(Serialize)]
struct BlockData<'a> {
    address: &'a Address,
    seed: Seed,
    time: i64,
}

/// Canonical block description hashed by a token
pub fn block_data(address: &Address, seed: Seed, time: i64) -> String {
    let data = BlockData {
        address,
        seed,
        time,
    };
    // Serializing a struct of a string and two integers cannot fail
    serde_json::to_string(&data).unwrap_or_default()
}

/// SHA-256 over `block_data` followed by the decimal nonce
pub fn hash(block_data: &str, nonce: u64) -> U256 {
    let mut hasher = Sha256::new();
    hasher.update(block_data.trim().as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    U256::from_big_endian(&hasher.finalize())
}

/// Largest hash value accepted at `difficulty`
pub fn target(difficulty: u64) -> U256 {
    U256::MAX / U256::from(difficulty.max(1))
}

pub fn meets_target(hash_value: U256, difficulty: u64) -> bool {
    hash_value <= target(difficulty)
}

pub fn verify(difficulty: u64, block_data: &str, nonce: u64) -> bool {
    meets_target(hash(block_data, nonce), difficulty)
}

/// Search nonces from 1 upward until one meets the target.
///
/// Unbounded and CPU-bound; async callers go through [`mine`].
pub fn mine_blocking(difficulty: u64, block_data: &str) -> u64 {
    let mut nonce = 0u64;
    loop {
        nonce = nonce.wrapping_add(1);
        if verify(difficulty, block_data, nonce) {
            return nonce;
        }
    }
}

/// Mine on the blocking pool so message handling keeps running
pub async fn mine(difficulty: u64, block_data: String) -> Result<u64, StarfsError> {
    let nonce =
        tokio::task::spawn_blocking(move || mine_blocking(difficulty, &block_data)).await?;
    Ok(nonce)
}

/// Mine a complete token for `address` stamped with the current time
pub async fn mint_token(
    difficulty: u64,
    address: Address,
    seed: Seed,
) -> Result<PowToken, StarfsError> {
    let time = chrono::Utc::now().timestamp_millis();
    let nonce = mine(difficulty, block_data(&address, seed, time)).await?;
    debug!("Mined token seed={} difficulty={} nonce={}", seed, difficulty, nonce);
    Ok(PowToken {
        difficulty,
        address,
        seed,
        nonce,
        time,
    })
}

/// Check the work carried by a token (freshness is checked by the ledger)
pub fn verify_token(token: &PowToken) -> bool {
    verify(
        token.difficulty,
        &block_data(&token.address, token.seed, token.time),
        token.nonce,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_data_is_canonical() {
        let data = block_data(&Address::from("0xabc"), Seed(9), 1700);
        assert_eq!(data, r#"{"address":"0xabc","seed":9,"time":1700}"#);
    }

    #[test]
    fn test_hash_matches_sha256_of_concatenation() {
        let expected = Sha256::digest(b"hello42");
        assert_eq!(hash("hello", 42), U256::from_big_endian(&expected));
    }

    #[test]
    fn test_difficulty_one_accepts_everything() {
        assert!(meets_target(U256::MAX, 1));
        assert!(meets_target(U256::MAX, 0));
        assert!(!meets_target(U256::MAX, 2));
    }

    #[test]
    fn test_target_monotonic() {
        let hash_value = hash("monotonic", 7);
        let mut passed = true;
        for difficulty in [1u64, 2, 4, 16, 256, 65_536, 1 << 32, u64::MAX] {
            let now = meets_target(hash_value, difficulty);
            // once failing, a larger difficulty never passes again
            assert!(passed || !now, "difficulty {} flipped back to pass", difficulty);
            passed = now;
        }
        assert!(target(10) < target(5));
    }

    #[test]
    fn test_mined_nonce_verifies() {
        let data = block_data(&Address::from("0xfeed"), Seed(1), 12345);
        for difficulty in [1u64, 3, 50, 500] {
            let nonce = mine_blocking(difficulty, &data);
            assert!(nonce >= 1);
            assert!(verify(difficulty, &data, nonce));
            // the search stops at the first passing nonce
            for earlier in 1..nonce {
                assert!(!verify(difficulty, &data, earlier));
            }
        }
    }

    #[tokio::test]
    async fn test_mint_token_verifies() {
        let token = mint_token(64, Address::from("0xbeef"), Seed(77)).await.unwrap();
        assert!(verify_token(&token));

        let mut forged = token.clone();
        forged.seed = Seed(78);
        forged.difficulty = 1 << 40;
        assert!(!verify_token(&forged));
    }
}
