//! Authorization nonces.
//!
//! A nonce is 32 bytes: a big-endian per-payer counter, then 24 random bytes
//! drawn fresh for every nonce. Within one source the nonces of a payer strictly
//! increase; the random tail keeps them apart across processes and makes the
//! next one impossible to guess from the last.

use alloy_primitives::{Address, B256};
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct NonceSource {
    counters: DashMap<Address, u64>,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next nonce for `payer`.
    pub fn next(&self, payer: Address) -> B256 {
        let counter = {
            let mut entry = self.counters.entry(payer).or_insert(0);
            *entry = entry.wrapping_add(1);
            *entry
        };
        let tail: [u8; 24] = rand::random();
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&counter.to_be_bytes());
        bytes[8..].copy_from_slice(&tail);
        B256::from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_monotonic_per_payer() {
        let source = NonceSource::new();
        let payer = Address::repeat_byte(1);
        let a = source.next(payer);
        let b = source.next(payer);
        assert!(b > a);
        assert_eq!(&a[..8], &1u64.to_be_bytes());
        assert_eq!(&b[..8], &2u64.to_be_bytes());
        assert_ne!(&a[8..], &b[8..]);
        let other = source.next(Address::repeat_byte(2));
        assert_eq!(&other[..8], &a[..8]);
        assert_ne!(other, a);
    }

    #[test]
    fn test_sources_differ() {
        let payer = Address::repeat_byte(1);
        assert_ne!(NonceSource::new().next(payer), NonceSource::new().next(payer));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nonces_are_unique() {
        let source = Arc::new(NonceSource::new());
        let payer = Address::repeat_byte(7);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.next(payer) })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 64);
    }
}
