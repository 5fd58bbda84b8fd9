//! Token ring and replica lookup for token-aware routing.

use std::collections::HashSet;
use std::net::SocketAddr;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
}

/// Token of a partition key under the Murmur3 partitioner.
///
/// This is the first half of MurmurHash3 x64/128 with seed 0, computed the
/// way the server does: tail bytes are sign-extended before mixing, and
/// `i64::MIN` is mapped to `i64::MAX` since it is not a valid token.
pub fn murmur3_token(key: &[u8]) -> i64 {
    let len = key.len();
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    let mut blocks = key.chunks_exact(16);
    for block in &mut blocks {
        let (lo, hi) = block.split_at(8);
        let k1 = u64::from_le_bytes(lo.try_into().unwrap_or([0; 8]));
        let k2 = u64::from_le_bytes(hi.try_into().unwrap_or([0; 8]));

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(27).wrapping_add(h2).wrapping_mul(5).wrapping_add(0x52dc_e729);
        h2 ^= mix_k2(k2);
        h2 = h2.rotate_left(31).wrapping_add(h1).wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let signed = |i: usize| tail[i] as i8 as i64 as u64;

    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for i in (8..tail.len()).rev() {
        k2 ^= signed(i) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    for i in (0..tail.len().min(8)).rev() {
        k1 ^= signed(i) << (i * 8);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);

    match h1 as i64 {
        i64::MIN => i64::MAX,
        token => token,
    }
}

/// Sorted token ring with SimpleStrategy-style replica placement.
///
/// The replicas of a token are the owner of the first ring position at or
/// after it, followed by the next distinct nodes walking clockwise.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    ring: Vec<(i64, SocketAddr)>,
    replication_factor: usize,
}

impl TokenMap {
    pub fn new<'a, I>(nodes: I, replication_factor: usize) -> Self
    where
        I: IntoIterator<Item = (SocketAddr, &'a [i64])>,
    {
        let mut ring: Vec<(i64, SocketAddr)> = nodes
            .into_iter()
            .flat_map(|(addr, tokens)| tokens.iter().map(move |token| (*token, addr)))
            .collect();
        ring.sort_unstable();
        ring.dedup_by_key(|(token, _)| *token);

        Self {
            ring,
            replication_factor: replication_factor.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Replicas of `token` in replication order.
    pub fn replicas(&self, token: i64) -> Vec<SocketAddr> {
        if self.ring.is_empty() {
            return Vec::new();
        }

        let start = self.ring.partition_point(|(t, _)| *t < token);
        let mut seen = HashSet::new();
        let mut replicas = Vec::with_capacity(self.replication_factor);

        for offset in 0..self.ring.len() {
            let (_, addr) = self.ring[(start + offset) % self.ring.len()];
            if seen.insert(addr) {
                replicas.push(addr);
                if replicas.len() == self.replication_factor {
                    break;
                }
            }
        }
        replicas
    }

    pub fn replicas_for_key(&self, routing_key: &[u8]) -> Vec<SocketAddr> {
        self.replicas(murmur3_token(routing_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_murmur3_is_deterministic_and_spread() {
        assert_eq!(murmur3_token(b""), 0);
        assert_eq!(murmur3_token(b"user-42"), murmur3_token(b"user-42"));

        let tokens: HashSet<i64> = (0..1000).map(|i| murmur3_token(format!("key-{}", i).as_bytes())).collect();
        assert_eq!(tokens.len(), 1000);

        let negative = tokens.iter().filter(|t| **t < 0).count();
        assert!(negative > 400 && negative < 600);
    }

    #[test]
    fn test_murmur3_uses_every_tail_length() {
        let key = b"0123456789abcdefghijklmnopqrstu";
        let tokens: HashSet<i64> = (0..=key.len()).map(|n| murmur3_token(&key[..n])).collect();
        assert_eq!(tokens.len(), key.len() + 1);
    }

    #[test]
    fn test_replicas_walk_the_ring() {
        let tokens = [vec![-100, 100], vec![0], vec![200]];
        let map = TokenMap::new(
            [
                (addr(1), tokens[0].as_slice()),
                (addr(2), tokens[1].as_slice()),
                (addr(3), tokens[2].as_slice()),
            ],
            2,
        );

        assert_eq!(map.replicas(-150), vec![addr(1), addr(2)]);
        assert_eq!(map.replicas(-100), vec![addr(1), addr(2)]);
        assert_eq!(map.replicas(50), vec![addr(1), addr(3)]);
        assert_eq!(map.replicas(150), vec![addr(3), addr(1)]);
        // past the last token wraps to the first
        assert_eq!(map.replicas(500), vec![addr(1), addr(2)]);
    }

    #[test]
    fn test_replication_factor_larger_than_cluster() {
        let tokens = [vec![0], vec![10]];
        let map = TokenMap::new([(addr(1), tokens[0].as_slice()), (addr(2), tokens[1].as_slice())], 5);
        assert_eq!(map.replicas(5).len(), 2);
    }

    #[test]
    fn test_empty_map() {
        let map = TokenMap::default();
        assert!(map.is_empty());
        assert!(map.replicas_for_key(b"key").is_empty());
    }
}
