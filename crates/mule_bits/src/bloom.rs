use crate::bitset::{BitSet, ChunkDecodeError};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the UTF-8 bytes of `s`.
///
/// Both filter hashes must be stable across runs and across nodes: peers
/// exchange filters, so a randomized or process-seeded hash would break
/// membership queries on the receiving side.
fn fnv1a(s: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The Peter Weinberger shift-xor string hash.
fn hashpjw(s: &str) -> u32 {
    let mut val: u32 = 0;
    for byte in s.bytes() {
        val = (val << 4).wrapping_add(u32::from(byte));
        let tmp = val & 0xf000_0000;
        if tmp != 0 {
            val ^= tmp >> 24;
            val ^= tmp;
        }
    }
    val
}

/// An `m`-bit Bloom filter using `k` hash indices per value.
///
/// Indices are derived from two independent hashes combined as
/// `(h1 + i * h2) mod m` for `i = 1..=k`. Membership queries never report a
/// false negative; false positives occur at the usual Bloom filter rate.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    m: usize,
    k: usize,
    bits: BitSet,
}

impl BloomFilter {
    /// Instantiate an `m`-bit Bloom filter using `k` hash indices per value.
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            m,
            k,
            bits: BitSet::new(m),
        }
    }

    fn indices(&self, s: &str) -> impl Iterator<Item = usize> + '_ {
        let h1 = fnv1a(s);
        let h2 = u64::from(hashpjw(s));
        let m = self.m as u64;
        (1..=self.k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    /// Insert `s` into the filter.
    pub fn insert(&mut self, s: &str) {
        let indices: Vec<_> = self.indices(s).collect();
        for i in indices {
            self.bits.set(i);
        }
    }

    /// Return true if `s` may be in the filter, false if it definitely is not.
    pub fn contains(&self, s: &str) -> bool {
        self.indices(s).all(|i| self.bits.get(i))
    }

    /// Serialize the filter's bit array as ordered base64 chunks.
    pub fn to_base64_chunks(&self) -> Vec<String> {
        self.bits.to_base64_chunks()
    }

    /// Rebuild an `m`/`k` filter from chunks produced by
    /// [`Self::to_base64_chunks`].
    pub fn from_base64_chunks<I, S>(m: usize, k: usize, chunks: I) -> Result<Self, ChunkDecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            m,
            k,
            bits: BitSet::from_base64_chunks(chunks)?,
        })
    }
}
