//! Bit-level primitives for the mule cache: a fixed-size [`BitSet`] and a
//! two-hash [`BloomFilter`] over it.
//!
//! The Bloom filter is how a cache summarizes its contents for peers: the
//! filter over all cached logical file names is serialized as base64 and
//! shipped through a carrier that limits individual values to 8192
//! characters, so serialization is chunked (see
//! [`BitSet::to_base64_chunks`]).

pub use bitset::{BitSet, ChunkDecodeError, MAX_CHUNK_BYTES};
pub use bloom::BloomFilter;

mod bitset;
mod bloom;
