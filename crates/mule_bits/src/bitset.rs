use base64::{engine::general_purpose::STANDARD, Engine};

/// Maximum number of raw bytes encoded into a single base64 chunk.
///
/// 6000 source bytes encode to 8000 base64 characters, which stays under the
/// 8192-character envelope limit of the carrier system.
pub const MAX_CHUNK_BYTES: usize = 6000;

/// A fixed-size array of bits backed by a byte vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: Vec<u8>,
}

impl BitSet {
    /// Create a bitset capable of storing `size` bits, all initially zero.
    pub fn new(size: usize) -> Self {
        Self {
            bits: vec![0; size.div_ceil(8)],
        }
    }

    /// Set the `n`th bit.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    pub fn set(&mut self, n: usize) {
        self.bits[n / 8] |= 1 << (n % 8);
    }

    /// Return the value of the `n`th bit.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    pub fn get(&self, n: usize) -> bool {
        (self.bits[n / 8] >> (n % 8)) & 1 == 1
    }

    /// The raw backing bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Serialize the bitset as an ordered sequence of base64 chunks, each
    /// encoding at most [`MAX_CHUNK_BYTES`] source bytes.
    pub fn to_base64_chunks(&self) -> Vec<String> {
        self.bits
            .chunks(MAX_CHUNK_BYTES)
            .map(|chunk| STANDARD.encode(chunk))
            .collect()
    }

    /// Reassemble a bitset from chunks produced by [`Self::to_base64_chunks`].
    ///
    /// Chunks are decoded and concatenated in order.
    pub fn from_base64_chunks<I, S>(chunks: I) -> Result<Self, ChunkDecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bits = Vec::new();
        for chunk in chunks {
            bits.extend(STANDARD.decode(chunk.as_ref())?);
        }
        Ok(Self { bits })
    }
}

/// Error returned when reassembling a bitset from base64 chunks fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid base64 chunk")]
pub struct ChunkDecodeError(#[from] base64::DecodeError);
