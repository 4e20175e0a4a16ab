//! Synthetic JPEG generation and chunking. No real camera is involved: the
//! simulator only needs bytes that satisfy the finalizer's framing check
//! (SOI/EOI markers) and can be split into fixed-size chunks, the same way
//! real firmware fabricates plausible sensor readings instead of reading
//! actual hardware.

use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Builds a deterministic-length, SOI/EOI-framed blob of filler bytes. Real
/// JPEG structure is irrelevant to the ingest pipeline under test — only the
/// first/last two bytes and the declared size matter.
pub fn synthetic_jpeg(size: usize, seed: u64) -> Vec<u8> {
    let size = size.max(SOI.len() + EOI.len());
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&SOI);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let filler_len = size - SOI.len() - EOI.len();
    buf.extend((0..filler_len).map(|_| rng.gen::<u8>()));
    buf.extend_from_slice(&EOI);
    buf
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Splits `bytes` into fixed-size (base64-encoded) chunks, indexed from 0.
pub fn chunk_and_encode(bytes: &[u8], max_chunk_size: usize) -> Vec<String> {
    use base64::Engine;
    bytes
        .chunks(max_chunk_size.max(1))
        .map(|c| base64::engine::general_purpose::STANDARD.encode(c))
        .collect()
}
