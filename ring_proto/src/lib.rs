pub mod ring {
    tonic::include_proto!("ring");
}

/// Hash an address or client key onto the identifier ring.
///
/// Identifiers live modulo 2^64: the SHA-1 digest is truncated to its
/// leading eight bytes, big-endian.
pub fn hash_key(data: &str) -> u64 {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}
