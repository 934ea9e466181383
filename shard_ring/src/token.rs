//! Ring token derivation.
//!
//! Tokens are 32-bit FNV-1a digests. The hash is part of the storage
//! contract: changing it reassigns every series to a different shard, so it
//! must not be swapped for another hash or width.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 16777619;

/// An incremental 32-bit FNV-1a hasher.
#[derive(Debug, Clone)]
pub struct Fnv1a(u32);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= u32::from(b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn finish(&self) -> u32 {
        self.0
    }
}

/// The ring token locating a series: FNV-1a over the tenant id followed by
/// the canonical label string.
///
/// Deterministic: equal (tenant, labels) inputs always map to the same
/// token.
pub fn token_for(tenant_id: &str, labels: &str) -> u32 {
    let mut h = Fnv1a::default();
    h.write(tenant_id.as_bytes());
    h.write(labels.as_bytes());
    h.finish()
}

/// The seed token for slot `n` of a tenant's shuffle shard.
pub(crate) fn shuffle_shard_token(tenant_id: &str, n: u32) -> u32 {
    let mut h = Fnv1a::default();
    h.write(tenant_id.as_bytes());
    h.write(&n.to_le_bytes());
    h.finish()
}
