//! On-disk checksums.
//!
//! Every record carries a raw CRC-32C over its encoded prefix, seeded with
//! `!1` and with no final xor. `crc32c_append` keeps its running value
//! pre/post-inverted, so the raw form is recovered by inverting around the
//! call.

pub const CHECKSUM_SEED: u32 = !1u32;

/// Checksum of encoded record bytes up to (not including) the checksum
/// field.
pub fn wire_checksum(bytes: &[u8]) -> u32 {
    !crc32c::crc32c_append(!CHECKSUM_SEED, bytes)
}
