//! Deterministic sharding of arbitrary strings into `[0, total_shards)`.
//!
//! The same input always lands in the same shard, in every process and every SDK language, which
//! is what makes assignments consistent without any session state.

pub trait Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default (and only production) sharder.
///
/// Takes the first 4 bytes (8 hex characters) of the MD5 digest as a big-endian unsigned integer
/// and reduces it modulo `total_shards`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        get_md5_shard(input, total_shards)
    }
}

/// Free-function form of [`Md5Sharder`].
pub fn get_md5_shard(input: &str, total_shards: u64) -> u64 {
    let hash = md5::compute(input);
    let int_from_hash = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    u64::from(int_from_hash) % total_shards
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}
