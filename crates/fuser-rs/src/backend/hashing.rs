use super::spec::Program;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Stable fingerprint of a program's structure, used as a compiled-plan cache key.
///
/// Hashes the canonical JSON encoding so two programs built independently by the same graph
/// definition share a key. Constants are hashed by value.
pub fn program_fingerprint(program: &Program) -> u64 {
    match serde_json::to_vec(program) {
        Ok(bytes) => fnv1a_hash(&bytes),
        Err(_) => fnv1a_hash(program.to_text().as_bytes()),
    }
}
