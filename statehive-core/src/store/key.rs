//! Key validation

/// Longest accepted key
pub const MAX_KEY_LEN: usize = 256;

/// `true` when `key` matches `[A-Za-z0-9_.-]{1,256}`
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}
