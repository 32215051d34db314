//! Key-to-path sharding.
//!
//! Content-addressed keys are uniformly distributed, so slicing a few bytes
//! off the front is enough to bound per-directory file counts while keeping
//! neighbouring keys adjacent on disk.

/// Width of one directory segment, in hex characters.
const SEGMENT_WIDTH: usize = 2;
/// Nesting depth of the fan-out.
const SEGMENT_DEPTH: usize = 3;

/// Directory segments a key is filed under.
///
/// The algorithm tag (everything up to and including the first `-`) does not
/// participate in the fan-out; segments are cut from the leading hex
/// characters of the remainder. The file itself is always named by the full
/// key, so the mapping stays injective even for keys too short to fill every
/// segment.
pub fn shard(key: &str) -> Vec<&str> {
    if !key.is_ascii() {
        return Vec::new();
    }
    let hex = match key.split_once('-') {
        Some((_, rest)) => rest,
        None => key,
    };

    let mut segments = Vec::with_capacity(SEGMENT_DEPTH);
    let mut rest = hex;
    while segments.len() < SEGMENT_DEPTH && rest.len() >= SEGMENT_WIDTH {
        let (segment, tail) = rest.split_at(SEGMENT_WIDTH);
        segments.push(segment);
        rest = tail;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_skips_algorithm_tag() {
        assert_eq!(shard("sha512-abcdef012345"), vec!["ab", "cd", "ef"]);
    }

    #[test]
    fn test_shard_bare_hex_key() {
        assert_eq!(shard("0123456789"), vec!["01", "23", "45"]);
    }

    #[test]
    fn test_shard_short_key() {
        assert_eq!(shard("abcd"), vec!["ab", "cd"]);
        assert_eq!(shard("a"), Vec::<&str>::new());
    }

    #[test]
    fn test_shard_is_deterministic() {
        let key = "sha512-00ff17";
        assert_eq!(shard(key), shard(key));
    }
}
