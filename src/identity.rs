use sha1::{Digest, Sha1};

/// Returns the sha1 hex digest of `src`.
///
/// Plan nodes address repositories, analyzers and pipelines by these IDs, so
/// recomputing from the same configuration always yields the same
/// filesystem layout.
pub fn hash_id(src: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(src.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_id_known_values() {
        assert_eq!(hash_id(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            hash_id("hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(hash_id("size"), "89368e1d68015693ab48ee189d0632cb5d6edfb3");
    }

    #[test]
    fn test_hash_id_is_stable() {
        assert_eq!(hash_id("/mount/repo/github.com/a/b"), hash_id("/mount/repo/github.com/a/b"));
        assert_ne!(hash_id("/mount/repo/a"), hash_id("/mount/repo/b"));
    }
}
