pub mod compliance;
pub mod jurisdiction;
pub mod workflow;

use sha2::{Digest, Sha256};

const SEMANTIC_ID_HEX_LEN: usize = 24;

/// Derives a stable identifier from the parts of a semantic key.
///
/// Parts are length-prefixed before hashing so `("ab", "c")` and `("a", "bc")`
/// never collide.
pub(crate) fn semantic_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{prefix}_{}", &digest[..SEMANTIC_ID_HEX_LEN])
}

#[cfg(test)]
mod tests {
    use super::semantic_id;

    #[test]
    fn semantic_id_is_stable_and_prefixed() {
        let first = semantic_id("evt", &["ent-1", "wy_annual_report", "2025", "0"]);
        let second = semantic_id("evt", &["ent-1", "wy_annual_report", "2025", "0"]);

        assert_eq!(first, second);
        assert!(first.starts_with("evt_"));
        assert_eq!(first.len(), "evt_".len() + 24);
    }

    #[test]
    fn semantic_id_separates_shifted_boundaries() {
        assert_ne!(semantic_id("evt", &["ab", "c"]), semantic_id("evt", &["a", "bc"]));
    }
}
