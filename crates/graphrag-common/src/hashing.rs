use sha2::{Digest, Sha256};

/// SHA-256 over the concatenation of all parts, as lowercase hex.
pub fn content_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let h1 = content_hash(["alpha", "beta"]);
        let h2 = content_hash(vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_content_hash_is_plain_concatenation() {
        assert_eq!(content_hash(["ab", "c"]), content_hash(["abc"]));
        assert_ne!(content_hash(["abc"]), content_hash(["abd"]));
    }

    #[test]
    fn test_empty_input_hash() {
        assert_eq!(
            content_hash(Vec::<String>::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
