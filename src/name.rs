use regex::Regex;
use sha2::{Digest, Sha256};

/// Number of hex characters of the SHA-256 digest kept in the PV name. 16 hex chars (64 bits)
/// is far below the chance of collision for the number of volumes a single node ever hosts.
const FINGERPRINT_LEN: usize = 16;

/// Computes the deterministic PV name `local-pv-<fingerprint>` for a `(node identifier, host
/// path)` pair. Pure function: re-scanning the same medium, or recomputing after the PV was
/// deleted, always yields the same name, which is what makes create and delete idempotent.
pub fn pv_name(node_identifier: &str, host_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_identifier.as_bytes());
    hasher.update(b"|");
    hasher.update(host_path.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("local-pv-{}", &hex[..FINGERPRINT_LEN])
}

/// Translates a single shell-style glob (`*`, `?`, `[abc]`) into an anchored regex. Only the
/// small subset of glob syntax the spec's `namePattern` needs is supported; anything else is
/// escaped literally.
fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for c2 in chars.by_ref() {
                    out.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).expect("glob-derived regex is always valid")
}

/// Returns true if `file_name` matches any of the comma-separated glob patterns configured for
/// a storage class.
pub fn matches_any_pattern(file_name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| glob_to_regex(p).is_match(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_deterministic() {
        let a = pv_name("n1", "/mnt/fast/vol1");
        let b = pv_name("n1", "/mnt/fast/vol1");
        assert_eq!(a, b);
        assert!(a.starts_with("local-pv-"));
    }

    #[test]
    fn name_differs_by_node() {
        let a = pv_name("n1", "/mnt/fast/vol1");
        let b = pv_name("n2", "/mnt/fast/vol1");
        assert_ne!(a, b);
    }

    #[test]
    fn name_differs_by_path() {
        let a = pv_name("n1", "/mnt/fast/vol1");
        let b = pv_name("n1", "/mnt/fast/vol2");
        assert_ne!(a, b);
    }

    #[test]
    fn wildcard_matches_everything() {
        assert!(matches_any_pattern("anything", &["*".to_string()]));
    }

    #[test]
    fn prefix_glob_matches_prefix_only() {
        let patterns = vec!["vol-*".to_string()];
        assert!(matches_any_pattern("vol-1", &patterns));
        assert!(!matches_any_pattern("data-1", &patterns));
    }

    #[test]
    fn multiple_patterns_are_ored() {
        let patterns = vec!["vol-*".to_string(), "data-*".to_string()];
        assert!(matches_any_pattern("data-7", &patterns));
        assert!(matches_any_pattern("vol-7", &patterns));
        assert!(!matches_any_pattern("other-7", &patterns));
    }
}
