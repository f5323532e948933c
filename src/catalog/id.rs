//! Stable model ids for remote files
//!
//! The id is a readable slug of the file stem followed by a short SHA-256
//! digest of the (repo, file) pair. Two different pairs whose slugs
//! sanitize to the same text still get different ids, and repeated
//! searches for the same file always converge on the same id.

use std::path::Path;

use sha2::{Digest, Sha256};

const DIGEST_CHARS: usize = 12;

fn slug(text: &str) -> String {
    let slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Derive the descriptor id for `file_name` inside `repo_id`
pub fn derive_model_id(repo_id: &str, file_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_id.as_bytes());
    // Separator byte keeps ("ab", "c") and ("a", "bc") apart
    hasher.update([0u8]);
    hasher.update(file_name.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let stem = slug(&stem);

    if stem.is_empty() {
        digest[..DIGEST_CHARS].to_string()
    } else {
        format!("{}-{}", stem, &digest[..DIGEST_CHARS])
    }
}

/// On-disk file name for a downloaded remote file
pub fn local_file_name(model_id: &str, remote_file_name: &str) -> String {
    let extension = Path::new(remote_file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "gguf".to_string());
    format!("{}.{}", model_id, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        let a = derive_model_id("bartowski/Llama-3.2-1B-Instruct-GGUF", "Llama-3.2-1B-Instruct-Q4_K_M.gguf");
        let b = derive_model_id("bartowski/Llama-3.2-1B-Instruct-GGUF", "Llama-3.2-1B-Instruct-Q4_K_M.gguf");
        assert_eq!(a, b);
        assert!(a.starts_with("llama-3.2-1b-instruct-q4_k_m-"));
    }

    #[test]
    fn test_sanitized_collisions_are_distinct() {
        // Both slug to "model-a" but differ before sanitization
        let a = derive_model_id("org/repo", "model a.gguf");
        let b = derive_model_id("org/repo", "model+a.gguf");
        assert_ne!(a, b);

        let c = derive_model_id("ab", "c.gguf");
        let d = derive_model_id("a", "bc.gguf");
        assert_ne!(c, d);

        let e = derive_model_id("org/one", "same.gguf");
        let f = derive_model_id("org/two", "same.gguf");
        assert_ne!(e, f);
    }

    #[test]
    fn test_local_file_name_keeps_extension() {
        assert_eq!(local_file_name("abc", "x.gguf"), "abc.gguf");
        assert_eq!(local_file_name("abc", "x.BIN"), "abc.bin");
        assert_eq!(local_file_name("abc", "noext"), "abc.gguf");
    }
}
