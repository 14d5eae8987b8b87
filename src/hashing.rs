//! Block hashing and longest-common-prefix matching (prompt → cache key).
//!
//! A chat prompt is reduced to a single "raw prefix" string, split into
//! whitespace-delimited words, chunked into fixed-size blocks, and each block
//! is hashed independently with SHA-256. Two prompts share a restorable slot
//! when a run of their *leading* block hashes match: the cache is keyed on
//! position, not on content anywhere in the prompt.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::metadata::{MetaRecord, MetadataStore};

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+").expect("static regex is valid"))
}

/// One chat message's role and textual content, the minimal shape hashing
/// needs. Built from the wire request type in `routes::chat`.
#[derive(Debug, Clone)]
pub struct Message<'a> {
    pub content: &'a str,
}

/// Collapse a message list into the raw text that gets hashed: message
/// contents only (roles are not part of the cache key), trimmed and joined
/// with blank lines, mirroring how the backend itself reconstructs a prompt
/// from a chat transcript.
pub fn raw_prefix(messages: &[Message<'_>]) -> String {
    messages
        .iter()
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tokenize text into lowercase `\w+` runs, matching how the backend's own
/// tokenizer is insensitive to case and punctuation-only separators.
pub fn words(text: &str) -> Vec<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Chunk `words` into blocks of `block_size` words and SHA-256 each block's
/// space-joined text, hex-encoded. A trailing partial block is still hashed:
/// callers that want to ignore an incomplete final block should drop it
/// themselves (see `lcp`'s strict comparison below).
pub fn block_hashes(words: &[String], block_size: usize) -> Vec<String> {
    assert!(block_size > 0, "block_size must be non-zero");
    words
        .chunks(block_size)
        .map(|chunk| {
            let mut hasher = Sha256::new();
            hasher.update(chunk.join(" ").as_bytes());
            hex::encode(hasher.finalize())
        })
        .collect()
}

/// The cache key for a `(model_id, raw_prefix)` pair: SHA-256 of
/// `model_id + "\n" + raw_prefix`, hex-encoded. This is the filename stem
/// under which slot snapshots and metadata records are stored.
pub fn prefix_key(model_id: &str, prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(prefix.as_bytes());
    hex::encode(hasher.finalize())
}

/// Longest common prefix, in blocks, between two hash sequences: the number
/// of leading positions at which both sequences agree. Stops at the first
/// mismatch or at the shorter sequence's length.
pub fn lcp(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A metadata record paired with the match quality computed against a query.
#[derive(Debug, Clone)]
pub struct RestoreCandidate {
    pub record: MetaRecord,
    pub matched_blocks: usize,
    pub ratio: f64,
}

/// Scan the metadata store for the best restorable snapshot for `model_id`
/// and `query_blocks` (hashed at `words_per_block`), i.e. the record
/// (same model, same block size) with the highest
/// `lcp / max(1, min(|query_blocks|, |record.block_hashes|))` ratio,
/// provided that ratio clears `threshold`. Normalizing by the shorter of the
/// two lengths keeps a short request from scoring artificially high against
/// a long cached prefix. Ties are broken by the store's scan order, which
/// favors the most recently touched record (see [`MetadataStore::scan_all`]).
///
/// Returns `None` if `query_blocks` is empty, the store has no matching
/// records, or no candidate clears `threshold`.
pub async fn find_best_restore_candidate(
    store: &MetadataStore,
    model_id: &str,
    words_per_block: usize,
    query_blocks: &[String],
    threshold: f64,
) -> std::io::Result<Option<RestoreCandidate>> {
    if query_blocks.is_empty() {
        return Ok(None);
    }

    let mut best: Option<RestoreCandidate> = None;
    for record in store.scan_all().await? {
        if record.model_id != model_id || record.words_per_block != words_per_block {
            continue;
        }
        let matched = lcp(query_blocks, &record.block_hashes);
        if matched == 0 {
            continue;
        }
        let denom = query_blocks.len().min(record.block_hashes.len()).max(1);
        let ratio = matched as f64 / denom as f64;
        if ratio < threshold {
            continue;
        }
        let better = match &best {
            Some(current) => ratio > current.ratio,
            None => true,
        };
        if better {
            best = Some(RestoreCandidate {
                record,
                matched_blocks: matched,
                ratio,
            });
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_prefix_strips_blank_and_joins() {
        let messages = vec![
            Message { content: "  hello  " },
            Message { content: "" },
            Message { content: "world" },
        ];
        assert_eq!(raw_prefix(&messages), "hello\n\nworld");
    }

    #[test]
    fn words_lowercases_and_splits_on_punctuation() {
        assert_eq!(
            words("Hello,  WORLD!\tfoo-bar"),
            vec!["hello", "world", "foo", "bar"]
        );
        assert!(words("   ").is_empty());
    }

    #[test]
    fn block_hashes_groups_by_block_size() {
        let w = words("one two three four five");
        let hashes = block_hashes(&w, 2);
        assert_eq!(hashes.len(), 3);
        // Identical block content hashes identically.
        let hashes2 = block_hashes(&words("one two three four five"), 2);
        assert_eq!(hashes, hashes2);
    }

    #[test]
    fn lcp_stops_at_first_mismatch() {
        let a = vec!["h1".to_string(), "h2".to_string(), "h3".to_string()];
        let b = vec!["h1".to_string(), "h2".to_string(), "hX".to_string()];
        assert_eq!(lcp(&a, &b), 2);
    }

    #[test]
    fn lcp_bounded_by_shorter_sequence() {
        let a = vec!["h1".to_string()];
        let b = vec!["h1".to_string(), "h2".to_string()];
        assert_eq!(lcp(&a, &b), 1);
    }

    #[test]
    fn prefix_key_is_deterministic_and_model_scoped() {
        let k1 = prefix_key("llama.cpp", "hello world");
        let k2 = prefix_key("llama.cpp", "hello world");
        let k3 = prefix_key("other-model", "hello world");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 64);
    }

    #[tokio::test]
    async fn finds_highest_scoring_candidate_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();

        // Weak match: only 1 of 4 blocks in common.
        store
            .write(
                "weak",
                "llama.cpp",
                1,
                vec!["a".into(), "x".into(), "y".into(), "z".into()],
                16,
            )
            .await
            .unwrap();
        // Strong match: all 4 blocks in common.
        store
            .write(
                "strong",
                "llama.cpp",
                1,
                vec!["a".into(), "b".into(), "c".into(), "d".into()],
                16,
            )
            .await
            .unwrap();

        let query = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let best = find_best_restore_candidate(&store, "llama.cpp", 1, &query, 0.5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.record.key, "strong");
        assert_eq!(best.matched_blocks, 4);
        assert!((best.ratio - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn no_candidate_below_threshold_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store
            .write("weak", "llama.cpp", 1, vec!["a".into(), "x".into()], 8)
            .await
            .unwrap();

        let query = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let best = find_best_restore_candidate(&store, "llama.cpp", 1, &query, 0.9)
            .await
            .unwrap();
        assert!(best.is_none());
    }

    #[tokio::test]
    async fn different_model_or_block_size_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store
            .write("other-model", "different-model", 1, vec!["a".into()], 1)
            .await
            .unwrap();
        store
            .write("other-wpb", "llama.cpp", 2, vec!["a".into()], 1)
            .await
            .unwrap();

        let query = vec!["a".to_string()];
        let best = find_best_restore_candidate(&store, "llama.cpp", 1, &query, 0.1)
            .await
            .unwrap();
        assert!(best.is_none());
    }

    #[tokio::test]
    async fn empty_query_blocks_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        let best = find_best_restore_candidate(&store, "llama.cpp", 1, &[], 0.1)
            .await
            .unwrap();
        assert!(best.is_none());
    }
}
