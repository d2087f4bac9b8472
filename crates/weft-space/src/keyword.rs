//! The keyword overlay: name-keyed publishing with inverted indexes.
//!
//! `publish` stores a value under the hash of its name, then splits the
//! name into keywords and appends `(name, main key)` to the inverted-index
//! record of every keyword, so `search` can find names by any single
//! keyword. Index records are read-modify-written whole, which gives them
//! last-writer-wins semantics under concurrent publishes.

use tracing::debug;

use weft_kademlia::{FindOutcome, Node};
use weft_transport::codec;
use weft_types::Key;

use crate::{Result, SpaceError};

/// Minimum keyword length considered worth indexing.
const MIN_KEYWORD_LEN: usize = 3;

/// An inverted-index record: the names (and their main keys) matching one
/// keyword.
type KeywordIndex = Vec<(String, Key)>;

/// Keyword-indexed publishing over a DHT node.
#[derive(Clone)]
pub struct KeywordOverlay {
    node: Node,
}

impl KeywordOverlay {
    /// Wrap a node.
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    /// The underlying node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Publish `data` under `H(name)` and add the name to the inverted
    /// index of every keyword in it. Returns the main key.
    pub async fn publish(&self, name: &str, data: Vec<u8>) -> Result<Key> {
        let main_key = Key::for_content(name.as_bytes());
        self.node.iterative_store(&main_key, data).await?;

        for keyword in keywords(name) {
            let kw_key = Key::for_content(keyword.as_bytes());
            let mut index: KeywordIndex = match self.node.iterative_find_value(&kw_key).await {
                FindOutcome::Value(found) => match codec::from_slice(&found.value) {
                    Ok(index) => index,
                    Err(e) => {
                        debug!(keyword = %keyword, error = %e, "replacing unreadable keyword index");
                        Vec::new()
                    }
                },
                FindOutcome::Contacts(_) => Vec::new(),
            };
            if !index.iter().any(|(n, _)| n == name) {
                index.push((name.to_string(), main_key));
            }
            let encoded = codec::to_vec(&index).map_err(|e| SpaceError::Codec(e.to_string()))?;
            self.node.iterative_store(&kw_key, encoded).await?;
        }
        Ok(main_key)
    }

    /// The `(name, main key)` pairs published under a keyword.
    pub async fn search(&self, keyword: &str) -> Result<KeywordIndex> {
        let key = Key::for_content(keyword.to_lowercase().as_bytes());
        match self.node.iterative_find_value(&key).await {
            FindOutcome::Value(found) => codec::from_slice(&found.value)
                .map_err(|e| SpaceError::MalformedRecord(format!("keyword index: {e}"))),
            FindOutcome::Contacts(_) => Ok(Vec::new()),
        }
    }
}

/// Split a name into indexable keywords: lowercase, split on `_`, `.`,
/// `/` and whitespace, keep tokens of at least three characters.
fn keywords(name: &str) -> Vec<String> {
    let mut lowered = name.to_lowercase();
    for separator in ['_', '.', '/'] {
        lowered = lowered.replace(separator, " ");
    }
    let mut out: Vec<String> = Vec::new();
    for token in lowered.split_whitespace() {
        if token.len() >= MIN_KEYWORD_LEN && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_split_and_filter() {
        assert_eq!(keywords("foo_bar.baz"), vec!["foo", "bar", "baz"]);
        assert_eq!(keywords("My/Long file_name"), vec!["long", "file", "name"]);
        // Tokens under three characters are dropped.
        assert_eq!(keywords("ab_cde f"), vec!["cde"]);
        assert!(keywords("a_b").is_empty());
    }

    #[test]
    fn test_keywords_deduplicate() {
        assert_eq!(keywords("data_data.data"), vec!["data"]);
    }
}
