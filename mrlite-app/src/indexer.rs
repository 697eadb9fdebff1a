use std::collections::BTreeSet;

use mrlite::KeyValue;

/// Inverted index: one `(word, document)` pair per distinct word per
/// document, so the reduce side sees each document at most once per word.
pub fn map(filename: &str, contents: &str) -> Vec<KeyValue> {
    let words: BTreeSet<&str> = contents
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .collect();
    words
        .into_iter()
        .map(|word| KeyValue {
            key: word.to_string(),
            value: filename.to_string(),
        })
        .collect()
}

/// `"<count> <doc1>,<doc2>,..."` with documents in ascending order.
pub fn reduce(_key: &str, values: &[String]) -> String {
    let mut documents = values.to_vec();
    documents.sort();
    format!("{} {}", documents.len(), documents.join(","))
}
