use mrlite::KeyValue;

/// Word count: one `(word, "1")` pair per word occurrence. Words are
/// maximal runs of alphabetic characters.
pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .map(|word| KeyValue {
            key: word.to_string(),
            value: "1".to_string(),
        })
        .collect()
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}
