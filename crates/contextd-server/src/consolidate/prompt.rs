// crates/contextd-server/src/consolidate/prompt.rs
// Merge prompt construction for the consolidator

use crate::store::Record;

/// Build the fusion prompt for one cluster. The model must answer with a
/// single JSON object; anything else fails parsing and skips the cluster.
pub fn merge_prompt(cluster: &[Record]) -> String {
    let mut prompt = String::with_capacity(512 + cluster.len() * 256);
    prompt.push_str(
        "You are consolidating near-duplicate engineering memories into one.\n\
         Synthesize a single memory that preserves every distinct fact below,\n\
         attributing nothing to any individual source.\n\nSources:\n",
    );

    for (i, record) in cluster.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, record.content));
        if let Some(description) = record.meta_str("description") {
            if !description.is_empty() {
                prompt.push_str(&format!("   detail: {}\n", description));
            }
        }
        if let Some(tags) = record.meta_str("tags") {
            if !tags.is_empty() {
                prompt.push_str(&format!("   tags: {}\n", tags));
            }
        }
    }

    prompt.push_str(
        "\nAnswer with exactly one JSON object and nothing else:\n\
         {\"summary\": \"<one-sentence synthesis>\", \
         \"description\": \"<the merged details>\", \
         \"tags\": [\"<tag>\", ...]}\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Metadata;

    #[test]
    fn test_prompt_lists_all_sources() {
        let mut metadata = Metadata::new();
        metadata.insert("tags".into(), "go,net".into());
        let records = vec![
            Record::new(vec![1.0], "first memory".into(), metadata),
            Record::new(vec![1.0], "second memory".into(), Metadata::new()),
        ];

        let prompt = merge_prompt(&records);
        assert!(prompt.contains("1. first memory"));
        assert!(prompt.contains("2. second memory"));
        assert!(prompt.contains("tags: go,net"));
        assert!(prompt.contains("JSON object"));
    }
}
