//! JSONL loading and the tokenized training set

use std::fs;
use std::path::Path;

use rayon::prelude::*;

use super::formatter::{format_record, LengthPolicy};
use super::record::{ConversationRecord, TokenizedExample};
use crate::tokenizer::TextTokenizer;
use crate::{Error, Result};

/// Read one [`ConversationRecord`] per non-blank line
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<ConversationRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;

    let mut records = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ConversationRecord = serde_json::from_str(line).map_err(|e| {
            Error::Serialization(format!("{}:{}: {e}", path.display(), line_num + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Formatted examples; the source columns are not kept
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    examples: Vec<TokenizedExample>,
}

impl TokenizedDataset {
    pub fn new(examples: Vec<TokenizedExample>) -> Self {
        Self { examples }
    }

    /// Format every record, aborting on the first failure.
    ///
    /// `num_workers == 0` formats on the calling thread, otherwise a dedicated
    /// rayon pool of that many threads is used.
    pub fn from_records(
        records: &[ConversationRecord],
        tokenizer: &dyn TextTokenizer,
        max_seq_length: usize,
        policy: LengthPolicy,
        num_workers: usize,
    ) -> Result<Self> {
        let format = |(index, record): (usize, &ConversationRecord)| {
            format_record(record, index, tokenizer, max_seq_length, policy)
        };

        let examples = if num_workers == 0 {
            records.iter().enumerate().map(format).collect::<Result<Vec<_>>>()?
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .build()
                .map_err(|e| Error::InvalidParameter(format!("worker pool: {e}")))?;
            pool.install(|| {
                records
                    .par_iter()
                    .enumerate()
                    .map(format)
                    .collect::<Result<Vec<_>>>()
            })?
        };

        Ok(Self { examples })
    }

    /// Round-robin partition: example `i` belongs to rank `i % world_size`
    pub fn shard(&self, rank: usize, world_size: usize) -> Self {
        if world_size <= 1 {
            return self.clone();
        }
        let examples = self
            .examples
            .iter()
            .enumerate()
            .filter(|(i, _)| i % world_size == rank)
            .map(|(_, ex)| ex.clone())
            .collect();
        Self { examples }
    }

    /// Keep only the first `len` examples
    pub fn truncate(&mut self, len: usize) {
        self.examples.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TokenizedExample> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[TokenizedExample] {
        &self.examples
    }

    /// Total number of tokens across all examples
    pub fn num_tokens(&self) -> usize {
        self.examples.iter().map(TokenizedExample::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct CharTokenizer;

    impl TextTokenizer for CharTokenizer {
        fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            Ok(ids.iter().filter_map(|&i| char::from_u32(i)).collect())
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(0)
        }

        fn vocab_size(&self) -> usize {
            256
        }
    }

    fn records(n: usize) -> Vec<ConversationRecord> {
        (0..n)
            .map(|i| ConversationRecord::single(format!("q{i}"), "x".repeat(i + 1)))
            .collect()
    }

    #[test]
    fn test_read_jsonl_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"conversation": [{{"human": "a", "assistant": "b"}}]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"conversation": [{{"human": "c", "assistant": "d"}}]}}"#).unwrap();

        let recs = read_jsonl(file.path()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1], ConversationRecord::single("c", "d"));
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"conversation": []}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = read_jsonl(file.path()).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }

    #[test]
    fn test_read_jsonl_missing_file() {
        let err = read_jsonl("/nonexistent/train.jsonl").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let recs = records(20);
        let seq =
            TokenizedDataset::from_records(&recs, &CharTokenizer, 64, LengthPolicy::Lenient, 0)
                .unwrap();
        let par =
            TokenizedDataset::from_records(&recs, &CharTokenizer, 64, LengthPolicy::Lenient, 3)
                .unwrap();
        assert_eq!(seq.examples(), par.examples());
        assert_eq!(seq.len(), 20);
    }

    #[test]
    fn test_malformed_record_aborts() {
        let mut recs = records(3);
        recs[1].conversation.clear();
        let err =
            TokenizedDataset::from_records(&recs, &CharTokenizer, 64, LengthPolicy::Lenient, 2)
                .unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { index: 1, .. }));
    }

    #[test]
    fn test_shard_round_robin() {
        let ds =
            TokenizedDataset::from_records(&records(5), &CharTokenizer, 64, LengthPolicy::Lenient, 0)
                .unwrap();
        let r0 = ds.shard(0, 2);
        let r1 = ds.shard(1, 2);
        assert_eq!(r0.len(), 3);
        assert_eq!(r1.len(), 2);
        assert_eq!(r1.get(0), ds.get(1));
        assert_eq!(r0.get(2), ds.get(4));
        assert_eq!(ds.shard(0, 1).len(), 5);
    }
}
