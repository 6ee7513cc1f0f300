//! Padding collator for variable-length examples

use ndarray::Array2;

use super::record::TokenizedExample;
use super::IGNORE_INDEX;

/// A padded mini-batch, `[batch, seq_len]`
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub input_ids: Array2<u32>,
    pub attention_mask: Array2<u8>,
    pub labels: Array2<i64>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }

    /// Number of positions that are both attended and supervised
    pub fn num_supervised(&self) -> usize {
        self.labels
            .iter()
            .zip(self.attention_mask.iter())
            .filter(|&(&l, &m)| l != IGNORE_INDEX && m != 0)
            .count()
    }
}

/// Pads every example of a batch to the longest one
#[derive(Debug, Clone, Copy)]
pub struct PaddingCollator {
    pub pad_token_id: u32,
}

impl PaddingCollator {
    pub fn new(pad_token_id: u32) -> Self {
        Self { pad_token_id }
    }

    pub fn collate(&self, examples: &[&TokenizedExample]) -> Batch {
        let rows = examples.len();
        let cols = examples.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut input_ids = Array2::from_elem((rows, cols), self.pad_token_id);
        let mut attention_mask = Array2::<u8>::zeros((rows, cols));
        let mut labels = Array2::from_elem((rows, cols), IGNORE_INDEX);

        for (r, ex) in examples.iter().enumerate() {
            for c in 0..ex.len() {
                input_ids[[r, c]] = ex.input_ids[c];
                attention_mask[[r, c]] = ex.attention_mask[c];
                labels[[r, c]] = ex.labels[c];
            }
        }

        Batch {
            input_ids,
            attention_mask,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn example(ids: &[u32], prompt: usize) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids
                .iter()
                .enumerate()
                .map(|(i, &id)| if i < prompt { IGNORE_INDEX } else { id as i64 })
                .collect(),
        }
    }

    #[test]
    fn test_pads_to_longest() {
        let a = example(&[5, 6, 7], 1);
        let b = example(&[8], 0);
        let batch = PaddingCollator::new(0).collate(&[&a, &b]);

        assert_eq!(batch.input_ids, array![[5, 6, 7], [8, 0, 0]]);
        assert_eq!(batch.attention_mask, array![[1, 1, 1], [1, 0, 0]]);
        assert_eq!(batch.labels, array![[-100, 6, 7], [8, -100, -100]]);
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 3);
        assert_eq!(batch.num_supervised(), 3);
    }

    #[test]
    fn test_empty_batch() {
        let batch = PaddingCollator::new(1).collate(&[]);
        assert_eq!(batch.batch_size(), 0);
        assert_eq!(batch.seq_len(), 0);
    }
}
