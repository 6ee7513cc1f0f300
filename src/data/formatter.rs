//! Record formatter: conversation → supervised token sequences
//!
//! The prompt part of every example is masked out of the loss with
//! [`IGNORE_INDEX`]; only the assistant answer and the trailing eos token are
//! supervised.

use super::record::{ConversationRecord, TokenizedExample};
use super::IGNORE_INDEX;
use crate::tokenizer::{human_assistant_prompt, TextTokenizer};
use crate::{Error, Result};

/// How `max_seq_length` bounds an example
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthPolicy {
    /// Prompt and answer are each capped; the concatenation may exceed the cap
    #[default]
    Lenient,
    /// The concatenated sequences are additionally cut to the cap
    Strict,
}

impl LengthPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            LengthPolicy::Strict
        } else {
            LengthPolicy::Lenient
        }
    }
}

/// Tokenize one record. `index` is only used in error messages.
pub fn format_record(
    record: &ConversationRecord,
    index: usize,
    tokenizer: &dyn TextTokenizer,
    max_seq_length: usize,
    policy: LengthPolicy,
) -> Result<TokenizedExample> {
    let turn = record.first_turn().ok_or_else(|| Error::MalformedRecord {
        index,
        reason: "conversation is empty".to_string(),
    })?;

    let eos = tokenizer
        .eos_token_id()
        .ok_or_else(|| Error::Tokenizer("tokenizer has no eos token".to_string()))?;

    let prompt = human_assistant_prompt(turn.human.trim());
    let mut prompt_ids = tokenizer.encode(&prompt, false)?;
    prompt_ids.truncate(max_seq_length);
    let mut answer_ids = tokenizer.encode(turn.assistant.trim(), false)?;
    answer_ids.truncate(max_seq_length);

    let total = prompt_ids.len() + answer_ids.len() + 1;

    let mut input_ids = Vec::with_capacity(total);
    input_ids.extend_from_slice(&prompt_ids);
    input_ids.extend_from_slice(&answer_ids);
    input_ids.push(eos);

    let mut labels = Vec::with_capacity(total);
    labels.resize(prompt_ids.len(), IGNORE_INDEX);
    labels.extend(answer_ids.iter().map(|&id| i64::from(id)));
    labels.push(i64::from(eos));

    let mut attention_mask = vec![1u8; total];

    if policy == LengthPolicy::Strict {
        input_ids.truncate(max_seq_length);
        attention_mask.truncate(max_seq_length);
        labels.truncate(max_seq_length);
    }

    Ok(TokenizedExample {
        input_ids,
        attention_mask,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::record::Turn;
    use proptest::prelude::*;

    /// Maps every whitespace-separated word to its length + 10; eos is 2
    struct WordLenTokenizer;

    impl TextTokenizer for WordLenTokenizer {
        fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
            Ok(text.split_whitespace().map(|w| w.len() as u32 + 10).collect())
        }

        fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            Ok(ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" "))
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(2)
        }

        fn vocab_size(&self) -> usize {
            128
        }
    }

    struct NoEosTokenizer;

    impl TextTokenizer for NoEosTokenizer {
        fn encode(&self, _text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
            Ok(vec![1])
        }

        fn decode(&self, _ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            Ok(String::new())
        }

        fn eos_token_id(&self) -> Option<u32> {
            None
        }

        fn vocab_size(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_prompt_is_masked() {
        let rec = ConversationRecord::single("  what is it ", " a b ");
        let ex = format_record(&rec, 0, &WordLenTokenizer, 1024, LengthPolicy::Lenient).unwrap();
        // "Human: what is it\n\nAssistant: " -> 5 words
        assert_eq!(ex.input_ids, vec![16, 14, 12, 12, 20, 11, 11, 2]);
        assert_eq!(ex.labels, vec![-100, -100, -100, -100, -100, 11, 11, 2]);
        assert_eq!(ex.attention_mask, vec![1; 8]);
        assert_eq!(ex.num_supervised(), 3);
    }

    #[test]
    fn test_each_part_capped_lenient() {
        let rec = ConversationRecord::single("a b c d e f", "x y z w");
        let ex = format_record(&rec, 0, &WordLenTokenizer, 3, LengthPolicy::Lenient).unwrap();
        assert_eq!(ex.len(), 3 + 3 + 1);
        assert_eq!(&ex.labels[..3], &[-100, -100, -100]);
    }

    #[test]
    fn test_strict_caps_total() {
        let rec = ConversationRecord::single("a b c d e f", "x y z w");
        let ex = format_record(&rec, 0, &WordLenTokenizer, 3, LengthPolicy::Strict).unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.labels.len(), 3);
        assert_eq!(ex.attention_mask.len(), 3);
    }

    #[test]
    fn test_empty_answer_supervises_eos_only() {
        let rec = ConversationRecord::single("q", "   ");
        let ex = format_record(&rec, 0, &WordLenTokenizer, 16, LengthPolicy::Lenient).unwrap();
        assert_eq!(ex.num_supervised(), 1);
        assert_eq!(*ex.labels.last().unwrap(), 2);
    }

    #[test]
    fn test_empty_conversation_is_malformed() {
        let rec = ConversationRecord {
            conversation: vec![],
        };
        let err = format_record(&rec, 7, &WordLenTokenizer, 16, LengthPolicy::Lenient).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { index: 7, .. }));
    }

    #[test]
    fn test_missing_eos_is_tokenizer_error() {
        let rec = ConversationRecord::single("q", "a");
        let err = format_record(&rec, 0, &NoEosTokenizer, 16, LengthPolicy::Lenient).unwrap_err();
        assert!(matches!(err, Error::Tokenizer(_)));
    }

    #[test]
    fn test_only_first_turn_used() {
        let rec = ConversationRecord {
            conversation: vec![
                Turn {
                    human: "a".into(),
                    assistant: "b".into(),
                },
                Turn {
                    human: "ccc ccc".into(),
                    assistant: "ddd ddd ddd".into(),
                },
            ],
        };
        let ex = format_record(&rec, 0, &WordLenTokenizer, 64, LengthPolicy::Lenient).unwrap();
        // Human: a Assistant: + b + eos
        assert_eq!(ex.len(), 3 + 1 + 1);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        #[test]
        fn prop_sequences_aligned(
            human in "[a-z ]{0,60}",
            answer in "[a-z ]{0,60}",
            max_len in 1usize..32,
            strict in proptest::bool::ANY,
        ) {
            let rec = ConversationRecord::single(human.clone(), answer.clone());
            let policy = LengthPolicy::from_strict(strict);
            let ex = format_record(&rec, 0, &WordLenTokenizer, max_len, policy).unwrap();

            prop_assert_eq!(ex.input_ids.len(), ex.attention_mask.len());
            prop_assert_eq!(ex.input_ids.len(), ex.labels.len());

            let prompt_len = WordLenTokenizer
                .encode(&human_assistant_prompt(human.trim()), false)
                .unwrap()
                .len()
                .min(max_len);
            let answer_len = answer.split_whitespace().count().min(max_len);

            if strict {
                prop_assert!(ex.len() <= max_len);
            } else {
                prop_assert_eq!(ex.len(), prompt_len + answer_len + 1);
                prop_assert_eq!(*ex.labels.last().unwrap(), 2);
                prop_assert_eq!(*ex.input_ids.last().unwrap(), 2);
            }

            for (i, &label) in ex.labels.iter().enumerate() {
                if i < prompt_len {
                    prop_assert_eq!(label, IGNORE_INDEX);
                } else {
                    prop_assert_eq!(label, i64::from(ex.input_ids[i]));
                }
            }
        }
    }
}
