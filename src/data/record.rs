//! Conversation records as stored in the training JSONL file

use serde::{Deserialize, Serialize};

/// One human/assistant exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub human: String,
    pub assistant: String,
}

/// A training line: `{"conversation": [{"human": ..., "assistant": ...}]}`
///
/// Only the first turn is used for supervision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation: Vec<Turn>,
}

impl ConversationRecord {
    pub fn single(human: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            conversation: vec![Turn {
                human: human.into(),
                assistant: assistant.into(),
            }],
        }
    }

    pub fn first_turn(&self) -> Option<&Turn> {
        self.conversation.first()
    }
}

/// A record after tokenization; the three sequences always have equal length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Positions that contribute to the loss
    pub fn num_supervised(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&l| l != super::IGNORE_INDEX)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_line() {
        let line = r#"{"conversation": [{"human": "q", "assistant": "a"}], "category": "x"}"#;
        let rec: ConversationRecord = serde_json::from_str(line).unwrap();
        assert_eq!(rec, ConversationRecord::single("q", "a"));
    }

    #[test]
    fn test_missing_field_is_error() {
        let line = r#"{"conversation": [{"human": "q"}]}"#;
        assert!(serde_json::from_str::<ConversationRecord>(line).is_err());
    }

    #[test]
    fn test_first_turn_of_empty_conversation() {
        let rec = ConversationRecord {
            conversation: vec![],
        };
        assert!(rec.first_turn().is_none());
    }
}
