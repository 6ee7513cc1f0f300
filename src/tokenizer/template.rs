//! Chat template rendering
//!
//! Turns a list of role/content messages into the exact prompt string a model
//! family expects. The template is picked from the `chat_template` field of
//! `tokenizer_config.json`; models without one are prompted with the same
//! `Human:`/`Assistant:` layout used when fine-tuning.

use serde::{Deserialize, Serialize};

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Supported prompt layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>` (Qwen and most ChatML models)
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>` (Llama 3)
    Llama3,
    /// `Human: ...\n\nAssistant: ` (fine-tuning layout)
    #[default]
    HumanAssistant,
}

impl ChatTemplate {
    /// Pick a layout from the raw `chat_template` source, if any
    pub fn detect(source: Option<&str>) -> Self {
        match source {
            Some(s) if s.contains("<|im_start|>") => ChatTemplate::ChatMl,
            Some(s) if s.contains("<|start_header_id|>") => ChatTemplate::Llama3,
            _ => ChatTemplate::HumanAssistant,
        }
    }

    /// Render messages, optionally appending the assistant generation prompt
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for m in messages {
                    out.push_str("<|im_start|>");
                    out.push_str(role_name(m.role));
                    out.push('\n');
                    out.push_str(&m.content);
                    out.push_str("<|im_end|>\n");
                }
                if add_generation_prompt {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
            ChatTemplate::Llama3 => {
                out.push_str("<|begin_of_text|>");
                for m in messages {
                    out.push_str("<|start_header_id|>");
                    out.push_str(role_name(m.role));
                    out.push_str("<|end_header_id|>\n\n");
                    out.push_str(&m.content);
                    out.push_str("<|eot_id|>");
                }
                if add_generation_prompt {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            ChatTemplate::HumanAssistant => {
                for m in messages {
                    match m.role {
                        Role::System => {
                            out.push_str(&m.content);
                            out.push_str("\n\n");
                        }
                        Role::User => out.push_str(&human_assistant_prompt(&m.content)),
                        Role::Assistant => {
                            // A completed assistant turn closes the previous prompt
                            out.push_str(&m.content);
                            out.push_str("\n\n");
                        }
                    }
                }
                if !add_generation_prompt && out.ends_with("Assistant: ") {
                    out.truncate(out.len() - "Assistant: ".len());
                }
            }
        }
        out
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Prompt layout used for every training example
pub fn human_assistant_prompt(human: &str) -> String {
    format!("Human: {human}\n\nAssistant: ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_chatml() {
        let src = "{% for m in messages %}<|im_start|>{{ m.role }}{% endfor %}";
        assert_eq!(ChatTemplate::detect(Some(src)), ChatTemplate::ChatMl);
    }

    #[test]
    fn test_detect_llama3() {
        let src = "<|start_header_id|>{{ role }}<|end_header_id|>";
        assert_eq!(ChatTemplate::detect(Some(src)), ChatTemplate::Llama3);
    }

    #[test]
    fn test_detect_fallback() {
        assert_eq!(ChatTemplate::detect(None), ChatTemplate::HumanAssistant);
        assert_eq!(
            ChatTemplate::detect(Some("{{ bos_token }}")),
            ChatTemplate::HumanAssistant
        );
    }

    #[test]
    fn test_chatml_generation_prompt() {
        let text = ChatTemplate::ChatMl.render(&[ChatMessage::user("hi")], true);
        assert_eq!(
            text,
            "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_llama3_generation_prompt() {
        let text = ChatTemplate::Llama3.render(&[ChatMessage::user("hi")], true);
        assert!(text.starts_with("<|begin_of_text|><|start_header_id|>user"));
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_human_assistant_matches_training_prompt() {
        let text = ChatTemplate::HumanAssistant.render(&[ChatMessage::user("2+2?")], true);
        assert_eq!(text, human_assistant_prompt("2+2?"));
        assert_eq!(text, "Human: 2+2?\n\nAssistant: ");
    }

    #[test]
    fn test_human_assistant_without_generation_prompt() {
        let text = ChatTemplate::HumanAssistant.render(&[ChatMessage::user("q")], false);
        assert_eq!(text, "Human: q\n\n");
    }

    #[test]
    fn test_human_assistant_multi_turn() {
        let msgs = [
            ChatMessage::system("be brief"),
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
        ];
        let text = ChatTemplate::HumanAssistant.render(&msgs, true);
        assert_eq!(
            text,
            "be brief\n\nHuman: a\n\nAssistant: b\n\nHuman: c\n\nAssistant: "
        );
    }

    #[test]
    fn test_role_serde_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }
}
