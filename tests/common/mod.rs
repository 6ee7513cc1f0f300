//! Shared fixtures: a word-level tokenizer and a tiny safetensors model

#![allow(dead_code)]

use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use afinar::lora::{LoraConfig, PeftModel};
use afinar::model::{CausalLm, GenerationConfig, ModelConfig, TokenIds, WeightDtype};
use ndarray::Array2;
use serde_json::json;

pub const WORDS: [&str; 14] = [
    "Human:",
    "Assistant:",
    "what",
    "is",
    "the",
    "next",
    "draw",
    "red",
    "blue",
    "one",
    "two",
    "three",
    "hello",
    "world",
];

/// Variables a distributed launcher sets, or `run_training` reads or writes
pub const LAUNCHER_VARS: [&str; 6] = [
    "LOCAL_RANK",
    "RANK",
    "WORLD_SIZE",
    "MASTER_ADDR",
    "MASTER_PORT",
    "TORCH_DISTRIBUTED_BACKEND",
];

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Exclusive access to the launcher variables for one test; cleared on drop
pub struct LauncherEnv {
    _lock: MutexGuard<'static, ()>,
}

impl LauncherEnv {
    pub fn set(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for name in LAUNCHER_VARS {
            env::remove_var(name);
        }
        for (name, value) in vars {
            env::set_var(name, value);
        }
        Self { _lock: lock }
    }
}

impl Drop for LauncherEnv {
    fn drop(&mut self) {
        for name in LAUNCHER_VARS {
            env::remove_var(name);
        }
    }
}

pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;
pub const UNK_ID: u32 = 2;

/// `<pad>`, `</s>`, `<unk>` followed by [`WORDS`]
pub fn vocab_size() -> usize {
    WORDS.len() + 3
}

fn tokenizer_json() -> serde_json::Value {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<pad>".into(), json!(PAD_ID));
    vocab.insert("</s>".into(), json!(EOS_ID));
    vocab.insert("<unk>".into(), json!(UNK_ID));
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert((*word).into(), json!(i + 3));
    }
    let special = |id: u32, content: &str| {
        json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(PAD_ID, "<pad>"), special(EOS_ID, "</s>")],
        "normalizer": null,
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
}

pub fn write_tokenizer(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("tokenizer.json"),
        serde_json::to_string_pretty(&tokenizer_json()).unwrap(),
    )
    .unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        json!({"eos_token": "</s>", "pad_token": "<pad>"}).to_string(),
    )
    .unwrap();
}

/// A half-precision base model directory with tokenizer, generation config
/// and auxiliary files that a merge should carry over
pub fn write_base_model(dir: &Path, seed: u64) -> CausalLm {
    write_tokenizer(dir);
    let config = ModelConfig::new(vocab_size(), 8, 16, 1).with_eos_token_id(EOS_ID);
    let mut model = CausalLm::new_random(config, seed).unwrap();
    model.set_dtype(WeightDtype::F16);
    model.save_pretrained(dir).unwrap();

    GenerationConfig {
        eos_token_id: Some(TokenIds::One(EOS_ID)),
        max_new_tokens: Some(16),
        ..Default::default()
    }
    .save(dir)
    .unwrap();
    fs::write(dir.join("README.md"), "# tiny base model\n").unwrap();
    fs::create_dir_all(dir.join("assets")).unwrap();
    fs::write(dir.join("assets").join("notes.txt"), "aux").unwrap();
    // Stale weight file that must never be copied
    fs::write(dir.join("pytorch_model.bin"), b"not really weights").unwrap();

    CausalLm::from_pretrained(dir, afinar::model::DevicePlacement::Cpu).unwrap()
}

/// Adapter on `up_proj`/`down_proj` with non-zero B, saved to `dir`
pub fn write_adapter(base: &CausalLm, dir: &Path) -> PeftModel {
    let config = LoraConfig::new(2, 4.0).target_modules(&["up_proj", "down_proj"]);
    let mut peft = PeftModel::inject(base.clone(), config, 7).unwrap();
    for (_, linear) in peft.model_mut().linears_mut() {
        if let Some(lora) = linear.lora_mut() {
            let [rows, cols] = lora.lora_b().shape();
            *lora.lora_b_mut().data_mut() =
                Array2::from_shape_fn((rows, cols), |(i, j)| (i as f32 - j as f32) * 0.1);
        }
    }
    peft.save_pretrained(dir).unwrap();
    peft
}

/// JSONL training file with `n` short conversations
pub fn write_train_file(path: &Path, n: usize) {
    let answers = ["red one", "blue two", "red three", "blue one"];
    let lines: Vec<String> = (0..n)
        .map(|i| {
            json!({"conversation": [{
                "human": "what is the next draw",
                "assistant": answers[i % answers.len()]
            }]})
            .to_string()
        })
        .collect();
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
