//! Target-module discovery

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::model::{CausalLm, ModuleKind, LM_HEAD};
use crate::Error;

/// Which linear kind adapters are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainMode {
    /// Full-precision `Linear` modules
    #[default]
    Lora,
    /// 4-bit `Linear4bit` modules
    Qlora,
}

impl TrainMode {
    pub fn module_kind(self) -> ModuleKind {
        match self {
            TrainMode::Lora => ModuleKind::Linear,
            TrainMode::Qlora => ModuleKind::Linear4bit,
        }
    }
}

impl FromStr for TrainMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lora" => Ok(TrainMode::Lora),
            "qlora" => Ok(TrainMode::Qlora),
            other => Err(Error::Config(format!(
                "unknown train_mode {other:?} (expected \"lora\" or \"qlora\")"
            ))),
        }
    }
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainMode::Lora => write!(f, "lora"),
            TrainMode::Qlora => write!(f, "qlora"),
        }
    }
}

/// Last path segment of every module of the mode's linear kind, `lm_head`
/// excluded. Sorted and deduplicated.
pub fn find_all_linear_names(model: &CausalLm, mode: TrainMode) -> Vec<String> {
    let kind = mode.module_kind();
    let names: BTreeSet<String> = model
        .named_modules()
        .into_iter()
        .filter(|(_, k)| *k == kind)
        .filter_map(|(path, _)| path.rsplit('.').next().map(str::to_string))
        .filter(|name| name != LM_HEAD)
        .collect();
    names.into_iter().collect()
}
