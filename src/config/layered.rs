//! Layered settings resolution
//!
//! Later layers overwrite earlier ones key by key:
//!
//! 1. built-in defaults
//! 2. the `--config` file, if given
//! 3. the machine-wide defaults file (always read)
//! 4. flags given explicitly on the command line
//!
//! The machine-wide file sits above the user's file, so it wins for any key
//! both of them set.

use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::cli::TrainArgs;
use super::settings::TrainSettings;
use super::validate::validate_settings;
use crate::{Error, Result};

/// Environment variable that relocates the machine-wide defaults file
pub const MACHINE_CONFIG_ENV: &str = "AFINAR_DEFAULT_CONFIG";
pub const MACHINE_CONFIG_PATH: &str = "/etc/afinar/default_config.json";

/// Key never copied from a layer
const CONFIG_KEY: &str = "config";

/// Overwrite matching keys of `base` with `layer` and add the new ones
pub fn overlay(base: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (key, value) in layer {
        if key == CONFIG_KEY {
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

/// `$AFINAR_DEFAULT_CONFIG`, or the fixed system path
pub fn machine_config_path() -> PathBuf {
    env::var_os(MACHINE_CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(MACHINE_CONFIG_PATH))
}

/// Read a JSON object from a config file. `.yaml` / `.yml` files are parsed
/// as YAML.
pub fn load_config_file(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display())))?
    } else {
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid JSON in {}: {e}", path.display())))?
    };

    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(Error::Config(format!(
            "{} must contain an object, found {}",
            path.display(),
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Files consulted between the defaults and the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSources {
    pub user: Option<PathBuf>,
    pub machine: PathBuf,
}

impl ConfigSources {
    pub fn from_args(args: &TrainArgs) -> Self {
        Self {
            user: args.config.clone(),
            machine: machine_config_path(),
        }
    }
}

/// Layer every source into one object, without interpreting it
pub fn merge_layers(args: &TrainArgs, sources: &ConfigSources) -> Result<Map<String, Value>> {
    let mut merged = match serde_json::to_value(TrainSettings::default())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if let Some(user) = &sources.user {
        tracing::debug!("applying config file {}", user.display());
        overlay(&mut merged, &load_config_file(user)?);
    }

    tracing::debug!("applying machine defaults {}", sources.machine.display());
    overlay(&mut merged, &load_config_file(&sources.machine)?);

    overlay(&mut merged, &args.explicit_overrides()?);
    Ok(merged)
}

/// Resolve and validate the settings for one training run
pub fn resolve_settings(args: &TrainArgs, sources: &ConfigSources) -> Result<TrainSettings> {
    let merged = merge_layers(args, sources)?;
    let settings: TrainSettings = serde_json::from_value(Value::Object(merged))
        .map_err(|e| Error::Config(format!("invalid setting: {e}")))?;

    if !settings.extra.is_empty() {
        let keys: Vec<&String> = settings.extra.keys().collect();
        tracing::warn!("ignoring unknown settings: {keys:?}");
    }

    validate_settings(&settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_overlay_precedence() {
        let mut base = obj(json!({"a": 1, "b": 2}));
        overlay(&mut base, &obj(json!({"b": 3})));
        overlay(&mut base, &obj(json!({"b": 4, "c": 5})));
        assert_eq!(Value::Object(base), json!({"a": 1, "b": 4, "c": 5}));
    }

    #[test]
    fn test_overlay_skips_config_key() {
        let mut base = obj(json!({"a": 1}));
        overlay(&mut base, &obj(json!({"config": "other.json", "a": 2})));
        assert_eq!(Value::Object(base), json!({"a": 2}));
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = TempDir::new().unwrap();
        let yaml = write(&dir, "c.yaml", "lora_rank: 8\nseed: 3\n");
        let json_path = write(&dir, "c.json", r#"{"lora_rank": 4}"#);
        assert_eq!(load_config_file(&yaml).unwrap()["lora_rank"], 8);
        assert_eq!(load_config_file(&json_path).unwrap()["lora_rank"], 4);
    }

    #[test]
    fn test_load_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "c.json", "[1, 2]");
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_resolution_order() {
        let dir = TempDir::new().unwrap();
        let user = write(&dir, "user.json", r#"{"lora_rank": 8, "seed": 1}"#);
        let machine = write(&dir, "machine.json", r#"{"lora_rank": 16, "warmup_steps": 0}"#);
        let args = TrainArgs {
            warmup_steps: Some(5),
            ..Default::default()
        };
        let sources = ConfigSources {
            user: Some(user),
            machine,
        };

        let settings = resolve_settings(&args, &sources).unwrap();
        assert_eq!(settings.lora_rank, 16);
        assert_eq!(settings.seed, 1);
        assert_eq!(settings.warmup_steps, 5);
        assert_eq!(settings.max_seq_length, 1024);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let dir = TempDir::new().unwrap();
        let machine = write(&dir, "machine.json", r#"{"optim": "lion"}"#);
        let sources = ConfigSources {
            user: None,
            machine,
        };
        let err = resolve_settings(&TrainArgs::default(), &sources).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let dir = TempDir::new().unwrap();
        let machine = write(&dir, "machine.json", r#"{"lora_rank": "eight"}"#);
        let sources = ConfigSources {
            user: None,
            machine,
        };
        assert!(matches!(
            resolve_settings(&TrainArgs::default(), &sources),
            Err(Error::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_later_layer_wins(a in 0i64..100, b in 0i64..100, c in 0i64..100) {
            let mut base = obj(json!({"k": a}));
            overlay(&mut base, &obj(json!({"k": b})));
            overlay(&mut base, &obj(json!({"k": c})));
            prop_assert_eq!(base["k"].as_i64(), Some(c));
        }

        #[test]
        fn prop_overlay_keeps_untouched_keys(a in 0i64..100, b in 0i64..100) {
            let mut base = obj(json!({"x": a}));
            overlay(&mut base, &obj(json!({"y": b})));
            prop_assert_eq!(base["x"].as_i64(), Some(a));
            prop_assert_eq!(base["y"].as_i64(), Some(b));
        }
    }
}
