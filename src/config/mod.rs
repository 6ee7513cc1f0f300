//! Command line, settings and layered configuration files

mod cli;
mod layered;
mod settings;
mod validate;

pub use cli::{parse_args, Cli, Command, InferArgs, MergeArgs, TrainArgs};
pub use layered::{
    load_config_file, machine_config_path, merge_layers, overlay, resolve_settings,
    ConfigSources, MACHINE_CONFIG_ENV, MACHINE_CONFIG_PATH,
};
pub use settings::TrainSettings;
pub use validate::{validate_settings, ValidationError};
