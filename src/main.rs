//! Afinar CLI
//!
//! # Usage
//!
//! ```bash
//! # Fine-tune, save the adapter, merge into <output_dir>/weight
//! afinar train --config run.yaml --learning_rate 1e-4
//!
//! # Merge an adapter by hand
//! afinar merge --base ./ckpt/qwen --adapter ./output/lora --output ./merged
//!
//! # Ask the merged model something
//! afinar infer --model ./merged --prompt "..."
//! ```

use afinar::config::{
    resolve_settings, Cli, Command, ConfigSources, InferArgs, MergeArgs, TrainArgs,
};
use afinar::infer::model_reasoning;
use afinar::logging::{self, Verbosity};
use afinar::merge::{merge_lora_to_base_model, MergeOutcome};
use afinar::run::run_training;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    let result = match cli.command {
        Command::Train(args) => return run_train(&args),
        Command::Merge(args) => run_merge(&args),
        Command::Infer(args) => run_infer(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_train(args: &TrainArgs) -> ExitCode {
    let settings = match resolve_settings(args, &ConfigSources::from_args(args)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    match run_training(&settings) {
        Ok(report) => {
            tracing::info!(
                "training complete: {} steps, loss {:.4}",
                report.result.global_step,
                report.result.training_loss
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("training failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_merge(args: &MergeArgs) -> afinar::Result<()> {
    // Merge failures are logged by the merge itself and do not fail the command
    if let MergeOutcome::Merged(summary) =
        merge_lora_to_base_model(&args.base, &args.adapter, &args.output)
    {
        tracing::info!("copied {:?} from the base model", summary.copied_files);
    }
    Ok(())
}

fn run_infer(args: &InferArgs) -> afinar::Result<()> {
    let reply = model_reasoning(&args.model, &args.prompt, args.max_new_tokens)?;
    println!("{reply}");
    Ok(())
}
