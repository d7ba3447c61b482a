use std::path::PathBuf;

use anyhow::Result;
use burn::module::Module;
use clap::{Parser, Subcommand};
use u2net::{
    backend::{create_device, get_backend_name, SelectedBackend},
    history::TrainingHistory,
    inference::{run_inference, InferenceConfig},
    model::{build, U2NetVariant},
    plot::plot_training_progress,
    telemetry::init_tracing,
    training::{run_training, TrainingCliArgs},
};

#[derive(Parser)]
#[command(name = "u2net")]
#[command(about = "U2-Net: nested U-structure network for retinal lesion segmentation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a U2-Net model
    Train {
        /// Training configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Resume from checkpoint
        #[arg(short, long)]
        resume: Option<PathBuf>,
    },

    /// Predict lesion masks
    Infer {
        /// Trained checkpoint
        #[arg(short, long)]
        model: PathBuf,

        /// Training configuration the checkpoint was trained with
        #[arg(short, long)]
        config: PathBuf,

        /// Input image path or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for masks
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Plot a training history
    Plot {
        /// History JSON written by training
        #[arg(long)]
        history: PathBuf,

        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,

        /// Figure title
        #[arg(short, long, default_value = "U2-Net training")]
        title: String,
    },

    /// Show backend and model information
    Info,
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let device = create_device();

    match cli.command {
        Commands::Train { config, resume } => {
            run_training(TrainingCliArgs::new(config, resume))?;
            Ok(())
        }

        Commands::Infer {
            model,
            config,
            input,
            output,
        } => {
            let inference_config = InferenceConfig::new(input, output, model, config);
            let written = run_inference(&inference_config, &device)?;
            println!("Wrote {} mask(s)", written.len());
            Ok(())
        }

        Commands::Plot {
            history,
            output,
            title,
        } => {
            let history = TrainingHistory::load(&history)?;
            plot_training_progress(&history, &output, &title)?;
            println!("Saved {}", output.display());
            Ok(())
        }

        Commands::Info => {
            println!("U2-Net Information:");
            println!("  Backend: {}", get_backend_name());
            println!("  Device: {device:?}");
            for variant in [U2NetVariant::Full, U2NetVariant::Lite] {
                let model = build::<SelectedBackend>(variant.clone(), 1, &device)?;
                println!(
                    "  {}: {} parameters, {} prediction maps",
                    variant.name(),
                    model.num_params(),
                    model.side_count() + 1
                );
            }
            Ok(())
        }
    }
}
