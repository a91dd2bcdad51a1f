//! Weft CLI - Main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "weft")]
#[command(version)]
#[command(about = "Render and check weft template pages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template page
    Render {
        /// Template file to render
        template: String,

        /// JSON file bound as the root context
        #[arg(short = 'c', long)]
        context: Option<String>,

        /// Write output to FILE instead of stdout
        #[arg(short = 'o', long)]
        output: Option<String>,

        /// Base directory for resolving template locations
        #[arg(long)]
        base: Option<String>,
    },

    /// Validate a template page without rendering it
    Check {
        /// Template file to check
        template: String,

        /// Base directory for resolving template locations
        #[arg(long)]
        base: Option<String>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            template,
            context,
            output,
            base,
        } => commands::render::execute(&template, context.as_deref(), output.as_deref(), base),
        Commands::Check { template, base } => commands::check::execute(&template, base),
    }
}
