//! Cellflow CLI - run multi-language notebooks from the terminal.

mod colors;
mod notebook;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use cellflow_core::RunMode;

#[derive(Parser)]
#[command(name = "cellflow")]
#[command(about = "Run query, config and script notebook cells in order")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a notebook headlessly
    Run {
        /// Path to the notebook (.json file)
        notebook: PathBuf,

        /// How query cells are executed
        #[arg(long, value_enum, default_value_t = ModeArg::Query)]
        mode: ModeArg,

        /// First cell index to run
        #[arg(long)]
        from: Option<usize>,

        /// Last cell index to run
        #[arg(long)]
        to: Option<usize>,

        /// Script interpreter binary (default: $CELLFLOW_SCRIPT_INTERPRETER, then node)
        #[arg(long)]
        interpreter: Option<PathBuf>,

        /// Directory containing rule files (default: the notebook's directory)
        #[arg(long)]
        rules_dir: Option<PathBuf>,

        /// Print the final variables as JSON
        #[arg(long)]
        print_vars: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Query,
    Explain,
    ExplainAnalyze,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Query => RunMode::Query,
            ModeArg::Explain => RunMode::Explain,
            ModeArg::ExplainAnalyze => RunMode::ExplainAnalyze,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<cellflow_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            notebook,
            mode,
            from,
            to,
            interpreter,
            rules_dir,
            print_vars,
        } => {
            run::execute(run::RunOptions {
                notebook,
                mode: mode.into(),
                from,
                to,
                interpreter,
                rules_dir,
                print_vars,
            })
            .await
            .map_err(format_error)?;
        }
    }

    Ok(())
}
