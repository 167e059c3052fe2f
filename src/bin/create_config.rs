use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_context_log::config::export_default;

#[derive(Parser)]
#[command(name = "create_config")]
#[command(about = "Write the default logging configuration to a file for customization", long_about = None)]
struct Cli {
    /// Where to write the configuration document
    output_path: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match export_default(&cli.output_path) {
        Ok(()) => {
            println!("Wrote default logging configuration to {}", cli.output_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
