//! embed-text: turn a text file into a C source file defining one string
//! constant. Build-time helper; unrelated to the echo server at runtime.

use clap::Parser;
use sockecho::embed::{generate_with, EmbedOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "embed-text")]
#[command(version = "0.1.0")]
#[command(about = "Embed a text file as a C string constant", long_about = None)]
struct Args {
    /// Text file to embed
    input: PathBuf,

    /// C source file to write
    output: PathBuf,

    /// Name of the generated constant
    #[arg(short, long, default_value = "builtin_text")]
    name: String,

    /// Header to include before the constant (repeatable)
    #[arg(short = 'I', long = "include")]
    includes: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let options = EmbedOptions {
        name: args.name,
        includes: args.includes,
    };
    let lines = generate_with(&args.input, &args.output, &options)?;

    info!(output = %args.output.display(), lines, "Generated source");
    Ok(())
}
