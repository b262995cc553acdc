//! Print the generation metadata embedded in one image.

use anyhow::{Context, Result};
use clap::Parser;
use gencat::metadata::{parse_parameters, read_embedded_text};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "inspect")]
#[command(about = "Show the embedded generation text of an image and how it parses")]
struct Args {
    /// Image file (png, jpg, jpeg, webp)
    file: PathBuf,

    /// Only print the parsed JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "warn")).init();
    let args = Args::parse();

    let text = read_embedded_text(&args.file)
        .with_context(|| format!("No readable metadata in {}", args.file.display()))?;
    if !args.json {
        println!("--- embedded text ---");
        println!("{}", text);
        println!("--- parsed ---");
    }

    let parsed = parse_parameters(&text).with_context(|| format!("Failed to parse {}", args.file.display()))?;
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}
