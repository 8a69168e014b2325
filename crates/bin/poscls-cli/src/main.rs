use clap::Parser;

use crate::builder::ClassifierBuilder;

mod builder;
mod config;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
struct CliArgs {
    #[arg(short = 'c', long, value_name = "CONFIG_FILE")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let start = std::time::Instant::now();
    let builder = ClassifierBuilder::new(&args.config)?;
    let diagrams = builder.build()?;
    let elapsed = start.elapsed();
    println!(
        "Built {} classifiers in {} ms.",
        diagrams.len(),
        elapsed.as_millis()
    );
    Ok(())
}
