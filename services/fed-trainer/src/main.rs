use std::path::Path;

use anyhow::{bail, Result};
use tracing::info;

mod experiment;

fn main() -> Result<()> {
    fedsim_core::init_tracing("fed-trainer")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() > 1 {
        bail!("expected at most one argument (config file path), got {args:?}");
    }
    let cfg = fedsim_core::load_config(args.first().map(Path::new))?;
    info!(target: "fed-trainer", experiment = %cfg.experiment_name, "Starting federated experiment");
    let report = experiment::run_experiment(&cfg)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
