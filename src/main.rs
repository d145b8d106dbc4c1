extern crate bsync;

use bsync::output::FileOutput;
use bsync::{
    run_translation, DispatchOptions, ProcessEngineRunner, ScenarioStatus, TranslationOptions,
};
use clap::Parser;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct BsyncArgs {
    /// Path to the audit document to translate.
    input_file: String,
    /// Path to the simulation engine binary.
    #[arg(long, short, default_value = "openstudio")]
    engine: PathBuf,
    /// Directory for per-scenario run directories.
    #[arg(long, short, default_value = "run")]
    run_root: PathBuf,
    /// Directory the translated document and summary are written into.
    #[arg(long, short)]
    output_dir: Option<PathBuf>,
    /// Module search roots written into every workflow descriptor.
    #[arg(long, short)]
    measure_path: Vec<String>,
    #[arg(long, default_value_t = 4)]
    pool_size: usize,
    #[arg(long, default_value_t = 8)]
    max_engine_processes: usize,
    /// Calendar year for monthly time series; defaults to the report's first
    /// audit date.
    #[arg(long, value_parser = clap::value_parser!(i32).range(1583..=9999))]
    baseline_year: Option<i32>,
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = BsyncArgs::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let input_file = args.input_file.as_str();
    let input_path = Path::new(input_file);
    let input_file_ext = input_path.extension().and_then(OsStr::to_str);
    let input_file_stem = match input_file_ext {
        Some(ext) => &input_file[..(input_file.len() - ext.len() - 1)],
        None => input_file,
    };
    let file_stem = Path::new(input_file_stem)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(input_file_stem);

    let output_dir = args
        .output_dir
        .or_else(|| input_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let output = FileOutput::new(output_dir, format!("{file_stem}_{{}}"));

    let runner = ProcessEngineRunner::new(args.engine);
    let options = TranslationOptions {
        measure_paths: args.measure_path,
        run_root: args.run_root,
        dispatch: DispatchOptions {
            pool_size: args.pool_size,
            max_engine_processes: args.max_engine_processes,
        },
        baseline_year: args.baseline_year,
    };

    let summary = run_translation(
        BufReader::new(File::open(input_path)?),
        &output,
        &runner,
        &options,
    )?;

    for diagnostic in &summary.diagnostics {
        eprintln!("{diagnostic}");
    }
    let failed = summary
        .scenarios
        .iter()
        .filter(|scenario| scenario.status == ScenarioStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} scenario(s) failed");
    }
    Ok(())
}
