use std::fs;
use std::path;
use std::process::ExitCode;

use clap::Parser;
use log::{info, warn, LevelFilter};

use grapple::logging;
use grapple::signal::replay::{self, RenderOptions};

#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    /// Session log written by the in-browser logger.
    #[arg(short, long)]
    log: path::PathBuf,

    /// Where to write the testcase. Prints to stdout if not specified.
    #[arg(short, long)]
    output: Option<path::PathBuf>,

    /// Wrap every statement in a try/catch so one throwing line doesn't end the replay.
    #[arg(short, long)]
    try_catch: bool,

    /// Run statements the fuzzer logged as block comments.
    #[arg(short, long)]
    uncomment: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init_with_level("log/grapple_replay.log", LevelFilter::Info) {
        eprintln!("Could not set up logging: {:?}", e);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(&args.log)
        .map_err(|e| format!("Could not read {}: {}", args.log.display(), e))?;

    let log = replay::parse_document(&text)?;
    info!("Parsed {} top-level records from {}", log.records.len(), args.log.display());
    if log.truncated {
        warn!("{} ends without </fuzzer>, the browser probably crashed", args.log.display());
    }

    let options = RenderOptions {
        try_catch: args.try_catch,
        uncomment: args.uncomment,
        ..RenderOptions::default()
    };
    let testcase = replay::render_testcase(&log, &options);

    match args.output.as_ref() {
        Some(path) => {
            fs::write(path, testcase)
                .map_err(|e| format!("Could not write {}: {}", path.display(), e))?;
            info!("Wrote testcase to {}", path.display());
        },
        None => print!("{}", testcase),
    }

    Ok(())
}
