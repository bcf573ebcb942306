use clap::{value_parser, Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread::JoinHandle;

use libmudensity::config::Config;
use libmudensity::error::ProcessorError;
use libmudensity::process::{process, trf_to_csv, trf_to_dicom};

fn cli() -> Command {
    Command::new("mudensity_cli")
        .about("Decode linac treatment records and calculate MU-density")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("trf2csv")
                .about("Convert TRF files to CSV tables written next to them")
                .arg(
                    Arg::new("paths")
                        .required(true)
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(PathBuf))
                        .help("TRF files to convert"),
                ),
        )
        .subcommand(
            Command::new("trf2dcm")
                .about("Write the part of a TRF near a gantry angle as an RT plan")
                .arg(Arg::new("trf").required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("template")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("RT plan providing the beam to replay into"),
                )
                .arg(
                    Arg::new("gantry_angle")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(Arg::new("outdir").required(true).value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("calc")
                .about("Calculate MU-density for the inputs of a configuration file")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("new")
                .about("Make a template configuration yaml file")
                .arg(config_arg()),
        )
}

fn config_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Path to the configuration file")
}

/// Log each failure on its own line and pick the exit code
fn report(failures: &[ProcessorError]) -> ExitCode {
    for failure in failures {
        log::error!("{failure}");
    }
    if failures.is_empty() {
        log::info!("Done.");
        ExitCode::SUCCESS
    } else {
        log::error!("{} input(s) failed.", failures.len());
        ExitCode::FAILURE
    }
}

fn run_calc(config_path: &Path, pb_manager: &MultiProgress) -> Vec<ProcessorError> {
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(config_path) {
        Ok(c) => c,
        Err(e) => return vec![e.into()],
    };
    log::info!("Config successfully loaded.");
    log::info!("Inputs: {}", config.input_paths.len());
    log::info!("Output Path: {}", config.output_path.to_string_lossy());
    log::info!("Grid Resolution: {} mm", config.grid_resolution);
    if let Some(angle) = config.gantry_angle {
        log::info!("Gantry: {angle} +/- {} degrees", config.gantry_tolerance);
    }

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(100));
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}") {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || process(config, tx));

    // The channel closes once the processing thread returns
    for status in rx {
        pb.set_position((status.progress * 100.0) as u64);
        pb.set_message(format!("input {} {}", status.input_index + 1, status.stage.label()));
    }
    pb.finish();

    collect_failures(handle)
}

type ProcessResults = Result<Vec<Result<PathBuf, ProcessorError>>, ProcessorError>;

/// Wait for the processing thread and gather every failure it reports
fn collect_failures(handle: JoinHandle<ProcessResults>) -> Vec<ProcessorError> {
    match handle.join() {
        Ok(Ok(results)) => results.into_iter().filter_map(|r| r.err()).collect(),
        Ok(Err(e)) => vec![e],
        Err(_) => {
            log::error!("Failed to join processing task!");
            vec![ProcessorError::WorkerPanicked]
        }
    }
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    let pb_manager = MultiProgress::new();
    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return ExitCode::FAILURE;
    }

    let failures = match matches.subcommand() {
        Some(("trf2csv", args)) => args
            .get_many::<PathBuf>("paths")
            .into_iter()
            .flatten()
            .filter_map(|path| {
                trf_to_csv(path)
                    .map_err(|e| ProcessorError::InputError {
                        path: path.clone(),
                        source: Box::new(e),
                    })
                    .err()
            })
            .collect(),
        Some(("trf2dcm", args)) => {
            let (Some(trf), Some(template), Some(angle), Some(outdir)) = (
                args.get_one::<PathBuf>("trf"),
                args.get_one::<PathBuf>("template"),
                args.get_one::<f64>("gantry_angle"),
                args.get_one::<PathBuf>("outdir"),
            ) else {
                return ExitCode::FAILURE;
            };
            match trf_to_dicom(trf, template, *angle, outdir) {
                Ok(path) => {
                    log::info!("Wrote {}", path.to_string_lossy());
                    Vec::new()
                }
                Err(e) => vec![ProcessorError::InputError {
                    path: trf.clone(),
                    source: Box::new(e),
                }],
            }
        }
        Some(("calc", args)) => match args.get_one::<PathBuf>("path") {
            Some(path) => run_calc(path, &pb_manager),
            None => return ExitCode::FAILURE,
        },
        Some(("new", args)) => match args.get_one::<PathBuf>("path") {
            Some(path) => {
                log::info!("Making a template config at {}...", path.to_string_lossy());
                match Config::default().write_config_file(path) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![e.into()],
                }
            }
            None => return ExitCode::FAILURE,
        },
        _ => return ExitCode::FAILURE,
    };

    report(&failures)
}
