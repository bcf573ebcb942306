use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::archive::write_archive;
use super::config::Config;
use super::constants::DEFAULT_GANTRY_TOLERANCE;
use super::delivery::{merge, Delivery};
use super::error::{ConfigError, ProcessorError};
use super::machine::MachineDescriptor;
use super::mu_density::calc_mu_density;
use super::plan_writer::{to_single_beam_plan, write_plan};
use super::rtplan::{delivery_from_plan, machine_from_plan, open_plan};
use super::trf_file::{delivery_from_trf, TrfFile};
use super::worker_status::{Stage, WorkerStatus};

/// The kinds of file a delivery can be read from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputKind {
    Trf,
    Plan,
}

impl InputKind {
    /// Determine the kind of an input from its extension
    pub fn from_path(path: &Path) -> Result<Self, ProcessorError> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        match extension.as_deref() {
            Some("trf") => Ok(Self::Trf),
            Some("dcm") => Ok(Self::Plan),
            _ => Err(ProcessorError::UnknownInput(path.to_path_buf())),
        }
    }
}

/// Read the delivery of a TRF or RT plan along with the machine it was delivered on
pub fn load_delivery(
    path: &Path,
    config: &Config,
) -> Result<(Delivery, MachineDescriptor), ProcessorError> {
    let machine = config.machine_descriptor()?;
    match InputKind::from_path(path)? {
        InputKind::Trf => {
            let trf = TrfFile::open(path, machine.as_ref())?;
            Ok((trf.delivery()?, trf.machine))
        }
        InputKind::Plan => {
            let plan = open_plan(path)?;
            let delivery = delivery_from_plan(&plan, config.fraction_group)?;
            let machine = match machine {
                Some(machine) => machine,
                None => machine_from_plan(&plan)?,
            };
            Ok((delivery, machine))
        }
    }
}

/// Decode a TRF and write its table next to it as CSV
pub fn trf_to_csv(path: &Path) -> Result<PathBuf, ProcessorError> {
    let trf = TrfFile::open(path, None)?;
    let csv_path = path.with_extension("csv");
    trf.write_csv(&csv_path)?;
    log::info!("Wrote {} samples to {}", trf.table.n_samples(), csv_path.display());
    Ok(csv_path)
}

/// Write the part of a TRF recorded near a gantry angle as a single beam RT plan,
/// templated on an existing plan. The plan is written to `<output_dir>/<trf file name>.dcm`.
pub fn trf_to_dicom(
    trf_path: &Path,
    template_path: &Path,
    gantry_angle: f64,
    output_dir: &Path,
) -> Result<PathBuf, ProcessorError> {
    let template = open_plan(template_path)?;
    let delivery = delivery_from_trf(trf_path, None)?;
    log::info!(
        "Replaying {:.3} MU near gantry {gantry_angle} (within {DEFAULT_GANTRY_TOLERANCE} degrees)",
        delivery.total_mu()
    );
    let plan = to_single_beam_plan(&delivery, &template, gantry_angle, None)?;

    let file_name = trf_path
        .file_name()
        .ok_or_else(|| ProcessorError::UnknownInput(trf_path.to_path_buf()))?;
    let output_path = output_dir.join(format!("{}.dcm", file_name.to_string_lossy()));
    write_plan(&template, plan, &output_path)?;
    Ok(output_path)
}

/// Calculate and archive the MU-density of one input. Returns the archive path.
pub fn process_input(
    config: &Config,
    path: &Path,
    input_index: usize,
    tx: &Sender<WorkerStatus>,
) -> Result<PathBuf, ProcessorError> {
    let n_inputs = config.input_paths.len().max(1) as f32;
    let base = input_index as f32 / n_inputs;
    let archive_path = config.get_archive_path(path)?;

    tx.send(WorkerStatus::new(base, input_index, Stage::Decoding))?;
    let (delivery, machine) = load_delivery(path, config)?;
    let mut delivery = delivery.filter();
    if let Some(angle) = config.gantry_angle {
        let runs = delivery.mask_by_gantry(angle, config.gantry_tolerance)?;
        log::info!("Gantry {angle} was visited in {} separate runs", runs.len());
        delivery = merge(&runs)?;
    }
    log::info!(
        "{} control points, {:.3} MU on {} ({} leaf pairs)",
        delivery.len(),
        delivery.total_mu(),
        machine.name(),
        machine.leaf_pair_count()
    );

    tx.send(WorkerStatus::new(
        base + 0.1 / n_inputs,
        input_index,
        Stage::Calculating,
    ))?;
    let result = calc_mu_density(&delivery, &machine, config.grid_resolution)?;

    tx.send(WorkerStatus::new(
        base + 0.9 / n_inputs,
        input_index,
        Stage::Writing,
    ))?;
    Ok(write_archive(&result, &archive_path)?)
}

/// The function to be called by a separate thread (typically the CLI).
///
/// Every input in the config is processed in turn on a pool of `n_threads` threads. A
/// failing input does not stop the others; its error is returned in its place and left to
/// the caller to report.
pub fn process(
    config: Config,
    tx: Sender<WorkerStatus>,
) -> Result<Vec<Result<PathBuf, ProcessorError>>, ProcessorError> {
    if !config.is_n_threads_valid() {
        return Err(ConfigError::BadThreadCount(config.n_threads).into());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_threads)
        .build()?;

    let mut results = Vec::with_capacity(config.input_paths.len());
    for (index, path) in config.input_paths.iter().enumerate() {
        log::info!("Processing {}...", path.display());
        let result = pool
            .install(|| process_input(&config, path, index, &tx))
            .map_err(|e| ProcessorError::InputError {
                path: path.clone(),
                source: Box::new(e),
            });
        if result.is_ok() {
            log::info!("Finished processing {}.", path.display());
        }
        results.push(result);
    }

    tx.send(WorkerStatus::new(1.0, config.input_paths.len(), Stage::Done))?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_kind_follows_the_extension() {
        assert_eq!(InputKind::from_path(Path::new("a/field.TRF")).unwrap(), InputKind::Trf);
        assert_eq!(InputKind::from_path(Path::new("plan.dcm")).unwrap(), InputKind::Plan);
        assert!(matches!(
            InputKind::from_path(Path::new("notes.txt")),
            Err(ProcessorError::UnknownInput(_))
        ));
    }

    #[test]
    fn failing_inputs_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            input_paths: vec![dir.path().join("missing.trf"), dir.path().join("notes.txt")],
            output_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (tx, rx) = std::sync::mpsc::channel();
        let results = process(config, tx).unwrap();
        assert_eq!(results.len(), 2);
        for (result, path) in results.iter().zip(["missing.trf", "notes.txt"]) {
            match result {
                Err(ProcessorError::InputError { path: failed, .. }) => {
                    assert_eq!(failed, &dir.path().join(path))
                }
                other => panic!("unexpected result {other:?}"),
            }
        }
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.stage, Stage::Done);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let config = Config {
            n_threads: 0,
            ..Config::default()
        };
        let (tx, _rx) = std::sync::mpsc::channel();
        assert!(matches!(
            process(config, tx),
            Err(ProcessorError::ConfigError(ConfigError::BadThreadCount(0)))
        ));
    }
}
