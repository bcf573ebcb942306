use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AngleError {
    #[error("Cannot resolve 180 degree sample at index {index}: nearest neighbours {left} and {right} disagree in sign")]
    AmbiguousHalfTurn { index: usize, left: f64, right: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MachineError {
    #[error("Unsupported leaf count {0}; supported leaf pair counts are {pairs:?}", pairs=SUPPORTED_LEAF_PAIR_COUNTS)]
    UnsupportedLeafCount(usize),
    #[error("Leaf widths must be positive and finite; leaf pair {0} has width {1}")]
    BadLeafWidth(usize, f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrfHeaderError {
    #[error("TRF header terminator not found; the file is truncated or is not a TRF")]
    HeaderLengthNotFound,
    #[error("TRF header not in an expected form")]
    HeaderMismatch,
    #[error("TRF header contains an invalid timestamp {0:?}")]
    BadTimestamp(String),
    #[error("TRF channel declaration is missing or malformed: {0:?}")]
    BadDeclaration(String),
    #[error("TRF channel {0:?} declares no scale/offset pair")]
    MissingScale(String),
    #[error("TRF channel {name:?} has unknown kind {kind:?}; expected one of i16, u16, i32")]
    UnknownChannelKind { name: String, kind: String },
    #[error("TRF header pattern failed to compile: {0}")]
    BadPattern(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum TrfTableError {
    #[error("TRF table of {len} bytes is not a whole number of {record_size} byte records")]
    Truncated { len: usize, record_size: usize },
    #[error("TRF table contains no records")]
    EmptyTable,
    #[error("TRF table failed to parse a record: {0}")]
    IOError(#[from] std::io::Error),
    #[error("TRF table is missing the required column {0:?}")]
    MissingColumn(String),
    #[error("TRF table failed due to machine error: {0}")]
    MachineError(#[from] MachineError),
}

#[derive(Debug, Error)]
pub enum TrfFileError {
    #[error("Could not open TRF file {0:?}: {1}")]
    BadFilePath(PathBuf, std::io::Error),
    #[error("TRF file failed due to header error: {0}")]
    BadHeader(#[from] TrfHeaderError),
    #[error("TRF file failed due to table error: {0}")]
    BadTable(#[from] TrfTableError),
    #[error("TRF file failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("TRF file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    #[error("Delivery field {field} has {found} control points; expected {expected}")]
    LengthMismatch {
        field: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Delivery must start at 0 MU; found {0}")]
    NonZeroStart(f64),
    #[error("Delivery MU decreases at control point {index}: {previous} -> {current}")]
    NonMonotonic {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("Delivery control point {index} has {found} leaf pairs; expected {expected}")]
    LeafCountMismatch {
        index: usize,
        found: usize,
        expected: usize,
    },
    #[error("Delivery jaw at control point {index} is negative: {value}")]
    NegativeJaw { index: usize, value: f64 },
    #[error("Delivery field {field} contains a non-finite value at control point {index}")]
    NonFinite { field: &'static str, index: usize },
    #[error("Cannot merge deliveries with {0} and {1} leaf pairs")]
    MergeLeafCountMismatch(usize, usize),
    #[error("Delivery failed due to angle error: {0}")]
    AngleError(#[from] AngleError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MaskError {
    #[error("No control points within {tolerance} degrees of gantry angle {angle}; widen the tolerance or check the requested angle")]
    NoControlPoints { angle: f64, tolerance: f64 },
    #[error("Gantry tolerance must be non-negative and finite; found {0}")]
    BadTolerance(f64),
    #[error("Strip skip size must be at least 1")]
    ZeroSkipSize,
    #[error("Need at least one gantry angle to derive a tolerance")]
    TooFewAngles,
    #[error("{count} control points fall outside every gantry window of {tolerance} degrees")]
    UncapturedControlPoints { count: usize, tolerance: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("Grid resolution must be positive and finite; found {0}")]
    BadResolution(f64),
    #[error("Delivery has {found} leaf pairs but the machine describes {expected}")]
    LeafCountMismatch { found: usize, expected: usize },
    #[error("Delivery contains no control points")]
    EmptyDelivery,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Could not read RT plan: {0}")]
    ReadError(#[from] dicom::object::ReadError),
    #[error("Could not write RT plan: {0}")]
    WriteError(#[from] dicom::object::WriteError),
    #[error("RT plan is missing required attribute {0}")]
    MissingAttribute(&'static str),
    #[error("RT plan attribute {0} could not be converted: {1}")]
    BadValue(&'static str, String),
    #[error("RT plan has no fraction group {0}; available fraction groups are {1:?}")]
    UnknownFractionGroup(i32, Vec<i32>),
    #[error("RT plan has several fraction groups {0:?}; a fraction group number is required")]
    AmbiguousFractionGroup(Vec<i32>),
    #[error("RT plan references beam {0} which is not in the beam sequence")]
    UnknownBeam(i32),
    #[error("RT plan beam uses unsupported beam limiting devices {0:?}; supported are MLCX with ASYMY")]
    UnsupportedCollimation(Vec<String>),
    #[error("RT plan beam has {found} leaf jaw positions; expected {expected}")]
    LeafPositionCount { found: usize, expected: usize },
    #[error("RT plan beam has a final cumulative meterset weight of zero")]
    ZeroFinalWeight,
    #[error("RT plan beam {0} changes gantry angle; only fixed gantry beams can be replayed")]
    RotatingBeam(i32),
    #[error("RT plan failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("RT plan failed due to angle error: {0}")]
    AngleError(#[from] AngleError),
    #[error("RT plan failed due to mask error: {0}")]
    MaskError(#[from] MaskError),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[cfg(feature = "hdf5")]
    #[error("Archive failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[cfg(feature = "hdf5")]
    #[error("Archive failed due to HDF5 string error: {0}")]
    StringError(#[from] hdf5::types::StringError),
    #[error("Archive failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config failed as path {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config failed due to machine error: {0}")]
    MachineError(#[from] MachineError),
    #[error("Config requested {0} threads; at least one is required")]
    BadThreadCount(usize),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to TRF error: {0}")]
    TrfError(#[from] TrfFileError),
    #[error("Processor failed due to RT plan error: {0}")]
    PlanError(#[from] PlanError),
    #[error("Processor failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("Processor failed due to mask error: {0}")]
    MaskError(#[from] MaskError),
    #[error("Processor failed due to calculation error: {0}")]
    CalcError(#[from] CalcError),
    #[error("Processor failed due to archive error: {0}")]
    ArchiveError(#[from] ArchiveError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor could not determine the input kind of {0:?}; expected a .trf or .dcm file")]
    UnknownInput(PathBuf),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Processor failed to build its thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    #[error("Processor failed to send status: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor thread panicked before returning its results")]
    WorkerPanicked,
    #[error("Processor failed on {path:?}: {source}")]
    InputError {
        path: PathBuf,
        source: Box<ProcessorError>,
    },
}
