/// Leaf pair counts with a bundled machine description (Agility, Millennium 120)
pub const SUPPORTED_LEAF_PAIR_COUNTS: [usize; 2] = [80, 60];

pub const AGILITY_LEAF_PAIRS: usize = 80;
pub const AGILITY_LEAF_WIDTH: f64 = 5.0;

// Millennium 120: 10 outer pairs of 10 mm either side of 40 central pairs of 5 mm
pub const MILLENNIUM_LEAF_PAIRS: usize = 60;
pub const MILLENNIUM_OUTER_PAIRS: usize = 10;
pub const MILLENNIUM_OUTER_WIDTH: f64 = 10.0;
pub const MILLENNIUM_INNER_WIDTH: f64 = 5.0;

pub const DEFAULT_GRID_RESOLUTION: f64 = 1.0;
pub const DEFAULT_GANTRY_TOLERANCE: f64 = 3.0;

// Canonical TRF column names
pub const MU_COLUMN: &str = "Step Dose/Actual Value (Mu)";
pub const GANTRY_COLUMN: &str = "Gantry/Actual Value";
pub const COLLIMATOR_COLUMN: &str = "Collimator/Actual Value";
pub const Y1_JAW_COLUMN: &str = "Y1 Diaphragm/Actual Value";
pub const Y2_JAW_COLUMN: &str = "Y2 Diaphragm/Actual Value";
pub const TIME_COLUMN: &str = "Time (s)";

/// Separator between TRF header tokens
pub const TRF_DELIMITER: u8 = b'\t';
/// Tokens before the first candidate column marker
pub const TRF_HEADER_ROW_SKIPS: usize = 6;
pub const TRF_MARKER_LENGTH: usize = 3;
pub const TRF_MARKER_PREFIX: [u8; 2] = [0xdc, 0x00];
pub const TRF_DECLARATION_MAGIC: &str = "TRF";

pub const MU_DENSITY_GROUP_NAME: &str = "mu_density";
/// This is the version of the MU-density archive format
pub const FORMAT_VERSION: &str = "1.0";

/// Decimal places for CumulativeMetersetWeight and BeamMeterset when writing plans
pub const PLAN_DECIMALS: usize = 6;
