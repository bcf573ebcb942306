use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::MachineError;

/// Geometry and channel naming of a linac head.
///
/// Leaf widths are listed from the top leaf pair (+y) to the bottom one and the bank is
/// centred on the beam axis. The alias table maps the raw channel names found in treatment
/// record files onto the canonical column names used by the decoder; scaled leaf channels
/// (`Y1 Leaf 7/Scaled Actual (mm)`) are recognised by pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineDescriptor {
    name: String,
    leaf_widths: Vec<f64>,
    aliases: FxHashMap<String, String>,
}

/// Serializable description of a machine as found in a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Agility,
    Millennium,
    /// Explicit leaf widths in mm, top leaf pair first
    Custom(Vec<f64>),
}

impl MachineKind {
    pub fn descriptor(&self) -> Result<MachineDescriptor, MachineError> {
        match self {
            Self::Agility => Ok(MachineDescriptor::agility()),
            Self::Millennium => Ok(MachineDescriptor::millennium()),
            Self::Custom(widths) => MachineDescriptor::new("custom", widths.clone()),
        }
    }
}

impl MachineDescriptor {
    /// Create a descriptor from a name and leaf widths (mm, top pair first)
    pub fn new(name: &str, leaf_widths: Vec<f64>) -> Result<Self, MachineError> {
        for (pair, width) in leaf_widths.iter().enumerate() {
            if !width.is_finite() || *width <= 0.0 {
                return Err(MachineError::BadLeafWidth(pair, *width));
            }
        }
        Ok(Self {
            name: String::from(name),
            leaf_widths,
            aliases: build_aliases(),
        })
    }

    /// Elekta Agility: 80 leaf pairs of 5 mm
    pub fn agility() -> Self {
        Self {
            name: String::from("agility"),
            leaf_widths: vec![AGILITY_LEAF_WIDTH; AGILITY_LEAF_PAIRS],
            aliases: build_aliases(),
        }
    }

    /// Varian Millennium 120: 60 leaf pairs, 10 mm outer and 5 mm inner leaves
    pub fn millennium() -> Self {
        let inner_pairs = MILLENNIUM_LEAF_PAIRS - 2 * MILLENNIUM_OUTER_PAIRS;
        let mut leaf_widths = vec![MILLENNIUM_OUTER_WIDTH; MILLENNIUM_OUTER_PAIRS];
        leaf_widths.extend(std::iter::repeat(MILLENNIUM_INNER_WIDTH).take(inner_pairs));
        leaf_widths.extend(std::iter::repeat(MILLENNIUM_OUTER_WIDTH).take(MILLENNIUM_OUTER_PAIRS));
        Self {
            name: String::from("millennium"),
            leaf_widths,
            aliases: build_aliases(),
        }
    }

    /// Pick the bundled descriptor with the given number of leaf pairs
    pub fn from_leaf_count(leaf_pairs: usize) -> Result<Self, MachineError> {
        match leaf_pairs {
            AGILITY_LEAF_PAIRS => Ok(Self::agility()),
            MILLENNIUM_LEAF_PAIRS => Ok(Self::millennium()),
            _ => Err(MachineError::UnsupportedLeafCount(leaf_pairs)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn leaf_pair_count(&self) -> usize {
        self.leaf_widths.len()
    }

    pub fn leaf_widths(&self) -> &[f64] {
        &self.leaf_widths
    }

    /// The (lower, upper) y extent of each leaf pair, top pair first
    pub fn leaf_bands(&self) -> Vec<(f64, f64)> {
        let total: f64 = self.leaf_widths.iter().sum();
        let mut upper = total / 2.0;
        self.leaf_widths
            .iter()
            .map(|width| {
                let band = (upper - width, upper);
                upper -= width;
                band
            })
            .collect()
    }

    /// The y coordinate of the centre of each leaf pair, top pair first
    pub fn leaf_centres(&self) -> Vec<f64> {
        self.leaf_bands()
            .iter()
            .map(|(lower, upper)| 0.5 * (lower + upper))
            .collect()
    }

    /// Map a raw TRF channel name onto its canonical column name.
    /// Names without an alias are already canonical.
    pub fn canonical_column(&self, raw: &str) -> String {
        if let Some(canonical) = self.aliases.get(raw) {
            return canonical.clone();
        }
        for bank in [LeafBank::Y1, LeafBank::Y2] {
            let leaf = raw
                .strip_prefix(bank.label())
                .and_then(|rest| rest.strip_prefix(" Leaf "))
                .and_then(|rest| rest.strip_suffix(SCALED_LEAF_SUFFIX))
                .and_then(|number| number.parse::<usize>().ok());
            if let Some(leaf) = leaf {
                return Self::leaf_column(bank, leaf);
            }
        }
        String::from(raw)
    }

    /// Number of leaf pairs with a Y1 bank column among canonical column names
    pub fn count_leaf_columns<'a>(columns: impl Iterator<Item = &'a str>) -> usize {
        let prefix = format!("MLC/{} Leaf ", LeafBank::Y1.label());
        columns.filter(|name| name.starts_with(&prefix)).count()
    }

    /// Canonical column name of a leaf in bank Y1 or Y2, numbered from 1
    pub fn leaf_column(bank: LeafBank, leaf: usize) -> String {
        format!("MLC/{} Leaf {leaf}/Actual Value", bank.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafBank {
    Y1,
    Y2,
}

impl LeafBank {
    fn label(&self) -> &'static str {
        match self {
            Self::Y1 => "Y1",
            Self::Y2 => "Y2",
        }
    }
}

const SCALED_LEAF_SUFFIX: &str = "/Scaled Actual (mm)";

fn build_aliases() -> FxHashMap<String, String> {
    let mut aliases = FxHashMap::default();
    let fixed = [
        ("Step Dose/Scaled Actual (Mu)", MU_COLUMN),
        ("Step Gantry/Scaled Actual (deg)", GANTRY_COLUMN),
        ("Step Collimator/Scaled Actual (deg)", COLLIMATOR_COLUMN),
        ("Y1 Diaphragm/Scaled Actual (mm)", Y1_JAW_COLUMN),
        ("Y2 Diaphragm/Scaled Actual (mm)", Y2_JAW_COLUMN),
    ];
    for (raw, canonical) in fixed {
        aliases.insert(String::from(raw), String::from(canonical));
    }
    aliases
}
