use ndarray::{Array1, Axis};

use super::delivery::Delivery;
use super::error::CalcError;
use super::machine::MachineDescriptor;

/// Cell centres of an MU-density grid, both axes ascending and aligned to multiples of
/// the resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub resolution: f64,
}

impl Grid {
    pub fn shape(&self) -> (usize, usize) {
        (self.y.len(), self.x.len())
    }
}

/// Build the grid covering every aperture a delivery opens, with one cell of margin on
/// each side.
///
/// Only leaf pairs that overlap the widest jaw opening contribute to the x extent.
pub fn get_grid(
    delivery: &Delivery,
    machine: &MachineDescriptor,
    resolution: f64,
) -> Result<Grid, CalcError> {
    check_inputs(delivery, machine, resolution)?;

    let jaw = delivery.jaw();
    let max_y1 = jaw.column(0).fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
    let max_y2 = jaw.column(1).fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));

    let bands = machine.leaf_bands();
    let mut exposed: Vec<usize> = bands
        .iter()
        .enumerate()
        .filter(|(_, (lower, upper))| *lower < max_y1 && *upper > -max_y2)
        .map(|(pair, _)| pair)
        .collect();
    if exposed.is_empty() {
        exposed = (0..bands.len()).collect();
    }

    let mlc = delivery.mlc();
    let mut min_left = f64::INFINITY;
    let mut max_right = f64::NEG_INFINITY;
    for pair in exposed {
        let edges = mlc.index_axis(Axis(1), pair);
        for edge in edges.column(0) {
            min_left = min_left.min(-edge);
        }
        for edge in edges.column(1) {
            max_right = max_right.max(*edge);
        }
    }

    let x = axis((min_left / resolution).floor(), (max_right / resolution).ceil(), resolution);
    let y = axis((-max_y2 / resolution).floor(), (max_y1 / resolution).ceil(), resolution);
    log::debug!(
        "MU-density grid of {} x {} cells at {resolution} mm",
        x.len(),
        y.len()
    );
    Ok(Grid { x, y, resolution })
}

pub(crate) fn check_inputs(
    delivery: &Delivery,
    machine: &MachineDescriptor,
    resolution: f64,
) -> Result<(), CalcError> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(CalcError::BadResolution(resolution));
    }
    if delivery.is_empty() {
        return Err(CalcError::EmptyDelivery);
    }
    if delivery.leaf_pair_count() != machine.leaf_pair_count() {
        return Err(CalcError::LeafCountMismatch {
            found: delivery.leaf_pair_count(),
            expected: machine.leaf_pair_count(),
        });
    }
    Ok(())
}

/// Cell centres from (first - 1) to (last + 1) multiples of the resolution
fn axis(first: f64, last: f64, resolution: f64) -> Array1<f64> {
    let first = first as i64 - 1;
    let last = (last as i64 + 1).max(first);
    (first..=last).map(|k| k as f64 * resolution).collect()
}
