//! MU-density: the MU-weighted fraction of each grid cell left open by the jaws and MLC,
//! integrated over a delivery.
//!
//! Between consecutive control points every leaf and jaw edge moves linearly with delivered
//! MU. The open area of a cell within one leaf pair is the product of an x overlap (between
//! the leaf edges) and a y overlap (between the leaf band and the jaws). Both are piecewise
//! linear in progress, so their product is piecewise quadratic and Simpson's rule over the
//! pieces integrates it exactly.
use ndarray::{Array1, Array2, ArrayViewMut1, Zip};

use super::delivery::Delivery;
use super::error::CalcError;
use super::grid::{check_inputs, get_grid, Grid};
use super::machine::MachineDescriptor;

/// A computed MU-density map. `density` is indexed `[y, x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MuDensity {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub density: Array2<f64>,
    pub resolution: f64,
    pub total_mu: f64,
}

impl MuDensity {
    /// Sum of density times cell area, in MU mm^2
    pub fn integral(&self) -> f64 {
        self.density.sum() * self.resolution * self.resolution
    }
}

/// Calculate the MU-density of a delivery on the grid returned by [`get_grid`]
pub fn calc_mu_density(
    delivery: &Delivery,
    machine: &MachineDescriptor,
    resolution: f64,
) -> Result<MuDensity, CalcError> {
    let grid = get_grid(delivery, machine, resolution)?;
    calc_mu_density_on_grid(delivery, machine, &grid)
}

/// Calculate the MU-density of a delivery on a given grid
pub fn calc_mu_density_on_grid(
    delivery: &Delivery,
    machine: &MachineDescriptor,
    grid: &Grid,
) -> Result<MuDensity, CalcError> {
    check_inputs(delivery, machine, grid.resolution)?;

    let segments = segments(delivery);
    let bands = machine.leaf_bands();
    log::debug!(
        "Integrating {} moving segments over {} leaf pairs",
        segments.len(),
        bands.len()
    );

    let mut density = Array2::<f64>::zeros(grid.shape());
    // Rows are independent; each is summed in a fixed order so results do not depend on
    // scheduling
    Zip::from(density.rows_mut())
        .and(&grid.y)
        .par_for_each(|row, y| {
            accumulate_row(row, *y, &grid.x, grid.resolution, &segments, &bands);
        });

    Ok(MuDensity {
        x: grid.x.clone(),
        y: grid.y.clone(),
        density,
        resolution: grid.resolution,
        total_mu: delivery.total_mu(),
    })
}

/// A quantity moving linearly from `start` to `end` as progress t goes from 0 to 1
#[derive(Debug, Clone, Copy)]
struct Ramp {
    start: f64,
    end: f64,
}

impl Ramp {
    fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    fn fixed(value: f64) -> Self {
        Self::new(value, value)
    }

    fn at(&self, t: f64) -> f64 {
        self.start + (self.end - self.start) * t
    }

    fn min(&self) -> f64 {
        self.start.min(self.end)
    }

    fn max(&self) -> f64 {
        self.start.max(self.end)
    }

    /// Progress strictly inside (0, 1) at which two ramps meet
    fn crossing(&self, other: &Ramp) -> Option<f64> {
        let before = self.start - other.start;
        let after = self.end - other.end;
        if before == after {
            return None;
        }
        let t = before / (before - after);
        (t > 0.0 && t < 1.0).then_some(t)
    }
}

/// Length of [lo, hi] left between a moving lower and upper edge
#[derive(Debug, Clone, Copy)]
struct Overlap {
    lo: f64,
    hi: f64,
    lower: Ramp,
    upper: Ramp,
}

impl Overlap {
    fn at(&self, t: f64) -> f64 {
        (self.hi.min(self.upper.at(t)) - self.lo.max(self.lower.at(t))).max(0.0)
    }

    /// Progress values where the overlap may change slope
    fn push_breakpoints(&self, breakpoints: &mut Vec<f64>) {
        let lo = Ramp::fixed(self.lo);
        let hi = Ramp::fixed(self.hi);
        let crossings = [
            self.lower.crossing(&lo),
            self.upper.crossing(&hi),
            self.upper.crossing(&self.lower),
            self.upper.crossing(&lo),
            self.lower.crossing(&hi),
        ];
        breakpoints.extend(crossings.into_iter().flatten());
    }

    fn is_closed(&self) -> bool {
        self.upper.max() <= self.lo || self.lower.min() >= self.hi
    }
}

/// Edges of the machine between two control points
struct Segment {
    delta_mu: f64,
    // (lower, upper) jaw edges in y
    jaw: (Ramp, Ramp),
    // (left, right) leaf edges in x for each leaf pair
    leaves: Vec<(Ramp, Ramp)>,
}

fn segments(delivery: &Delivery) -> Vec<Segment> {
    let monitor_units = delivery.monitor_units();
    let mlc = delivery.mlc();
    let jaw = delivery.jaw();
    (1..delivery.len())
        .filter(|i| monitor_units[*i] > monitor_units[*i - 1])
        .map(|i| Segment {
            delta_mu: monitor_units[i] - monitor_units[i - 1],
            jaw: (
                Ramp::new(-jaw[[i - 1, 1]], -jaw[[i, 1]]),
                Ramp::new(jaw[[i - 1, 0]], jaw[[i, 0]]),
            ),
            leaves: (0..delivery.leaf_pair_count())
                .map(|pair| {
                    (
                        Ramp::new(-mlc[[i - 1, pair, 0]], -mlc[[i, pair, 0]]),
                        Ramp::new(mlc[[i - 1, pair, 1]], mlc[[i, pair, 1]]),
                    )
                })
                .collect(),
        })
        .collect()
}

fn accumulate_row(
    mut row: ArrayViewMut1<f64>,
    y: f64,
    x: &Array1<f64>,
    resolution: f64,
    segments: &[Segment],
    bands: &[(f64, f64)],
) {
    let half = 0.5 * resolution;
    let cell_area = resolution * resolution;
    let mut open_fraction = vec![0.0; x.len()];
    let mut breakpoints = Vec::new();

    for segment in segments {
        open_fraction.iter_mut().for_each(|f| *f = 0.0);

        for (pair, (band_lower, band_upper)) in bands.iter().enumerate() {
            let lo = (y - half).max(*band_lower);
            let hi = (y + half).min(*band_upper);
            if hi <= lo {
                continue;
            }
            let y_overlap = Overlap {
                lo,
                hi,
                lower: segment.jaw.0,
                upper: segment.jaw.1,
            };
            if y_overlap.is_closed() {
                continue;
            }

            let (left, right) = segment.leaves[pair];
            for (f, x_centre) in open_fraction.iter_mut().zip(x.iter()) {
                let x_overlap = Overlap {
                    lo: x_centre - half,
                    hi: x_centre + half,
                    lower: left,
                    upper: right,
                };
                if x_overlap.is_closed() {
                    continue;
                }
                breakpoints.clear();
                breakpoints.extend([0.0, 1.0]);
                x_overlap.push_breakpoints(&mut breakpoints);
                y_overlap.push_breakpoints(&mut breakpoints);
                let area = integrate(&mut breakpoints, |t| x_overlap.at(t) * y_overlap.at(t));
                *f += area / cell_area;
            }
        }

        for (cell, f) in row.iter_mut().zip(open_fraction.iter()) {
            *cell += segment.delta_mu * f.clamp(0.0, 1.0);
        }
    }
}

/// Integrate a function that is quadratic between breakpoints over [0, 1]
fn integrate(breakpoints: &mut Vec<f64>, f: impl Fn(f64) -> f64) -> f64 {
    breakpoints.sort_by(|a, b| a.total_cmp(b));
    breakpoints.dedup();
    breakpoints
        .windows(2)
        .map(|piece| {
            let (a, b) = (piece[0], piece[1]);
            (b - a) / 6.0 * (f(a) + 4.0 * f(0.5 * (a + b)) + f(b))
        })
        .sum()
}
