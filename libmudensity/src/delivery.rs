use bitvec::prelude::*;
use ndarray::{s, Array2, Array3, Axis};

use super::constants::DEFAULT_GANTRY_TOLERANCE;
use super::error::{DeliveryError, MaskError};

// Rebased monitor units are rounded to remove subtraction noise
const REBASE_DECIMALS: i32 = 7;
// Margin kept between neighbouring gantry windows
const GANTRY_WINDOW_MARGIN: f64 = 0.1;

/// A sequence of control points describing the state of a linac through a delivery.
///
/// Every field is indexed by control point. `mlc` has shape (control point, leaf pair, bank)
/// where bank 0 is the left bank (edge at x = -mlc) and bank 1 the right bank (edge at
/// x = +mlc); `jaw` has shape (control point, 2) holding (Y1, Y2). Monitor units are
/// cumulative, start at zero and never decrease.
///
/// Deliveries are values: every transformation returns a new Delivery that owns its data.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    monitor_units: Vec<f64>,
    gantry: Vec<f64>,
    collimator: Vec<f64>,
    mlc: Array3<f64>,
    jaw: Array2<f64>,
}

impl Delivery {
    /// Create a Delivery, validating shapes and invariants
    pub fn new(
        monitor_units: Vec<f64>,
        gantry: Vec<f64>,
        collimator: Vec<f64>,
        mlc: Array3<f64>,
        jaw: Array2<f64>,
    ) -> Result<Self, DeliveryError> {
        let expected = monitor_units.len();
        let lengths = [
            ("gantry", gantry.len()),
            ("collimator", collimator.len()),
            ("mlc", mlc.len_of(Axis(0))),
            ("jaw", jaw.len_of(Axis(0))),
        ];
        for (field, found) in lengths {
            if found != expected {
                return Err(DeliveryError::LengthMismatch {
                    field,
                    found,
                    expected,
                });
            }
        }
        if mlc.len_of(Axis(2)) != 2 {
            return Err(DeliveryError::LengthMismatch {
                field: "mlc banks",
                found: mlc.len_of(Axis(2)),
                expected: 2,
            });
        }
        if jaw.len_of(Axis(1)) != 2 {
            return Err(DeliveryError::LengthMismatch {
                field: "jaw pair",
                found: jaw.len_of(Axis(1)),
                expected: 2,
            });
        }

        check_finite("monitor_units", monitor_units.iter())?;
        check_finite("gantry", gantry.iter())?;
        check_finite("collimator", collimator.iter())?;
        for (index, control_point) in mlc.outer_iter().enumerate() {
            if control_point.iter().any(|value| !value.is_finite()) {
                return Err(DeliveryError::NonFinite {
                    field: "mlc",
                    index,
                });
            }
        }
        for (index, pair) in jaw.outer_iter().enumerate() {
            if pair.iter().any(|value| !value.is_finite()) {
                return Err(DeliveryError::NonFinite {
                    field: "jaw",
                    index,
                });
            }
            if let Some(value) = pair.iter().find(|value| **value < 0.0) {
                return Err(DeliveryError::NegativeJaw {
                    index,
                    value: *value,
                });
            }
        }

        if let Some(first) = monitor_units.first() {
            if *first != 0.0 {
                return Err(DeliveryError::NonZeroStart(*first));
            }
        }
        for (index, pair) in monitor_units.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(DeliveryError::NonMonotonic {
                    index: index + 1,
                    previous: pair[0],
                    current: pair[1],
                });
            }
        }

        Ok(Self {
            monitor_units,
            gantry,
            collimator,
            mlc,
            jaw,
        })
    }

    /// A Delivery with no control points that still declares its leaf count
    pub fn empty(leaf_pairs: usize) -> Self {
        Self {
            monitor_units: Vec::new(),
            gantry: Vec::new(),
            collimator: Vec::new(),
            mlc: Array3::zeros((0, leaf_pairs, 2)),
            jaw: Array2::zeros((0, 2)),
        }
    }

    pub fn monitor_units(&self) -> &[f64] {
        &self.monitor_units
    }

    pub fn gantry(&self) -> &[f64] {
        &self.gantry
    }

    pub fn collimator(&self) -> &[f64] {
        &self.collimator
    }

    pub fn mlc(&self) -> &Array3<f64> {
        &self.mlc
    }

    pub fn jaw(&self) -> &Array2<f64> {
        &self.jaw
    }

    pub fn len(&self) -> usize {
        self.monitor_units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor_units.is_empty()
    }

    pub fn leaf_pair_count(&self) -> usize {
        self.mlc.len_of(Axis(1))
    }

    /// The total MU delivered, zero for an empty Delivery
    pub fn total_mu(&self) -> f64 {
        self.monitor_units.last().copied().unwrap_or(0.0)
    }

    /// Copy out the given control points. Monitor units are not rebased.
    fn select(&self, indices: &[usize]) -> Self {
        Self {
            monitor_units: indices.iter().map(|i| self.monitor_units[*i]).collect(),
            gantry: indices.iter().map(|i| self.gantry[*i]).collect(),
            collimator: indices.iter().map(|i| self.collimator[*i]).collect(),
            mlc: self.mlc.select(Axis(0), indices),
            jaw: self.jaw.select(Axis(0), indices),
        }
    }

    /// Drop control points that neither follow nor precede a change in MU.
    ///
    /// The first and last control points are kept whenever MU changes at all; a delivery
    /// that never delivers MU is reduced to its first control point.
    pub fn filter(&self) -> Self {
        let n_points = self.len();
        if n_points == 0 {
            return self.clone();
        }

        let steps: Vec<bool> = self
            .monitor_units
            .windows(2)
            .map(|pair| pair[1] != pair[0])
            .collect();

        let mut relevant = bitvec![0; n_points];
        if steps.iter().any(|changed| *changed) {
            relevant.set(0, true);
            relevant.set(n_points - 1, true);
            for (step, changed) in steps.iter().enumerate() {
                if *changed {
                    relevant.set(step, true);
                    relevant.set(step + 1, true);
                }
            }
        } else {
            relevant.set(0, true);
        }

        let indices: Vec<usize> = relevant.iter_ones().collect();
        log::debug!(
            "Filter kept {} of {} control points",
            indices.len(),
            n_points
        );
        self.select(&indices)
    }

    /// Keep every `skip_size`-th control point, starting with the first
    pub fn strip(&self, skip_size: usize) -> Result<Self, MaskError> {
        if skip_size == 0 {
            return Err(MaskError::ZeroSkipSize);
        }
        let indices: Vec<usize> = (0..self.len()).step_by(skip_size).collect();
        Ok(self.select(&indices))
    }

    /// Split out each contiguous run of control points whose gantry angle lies within
    /// `tolerance` degrees of `angle`. Each run has its MU rebased to start at zero.
    pub fn mask_by_gantry(&self, angle: f64, tolerance: f64) -> Result<Vec<Self>, MaskError> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(MaskError::BadTolerance(tolerance));
        }

        let mut runs: Vec<Vec<usize>> = Vec::new();
        let mut previous: Option<usize> = None;
        for (index, gantry) in self.gantry.iter().enumerate() {
            if (gantry - angle).abs() > tolerance {
                continue;
            }
            let extends_run = matches!(previous, Some(last) if last + 1 == index);
            if let (true, Some(run)) = (extends_run, runs.last_mut()) {
                run.push(index);
            } else {
                runs.push(vec![index]);
            }
            previous = Some(index);
        }

        if runs.is_empty() {
            return Err(MaskError::NoControlPoints { angle, tolerance });
        }

        Ok(runs
            .iter()
            .map(|run| {
                let mut masked = self.select(run);
                let start = masked.monitor_units[0];
                for mu in masked.monitor_units.iter_mut() {
                    *mu = round_decimals(*mu - start, REBASE_DECIMALS);
                }
                masked
            })
            .collect())
    }

    /// The MU delivered within each gantry window. Angles whose window captures no
    /// control points are skipped.
    pub fn metersets(&self, angles: &[f64], tolerance: f64) -> Result<Vec<f64>, MaskError> {
        let mut metersets = Vec::new();
        for angle in angles {
            match self.mask_by_gantry(*angle, tolerance) {
                Ok(runs) => metersets.push(runs.iter().map(|run| run.total_mu()).sum()),
                Err(MaskError::NoControlPoints { .. }) => {
                    log::debug!("No control points near gantry angle {angle}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(metersets)
    }
}

/// Build a Delivery from nested per control point values: `mlc[cp][pair] = [left, right]`
/// and `jaw[cp] = [Y1, Y2]`.
pub fn delivery_from_arrays(
    monitor_units: Vec<f64>,
    gantry: Vec<f64>,
    collimator: Vec<f64>,
    mlc: Vec<Vec<[f64; 2]>>,
    jaw: Vec<[f64; 2]>,
) -> Result<Delivery, DeliveryError> {
    let leaf_pairs = mlc.first().map(|cp| cp.len()).unwrap_or(0);
    let mut mlc_array = Array3::<f64>::zeros((mlc.len(), leaf_pairs, 2));
    for (index, (control_point, mut target)) in
        mlc.iter().zip(mlc_array.outer_iter_mut()).enumerate()
    {
        if control_point.len() != leaf_pairs {
            return Err(DeliveryError::LeafCountMismatch {
                index,
                found: control_point.len(),
                expected: leaf_pairs,
            });
        }
        for (pair, edges) in control_point.iter().enumerate() {
            target[[pair, 0]] = edges[0];
            target[[pair, 1]] = edges[1];
        }
    }

    let mut jaw_array = Array2::<f64>::zeros((jaw.len(), 2));
    for (pair, mut target) in jaw.iter().zip(jaw_array.outer_iter_mut()) {
        target[0] = pair[0];
        target[1] = pair[1];
    }

    Delivery::new(monitor_units, gantry, collimator, mlc_array, jaw_array)
}

/// Concatenate deliveries in order, offsetting each one's MU by the total delivered
/// before it. Empty deliveries are skipped.
pub fn merge(deliveries: &[Delivery]) -> Result<Delivery, DeliveryError> {
    let leaf_pairs = deliveries
        .iter()
        .find(|delivery| !delivery.is_empty())
        .or(deliveries.first())
        .map(|delivery| delivery.leaf_pair_count())
        .unwrap_or(0);

    let parts: Vec<&Delivery> = deliveries.iter().filter(|d| !d.is_empty()).collect();
    for part in parts.iter() {
        if part.leaf_pair_count() != leaf_pairs {
            return Err(DeliveryError::MergeLeafCountMismatch(
                leaf_pairs,
                part.leaf_pair_count(),
            ));
        }
    }

    let n_points: usize = parts.iter().map(|part| part.len()).sum();
    let mut merged = Delivery::empty(leaf_pairs);
    merged.mlc = Array3::zeros((n_points, leaf_pairs, 2));
    merged.jaw = Array2::zeros((n_points, 2));

    let mut offset = 0.0;
    let mut start = 0;
    for part in parts {
        let end = start + part.len();
        merged
            .monitor_units
            .extend(part.monitor_units.iter().map(|mu| mu + offset));
        merged.gantry.extend_from_slice(&part.gantry);
        merged.collimator.extend_from_slice(&part.collimator);
        merged.mlc.slice_mut(s![start..end, .., ..]).assign(&part.mlc);
        merged.jaw.slice_mut(s![start..end, ..]).assign(&part.jaw);
        offset += part.total_mu();
        start = end;
    }

    Ok(merged)
}

/// Cumulative MU from a sampled MU counter: the running sum of the positive part of each
/// step, starting from zero. Sensor dips never reduce the total.
pub fn cumulative_mu(samples: &[f64]) -> Vec<f64> {
    let mut total = 0.0;
    let mut cumulative = Vec::with_capacity(samples.len());
    if !samples.is_empty() {
        cumulative.push(0.0);
    }
    for pair in samples.windows(2) {
        total += (pair[1] - pair[0]).max(0.0);
        cumulative.push(total);
    }
    cumulative
}

/// Widest gantry tolerance that keeps the windows around each planned angle disjoint,
/// capped at the default tolerance.
pub fn gantry_tolerance_from_angles(angles: &[f64]) -> Result<f64, MaskError> {
    if angles.is_empty() {
        return Err(MaskError::TooFewAngles);
    }
    let mut sorted = angles.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let min_spacing = sorted
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold(f64::INFINITY, f64::min);

    let tolerance = (min_spacing / 2.0 - GANTRY_WINDOW_MARGIN).min(DEFAULT_GANTRY_TOLERANCE);
    if tolerance < 0.0 {
        return Err(MaskError::BadTolerance(tolerance));
    }
    Ok(tolerance)
}

fn round_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn check_finite<'a>(
    field: &'static str,
    values: impl Iterator<Item = &'a f64>,
) -> Result<(), DeliveryError> {
    for (index, value) in values.enumerate() {
        if !value.is_finite() {
            return Err(DeliveryError::NonFinite { field, index });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn static_delivery(monitor_units: Vec<f64>, gantry: Vec<f64>) -> Delivery {
        let n_points = monitor_units.len();
        delivery_from_arrays(
            monitor_units,
            gantry,
            vec![0.0; n_points],
            vec![vec![[10.0, 10.0]; 2]; n_points],
            vec![[10.0, 10.0]; n_points],
        )
        .unwrap()
    }

    #[test]
    fn fields_share_a_length() {
        let d = static_delivery(vec![0.0, 1.0, 2.0], vec![0.0; 3]);
        assert_eq!(d.len(), 3);
        assert_eq!(d.gantry().len(), 3);
        assert_eq!(d.collimator().len(), 3);
        assert_eq!(d.mlc().len_of(Axis(0)), 3);
        assert_eq!(d.jaw().len_of(Axis(0)), 3);
        assert_eq!(d.leaf_pair_count(), 2);
    }

    #[test]
    fn invalid_deliveries_are_rejected() {
        let result = delivery_from_arrays(
            vec![0.0, 1.0],
            vec![0.0],
            vec![0.0, 0.0],
            vec![vec![[0.0, 0.0]]; 2],
            vec![[0.0, 0.0]; 2],
        );
        assert_eq!(
            result,
            Err(DeliveryError::LengthMismatch {
                field: "gantry",
                found: 1,
                expected: 2
            })
        );

        let result = delivery_from_arrays(
            vec![0.0, 2.0, 1.0],
            vec![0.0; 3],
            vec![0.0; 3],
            vec![vec![[0.0, 0.0]]; 3],
            vec![[0.0, 0.0]; 3],
        );
        assert!(matches!(
            result,
            Err(DeliveryError::NonMonotonic { index: 2, .. })
        ));

        let result = delivery_from_arrays(
            vec![1.0],
            vec![0.0],
            vec![0.0],
            vec![vec![[0.0, 0.0]]],
            vec![[0.0, 0.0]],
        );
        assert_eq!(result, Err(DeliveryError::NonZeroStart(1.0)));

        let result = delivery_from_arrays(
            vec![0.0, 1.0],
            vec![0.0; 2],
            vec![0.0; 2],
            vec![vec![[0.0, 0.0]], vec![[0.0, 0.0], [0.0, 0.0]]],
            vec![[0.0, 0.0]; 2],
        );
        assert!(matches!(
            result,
            Err(DeliveryError::LeafCountMismatch { index: 1, .. })
        ));

        let result = delivery_from_arrays(
            vec![0.0],
            vec![0.0],
            vec![0.0],
            vec![vec![[0.0, 0.0]]],
            vec![[-1.0, 0.0]],
        );
        assert!(matches!(result, Err(DeliveryError::NegativeJaw { .. })));

        let result = delivery_from_arrays(
            vec![0.0],
            vec![f64::NAN],
            vec![0.0],
            vec![vec![[0.0, 0.0]]],
            vec![[0.0, 0.0]],
        );
        assert!(matches!(
            result,
            Err(DeliveryError::NonFinite {
                field: "gantry",
                ..
            })
        ));
    }

    #[test]
    fn filter_keeps_run_endpoints() {
        let d = static_delivery(
            vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 10.0],
            (0..7).map(|g| g as f64).collect(),
        );
        let filtered = d.filter();
        assert_eq!(filtered.gantry(), &[0.0, 2.0, 3.0, 5.0, 6.0]);
        assert_eq!(filtered.monitor_units(), &[0.0, 0.0, 5.0, 5.0, 10.0]);
    }

    #[test]
    fn filter_of_a_delivery_without_mu_keeps_the_first_point() {
        let d = static_delivery(vec![0.0; 4], vec![1.0, 2.0, 3.0, 4.0]);
        let filtered = d.filter();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.gantry(), &[1.0]);
    }

    #[test]
    fn merge_offsets_monitor_units() {
        let first = static_delivery(vec![0.0, 2.0, 5.0], vec![0.0; 3]);
        let second = static_delivery(vec![0.0, 1.0], vec![90.0; 2]);
        let merged = merge(&[first.clone(), second]).unwrap();
        assert_eq!(merged.monitor_units(), &[0.0, 2.0, 5.0, 5.0, 6.0]);
        assert_eq!(merged.monitor_units()[first.len()], first.total_mu());
        assert_eq!(merged.gantry(), &[0.0, 0.0, 0.0, 90.0, 90.0]);
        assert_eq!(merged.mlc().len_of(Axis(0)), 5);
    }

    #[test]
    fn empty_delivery_is_the_merge_identity() {
        let d = static_delivery(vec![0.0, 3.0], vec![0.0; 2]);
        let empty = Delivery::empty(2);
        assert_eq!(merge(&[empty.clone(), d.clone()]).unwrap(), d);
        assert_eq!(merge(&[d.clone(), empty.clone()]).unwrap(), d);
        assert_eq!(merge(&[empty.clone()]).unwrap(), empty);
        assert_eq!(empty.total_mu(), 0.0);
    }

    #[test]
    fn merge_rejects_mixed_leaf_counts() {
        let d = static_delivery(vec![0.0, 3.0], vec![0.0; 2]);
        let other = delivery_from_arrays(
            vec![0.0],
            vec![0.0],
            vec![0.0],
            vec![vec![[0.0, 0.0]; 3]],
            vec![[0.0, 0.0]],
        )
        .unwrap();
        assert_eq!(
            merge(&[d, other]),
            Err(DeliveryError::MergeLeafCountMismatch(2, 3))
        );
    }

    #[test]
    fn mask_splits_contiguous_runs() {
        let d = static_delivery(
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0.0, 0.5, 90.0, 90.0, 1.0, 0.0],
        );
        let runs = d.mask_by_gantry(0.0, 1.0).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].monitor_units(), &[0.0, 1.0]);
        assert_eq!(runs[1].monitor_units(), &[0.0, 1.0]);
        assert_eq!(runs[1].gantry(), &[1.0, 0.0]);

        let runs = d.mask_by_gantry(90.0, 1.0).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].monitor_units(), &[0.0, 1.0]);
    }

    #[test]
    fn mask_is_idempotent() {
        let d = static_delivery(
            vec![0.0, 0.1, 0.3, 0.6, 1.0],
            vec![-2.0, -1.0, 0.0, 1.0, 4.0],
        );
        let once = d.mask_by_gantry(0.0, 2.5).unwrap();
        let twice = once[0].mask_by_gantry(0.0, 2.5).unwrap();
        assert_eq!(twice.len(), 1);
        assert_eq!(once[0], twice[0]);
    }

    #[rstest]
    #[case(45.0, 3.0)]
    #[case(0.0, -1.0)]
    fn mask_domain_errors(#[case] angle: f64, #[case] tolerance: f64) {
        let d = static_delivery(vec![0.0, 1.0], vec![0.0, 0.0]);
        assert!(d.mask_by_gantry(angle, tolerance).is_err());
    }

    #[test]
    fn metersets_skip_empty_windows() {
        let first = static_delivery(vec![0.0, 20.0], vec![0.0; 2]);
        let second = static_delivery(vec![0.0, 30.0], vec![90.0; 2]);
        let merged = merge(&[first, second]).unwrap();
        let metersets = merged.metersets(&[0.0, 45.0, 90.0], 1.0).unwrap();
        assert_eq!(metersets, vec![20.0, 30.0]);
    }

    #[test]
    fn strip_subsamples() {
        let d = static_delivery(vec![0.0, 1.0, 2.0, 3.0, 4.0], vec![0.0; 5]);
        assert_eq!(d.strip(2).unwrap().monitor_units(), &[0.0, 2.0, 4.0]);
        assert_eq!(d.strip(1).unwrap(), d);
        assert_eq!(d.strip(0), Err(MaskError::ZeroSkipSize));
    }

    #[test]
    fn cumulative_mu_ignores_dips_and_is_idempotent() {
        let cumulative = cumulative_mu(&[0.5, 1.0, 0.9, 2.0, 2.0]);
        let expected = [0.0, 0.5, 0.5, 1.6, 1.6];
        for (value, expected) in cumulative.iter().zip(expected.iter()) {
            assert!((value - expected).abs() < 1e-12);
        }
        for (again, first) in cumulative_mu(&cumulative).iter().zip(cumulative.iter()) {
            assert!((again - first).abs() < 1e-12);
        }
        assert!(cumulative_mu(&[]).is_empty());
    }

    #[rstest]
    #[case(&[0.0, 90.0, 180.0], 3.0)]
    #[case(&[0.0, 4.0], 1.9)]
    #[case(&[30.0], 3.0)]
    fn tolerance_from_angles(#[case] angles: &[f64], #[case] expected: f64) {
        let tolerance = gantry_tolerance_from_angles(angles).unwrap();
        assert!((tolerance - expected).abs() < 1e-12);
    }

    #[test]
    fn tolerance_needs_distinct_angles() {
        assert_eq!(gantry_tolerance_from_angles(&[]), Err(MaskError::TooFewAngles));
        assert!(matches!(
            gantry_tolerance_from_angles(&[10.0, 10.0]),
            Err(MaskError::BadTolerance(_))
        ));
    }
}
