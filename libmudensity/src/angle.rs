//! Conversion between IEC angles in [0, 360) and bipolar angles in [-180, 180].
//!
//! A sample of exactly 180 degrees is ambiguous when a delivery rotates through the
//! branch cut. Such samples take the sign of their nearest non-180 neighbours, which
//! must agree; otherwise the conversion fails and the caller has to disambiguate.
use super::error::AngleError;

const HALF_TURN: f64 = 180.0;
const FULL_TURN: f64 = 360.0;

/// Convert a sequence of IEC angles to bipolar form
pub fn to_bipolar(angles: &[f64]) -> Result<Vec<f64>, AngleError> {
    if angles.iter().all(|angle| *angle == HALF_TURN) {
        return Ok(angles.to_vec());
    }

    let mut bipolar: Vec<f64> = angles
        .iter()
        .map(|angle| {
            if *angle > HALF_TURN {
                angle - FULL_TURN
            } else {
                *angle
            }
        })
        .collect();

    let resolved: Vec<(usize, f64)> = bipolar
        .iter()
        .enumerate()
        .filter(|(_, angle)| **angle == HALF_TURN)
        .map(|(index, _)| Ok((index, resolve_half_turn(&bipolar, index)?)))
        .collect::<Result<_, AngleError>>()?;

    for (index, value) in resolved {
        bipolar[index] = value;
    }

    Ok(bipolar)
}

/// Convert a single bipolar angle back to IEC form
pub fn to_iec(angle: f64) -> f64 {
    if angle < 0.0 {
        angle + FULL_TURN
    } else {
        angle
    }
}

/// Rotation direction of each step as written to RT plans: the direction towards the
/// next sample, NONE for the final sample or no movement.
pub fn rotation_directions(bipolar: &[f64]) -> Vec<&'static str> {
    let mut directions: Vec<&'static str> = bipolar
        .windows(2)
        .map(|pair| {
            let diff = pair[1] - pair[0];
            if diff > 0.0 {
                "CW"
            } else if diff < 0.0 {
                "CC"
            } else {
                "NONE"
            }
        })
        .collect();
    if !bipolar.is_empty() {
        directions.push("NONE");
    }
    directions
}

fn resolve_half_turn(bipolar: &[f64], index: usize) -> Result<f64, AngleError> {
    let left = bipolar[..index]
        .iter()
        .rev()
        .find(|angle| **angle != HALF_TURN)
        .copied();
    let right = bipolar[index + 1..]
        .iter()
        .find(|angle| **angle != HALF_TURN)
        .copied();

    // At least one neighbour exists since not every sample is 180
    let (left, right) = match (left, right) {
        (Some(l), Some(r)) => (l, r),
        (Some(l), None) => (l, l),
        (None, Some(r)) => (r, r),
        (None, None) => return Ok(HALF_TURN),
    };

    let left_positive = left >= 0.0;
    let right_positive = right >= 0.0;
    if left_positive != right_positive {
        return Err(AngleError::AmbiguousHalfTurn { index, left, right });
    }

    if left_positive {
        Ok(HALF_TURN)
    } else {
        Ok(-HALF_TURN)
    }
}
