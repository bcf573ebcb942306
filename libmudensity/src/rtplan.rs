//! Reconstruction of a Delivery from the beams of a DICOM RT plan.
//!
//! Leaf jaw positions in a plan list bank A then bank B, leaf 1 first, with bank A edges
//! stored as signed coordinates. They map onto the delivery frame as
//! `mlc[p] = [B(L-p), -A(L-p)]`, and the ASYMY pair `[lower, upper]` maps to
//! `(Y1, Y2) = (upper, -lower)`.
use dicom::core::Tag;
use dicom::object::mem::InMemElement;
use dicom::object::{open_file, FileDicomObject, InMemDicomObject};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3};
use std::collections::BTreeMap;
use std::path::Path;

use super::angle::to_bipolar;
use super::delivery::{merge, Delivery};
use super::error::PlanError;
use super::machine::MachineDescriptor;

pub(crate) const MLC_DEVICE: &str = "MLCX";
pub(crate) const Y_JAW_DEVICE: &str = "ASYMY";
pub(crate) const X_JAW_DEVICE: &str = "ASYMX";

/// Read an RT plan from disk, keeping its file meta information for writing copies
pub fn open_plan(path: &Path) -> Result<FileDicomObject<InMemDicomObject>, PlanError> {
    let plan = open_file(path)?;
    log::info!("Read RT plan {}", path.display());
    Ok(plan)
}

/// Build the delivery of a fraction group: one Delivery per referenced beam, merged in
/// the order the fraction group references them.
///
/// The fraction group number may be omitted when the plan has exactly one.
pub fn delivery_from_plan(
    plan: &InMemDicomObject,
    fraction_group: Option<i32>,
) -> Result<Delivery, PlanError> {
    let group = fraction_group_item(plan, fraction_group)?;
    let mut beams = Vec::new();
    for (beam_number, meterset) in referenced_beams(group)? {
        let beam = beam_item(plan, beam_number)?;
        beams.push(delivery_from_beam(beam, meterset)?);
    }
    let delivery = merge(&beams)?;
    log::info!(
        "Extracted {} control points and {:.3} MU from {} beams",
        delivery.len(),
        delivery.total_mu(),
        beams.len()
    );
    Ok(delivery)
}

/// Build the delivery of every fraction group in the plan
pub fn delivery_from_plan_all(
    plan: &InMemDicomObject,
) -> Result<BTreeMap<i32, Delivery>, PlanError> {
    let mut deliveries = BTreeMap::new();
    for number in fraction_group_numbers(plan)? {
        deliveries.insert(number, delivery_from_plan(plan, Some(number))?);
    }
    Ok(deliveries)
}

/// Describe the MLC of the plan's first beam from its leaf position boundaries
pub fn machine_from_plan(plan: &InMemDicomObject) -> Result<MachineDescriptor, PlanError> {
    let beam = sequence(plan, tags::BEAM_SEQUENCE, "BeamSequence")?
        .first()
        .ok_or(PlanError::MissingAttribute("BeamSequence"))?;
    let devices = sequence(
        beam,
        tags::BEAM_LIMITING_DEVICE_SEQUENCE,
        "BeamLimitingDeviceSequence",
    )?;
    let mlc = devices
        .iter()
        .find(|device| device_type(device).as_deref() == Some(MLC_DEVICE))
        .ok_or(PlanError::MissingAttribute("BeamLimitingDeviceSequence MLCX"))?;
    let boundaries = floats(mlc, tags::LEAF_POSITION_BOUNDARIES, "LeafPositionBoundaries")?;
    // Boundaries ascend in y from leaf 1, so the top pair comes last
    let widths: Vec<f64> = boundaries
        .windows(2)
        .rev()
        .map(|pair| pair[1] - pair[0])
        .collect();
    MachineDescriptor::new("plan", widths)
        .map_err(|e| PlanError::BadValue("LeafPositionBoundaries", e.to_string()))
}

/// Numbers of all fraction groups in the plan, in plan order
pub fn fraction_group_numbers(plan: &InMemDicomObject) -> Result<Vec<i32>, PlanError> {
    sequence(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?
        .iter()
        .map(|group| int(group, tags::FRACTION_GROUP_NUMBER, "FractionGroupNumber"))
        .collect()
}

/// Resolve a fraction group by number, or the only one when no number is given
pub(crate) fn fraction_group_item(
    plan: &InMemDicomObject,
    fraction_group: Option<i32>,
) -> Result<&InMemDicomObject, PlanError> {
    let groups = sequence(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
    let numbers = fraction_group_numbers(plan)?;
    match fraction_group {
        Some(number) => numbers
            .iter()
            .position(|n| *n == number)
            .map(|index| &groups[index])
            .ok_or(PlanError::UnknownFractionGroup(number, numbers.clone())),
        None if groups.len() == 1 => Ok(&groups[0]),
        None => Err(PlanError::AmbiguousFractionGroup(numbers)),
    }
}

/// (beam number, beam meterset) of each beam referenced by a fraction group
pub(crate) fn referenced_beams(group: &InMemDicomObject) -> Result<Vec<(i32, f64)>, PlanError> {
    sequence(group, tags::REFERENCED_BEAM_SEQUENCE, "ReferencedBeamSequence")?
        .iter()
        .map(|reference| {
            Ok((
                int(reference, tags::REFERENCED_BEAM_NUMBER, "ReferencedBeamNumber")?,
                float(reference, tags::BEAM_METERSET, "BeamMeterset")?,
            ))
        })
        .collect()
}

pub(crate) fn beam_item(
    plan: &InMemDicomObject,
    beam_number: i32,
) -> Result<&InMemDicomObject, PlanError> {
    for beam in sequence(plan, tags::BEAM_SEQUENCE, "BeamSequence")? {
        if int(beam, tags::BEAM_NUMBER, "BeamNumber")? == beam_number {
            return Ok(beam);
        }
    }
    Err(PlanError::UnknownBeam(beam_number))
}

/// The delivery of a single beam scaled to the given meterset
pub fn delivery_from_beam(beam: &InMemDicomObject, meterset: f64) -> Result<Delivery, PlanError> {
    let leaf_pairs = check_collimation(beam)?;
    let final_weight = float(
        beam,
        tags::FINAL_CUMULATIVE_METERSET_WEIGHT,
        "FinalCumulativeMetersetWeight",
    )?;
    if final_weight == 0.0 {
        return Err(PlanError::ZeroFinalWeight);
    }

    let control_points = sequence(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;
    let n_points = control_points.len();
    let mut monitor_units = Vec::with_capacity(n_points);
    let mut gantry = Vec::with_capacity(n_points);
    let mut collimator = Vec::with_capacity(n_points);
    let mut mlc = Array3::<f64>::zeros((n_points, leaf_pairs, 2));
    let mut jaw = Array2::<f64>::zeros((n_points, 2));

    // Attributes unchanged since the previous control point may be omitted
    let mut state: Option<ControlPointState> = None;
    for (index, control_point) in control_points.iter().enumerate() {
        let weight = float(
            control_point,
            tags::CUMULATIVE_METERSET_WEIGHT,
            "CumulativeMetersetWeight",
        )?;
        monitor_units.push(meterset * weight / final_weight);

        let current = ControlPointState::read(control_point, state.as_ref())?;
        if current.leaf_positions.len() != 2 * leaf_pairs {
            return Err(PlanError::LeafPositionCount {
                found: current.leaf_positions.len(),
                expected: 2 * leaf_pairs,
            });
        }
        if current.jaw_positions.len() != 2 {
            return Err(PlanError::BadValue(
                "LeafJawPositions",
                format!("ASYMY has {} positions", current.jaw_positions.len()),
            ));
        }

        let (bank_a, bank_b) = current.leaf_positions.split_at(leaf_pairs);
        for pair in 0..leaf_pairs {
            let leaf = leaf_pairs - 1 - pair;
            mlc[[index, pair, 0]] = bank_b[leaf];
            mlc[[index, pair, 1]] = -bank_a[leaf];
        }
        jaw[[index, 0]] = current.jaw_positions[1];
        jaw[[index, 1]] = -current.jaw_positions[0];

        gantry.push(current.gantry);
        collimator.push(current.collimator);
        state = Some(current);
    }

    Ok(Delivery::new(
        monitor_units,
        to_bipolar(&gantry)?,
        to_bipolar(&collimator)?,
        mlc,
        jaw,
    )?)
}

/// Machine state at a control point after carrying omitted attributes forward
struct ControlPointState {
    gantry: f64,
    collimator: f64,
    jaw_positions: Vec<f64>,
    leaf_positions: Vec<f64>,
}

impl ControlPointState {
    fn read(
        control_point: &InMemDicomObject,
        previous: Option<&Self>,
    ) -> Result<Self, PlanError> {
        let gantry = match optional_float(control_point, tags::GANTRY_ANGLE, "GantryAngle")? {
            Some(value) => value,
            None => previous
                .map(|p| p.gantry)
                .ok_or(PlanError::MissingAttribute("GantryAngle"))?,
        };
        let collimator = match optional_float(
            control_point,
            tags::BEAM_LIMITING_DEVICE_ANGLE,
            "BeamLimitingDeviceAngle",
        )? {
            Some(value) => value,
            None => previous
                .map(|p| p.collimator)
                .ok_or(PlanError::MissingAttribute("BeamLimitingDeviceAngle"))?,
        };

        let positions = control_point
            .get(tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE)
            .and_then(|element| element.items())
            .unwrap_or(&[]);
        let mut jaw_positions = previous.map(|p| p.jaw_positions.clone());
        let mut leaf_positions = previous.map(|p| p.leaf_positions.clone());
        for position in positions {
            match device_type(position).as_deref() {
                Some(Y_JAW_DEVICE) => {
                    jaw_positions =
                        Some(floats(position, tags::LEAF_JAW_POSITIONS, "LeafJawPositions")?)
                }
                Some(MLC_DEVICE) => {
                    leaf_positions =
                        Some(floats(position, tags::LEAF_JAW_POSITIONS, "LeafJawPositions")?)
                }
                _ => (),
            }
        }

        Ok(Self {
            gantry,
            collimator,
            jaw_positions: jaw_positions
                .ok_or(PlanError::MissingAttribute("BeamLimitingDevicePositionSequence ASYMY"))?,
            leaf_positions: leaf_positions
                .ok_or(PlanError::MissingAttribute("BeamLimitingDevicePositionSequence MLCX"))?,
        })
    }
}

/// Check the beam is collimated by MLCX and ASYMY (ASYMX is ignored) and return the
/// number of MLC leaf pairs
fn check_collimation(beam: &InMemDicomObject) -> Result<usize, PlanError> {
    let devices = sequence(
        beam,
        tags::BEAM_LIMITING_DEVICE_SEQUENCE,
        "BeamLimitingDeviceSequence",
    )?;
    let mut types: Vec<String> = devices
        .iter()
        .map(|device| device_type(device).unwrap_or_default())
        .collect();
    types.sort();

    let supported =
        types == [X_JAW_DEVICE, Y_JAW_DEVICE, MLC_DEVICE] || types == [Y_JAW_DEVICE, MLC_DEVICE];
    if !supported {
        return Err(PlanError::UnsupportedCollimation(types));
    }

    let mlc = devices
        .iter()
        .find(|device| device_type(device).as_deref() == Some(MLC_DEVICE))
        .ok_or(PlanError::MissingAttribute("BeamLimitingDeviceSequence MLCX"))?;
    let pairs = int(mlc, tags::NUMBER_OF_LEAF_JAW_PAIRS, "NumberOfLeafJawPairs")?;
    usize::try_from(pairs)
        .map_err(|_| PlanError::BadValue("NumberOfLeafJawPairs", pairs.to_string()))
}

pub(crate) fn device_type(item: &InMemDicomObject) -> Option<String> {
    item.get(tags::RT_BEAM_LIMITING_DEVICE_TYPE)
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim().to_string())
}

pub(crate) fn sequence<'a>(
    object: &'a InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<&'a [InMemDicomObject], PlanError> {
    element(object, tag, name)?
        .items()
        .ok_or_else(|| PlanError::BadValue(name, String::from("not a sequence")))
}

fn element<'a>(
    object: &'a InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<&'a InMemElement, PlanError> {
    object.get(tag).ok_or(PlanError::MissingAttribute(name))
}

pub(crate) fn float(
    object: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<f64, PlanError> {
    element(object, tag, name)?
        .to_float64()
        .map_err(|e| PlanError::BadValue(name, e.to_string()))
}

fn optional_float(
    object: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<Option<f64>, PlanError> {
    match object.get(tag) {
        Some(element) => element
            .to_float64()
            .map(Some)
            .map_err(|e| PlanError::BadValue(name, e.to_string())),
        None => Ok(None),
    }
}

fn floats(object: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Vec<f64>, PlanError> {
    element(object, tag, name)?
        .to_multi_float64()
        .map_err(|e| PlanError::BadValue(name, e.to_string()))
}

pub(crate) fn int(
    object: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<i32, PlanError> {
    element(object, tag, name)?
        .to_int::<i32>()
        .map_err(|e| PlanError::BadValue(name, e.to_string()))
}
