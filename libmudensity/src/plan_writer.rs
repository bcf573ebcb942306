use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom_dictionary_std::tags;
use std::path::Path;

use super::angle::{rotation_directions, to_bipolar, to_iec};
use super::constants::{DEFAULT_GANTRY_TOLERANCE, PLAN_DECIMALS};
use super::delivery::{gantry_tolerance_from_angles, merge, Delivery};
use super::error::{MaskError, PlanError};
use super::rtplan::{
    beam_item, device_type, float, fraction_group_item, referenced_beams, sequence, MLC_DEVICE,
    X_JAW_DEVICE, Y_JAW_DEVICE,
};

/// A template beam paired with the portion of the delivery replayed into it
struct BeamReplay<'a> {
    number: i32,
    template: &'a InMemDicomObject,
    delivery: Delivery,
}

/// Write a delivery into a copy of the template plan.
///
/// The delivery is filtered, then split between the beams of the fraction group by gantry
/// angle. Each template beam must hold a fixed gantry angle. The window around each angle
/// is as wide as the beam spacing allows, and every filtered control point must land in
/// exactly one window.
pub fn to_plan(
    delivery: &Delivery,
    template: &InMemDicomObject,
    fraction_group: Option<i32>,
) -> Result<InMemDicomObject, PlanError> {
    let group = fraction_group_item(template, fraction_group)?;
    let references = referenced_beams(group)?;

    let mut beams = Vec::with_capacity(references.len());
    let mut angles = Vec::with_capacity(references.len());
    for (number, _) in references.iter() {
        let beam = beam_item(template, *number)?;
        angles.push(fixed_gantry_angle(beam, *number)?);
        beams.push((*number, beam));
    }
    let tolerance = gantry_tolerance_from_angles(&angles)?;
    log::debug!(
        "Replaying delivery into {} beams with a gantry window of {tolerance} degrees",
        beams.len()
    );

    let filtered = delivery.filter();
    let mut captured = 0;
    let mut replays = Vec::with_capacity(beams.len());
    for ((number, beam), angle) in beams.into_iter().zip(angles.iter()) {
        let runs = filtered.mask_by_gantry(*angle, tolerance)?;
        captured += runs.iter().map(|run| run.len()).sum::<usize>();
        replays.push(BeamReplay {
            number,
            template: beam,
            delivery: merge(&runs)?,
        });
    }
    if captured != filtered.len() {
        return Err(MaskError::UncapturedControlPoints {
            count: filtered.len().saturating_sub(captured),
            tolerance,
        }
        .into());
    }

    build_plan(template, group, &replays)
}

/// Write the part of a delivery recorded around one gantry angle into a single beam plan.
///
/// The beam of the fraction group nearest the requested angle serves as the template.
pub fn to_single_beam_plan(
    delivery: &Delivery,
    template: &InMemDicomObject,
    gantry_angle: f64,
    fraction_group: Option<i32>,
) -> Result<InMemDicomObject, PlanError> {
    let group = fraction_group_item(template, fraction_group)?;

    let mut nearest: Option<(f64, i32, &InMemDicomObject)> = None;
    for (number, _) in referenced_beams(group)? {
        let beam = beam_item(template, number)?;
        let distance = (fixed_gantry_angle(beam, number)? - gantry_angle).abs();
        if nearest.map_or(true, |(best, _, _)| distance < best) {
            nearest = Some((distance, number, beam));
        }
    }
    let (_, number, beam) = nearest.ok_or(PlanError::MissingAttribute("ReferencedBeamSequence"))?;

    let runs = delivery
        .filter()
        .mask_by_gantry(gantry_angle, DEFAULT_GANTRY_TOLERANCE)?;
    let replay = BeamReplay {
        number,
        template: beam,
        delivery: merge(&runs)?,
    };
    build_plan(template, group, &[replay])
}

/// Save a plan using the file meta information of the file it was templated from
pub fn write_plan(
    template: &FileDicomObject<InMemDicomObject>,
    plan: InMemDicomObject,
    path: &Path,
) -> Result<(), PlanError> {
    let mut output = template.clone();
    *output = plan;
    output.write_to_file(path)?;
    log::info!("Wrote RT plan to {}", path.display());
    Ok(())
}

/// The gantry angle of a beam in bipolar form, erroring if the beam rotates
fn fixed_gantry_angle(beam: &InMemDicomObject, number: i32) -> Result<f64, PlanError> {
    let control_points = sequence(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;
    let mut angles = Vec::new();
    for control_point in control_points {
        if control_point.get(tags::GANTRY_ANGLE).is_some() {
            angles.push(float(control_point, tags::GANTRY_ANGLE, "GantryAngle")?);
        }
    }
    let first = *angles.first().ok_or(PlanError::MissingAttribute("GantryAngle"))?;
    if angles.iter().any(|angle| *angle != first) {
        return Err(PlanError::RotatingBeam(number));
    }
    Ok(to_bipolar(&[first])?[0])
}

fn build_plan(
    template: &InMemDicomObject,
    group: &InMemDicomObject,
    replays: &[BeamReplay],
) -> Result<InMemDicomObject, PlanError> {
    let mut beams = Vec::with_capacity(replays.len());
    let mut references = Vec::with_capacity(replays.len());
    for replay in replays {
        beams.push(build_beam(replay)?);

        let mut reference = InMemDicomObject::new_empty();
        put_text(&mut reference, tags::REFERENCED_BEAM_NUMBER, VR::IS, &replay.number.to_string());
        put_decimals(&mut reference, tags::BEAM_METERSET, &[replay.delivery.total_mu()]);
        references.push(reference);
    }

    let mut group = group.clone();
    put_text(&mut group, tags::NUMBER_OF_BEAMS, VR::IS, &replays.len().to_string());
    put_sequence(&mut group, tags::REFERENCED_BEAM_SEQUENCE, references);

    let mut plan = template.clone();
    put_sequence(&mut plan, tags::BEAM_SEQUENCE, beams);
    put_sequence(&mut plan, tags::FRACTION_GROUP_SEQUENCE, vec![group]);
    Ok(plan)
}

fn build_beam(replay: &BeamReplay) -> Result<InMemDicomObject, PlanError> {
    let delivery = &replay.delivery;
    let total = delivery.total_mu();
    if total == 0.0 {
        return Err(PlanError::ZeroFinalWeight);
    }

    let template_points = sequence(
        replay.template,
        tags::CONTROL_POINT_SEQUENCE,
        "ControlPointSequence",
    )?;
    let first_template = template_points
        .first()
        .ok_or(PlanError::MissingAttribute("ControlPointSequence"))?;
    // ASYMX is not part of a delivery; keep whatever the template holds
    let x_jaw: Vec<InMemDicomObject> = first_template
        .get(tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE)
        .and_then(|element| element.items())
        .unwrap_or(&[])
        .iter()
        .filter(|item| device_type(item).as_deref() == Some(X_JAW_DEVICE))
        .cloned()
        .collect();

    let gantry_directions = rotation_directions(delivery.gantry());
    let collimator_directions = rotation_directions(delivery.collimator());
    let leaf_pairs = delivery.leaf_pair_count();

    let mut control_points = Vec::with_capacity(delivery.len());
    for index in 0..delivery.len() {
        // Attributes beyond the machine state come from the template's first and last
        // control points
        let mut control_point = if index == 0 {
            first_template.clone()
        } else if index + 1 == delivery.len() && template_points.len() > 1 {
            template_points[template_points.len() - 1].clone()
        } else {
            InMemDicomObject::new_empty()
        };
        put_text(&mut control_point, tags::CONTROL_POINT_INDEX, VR::IS, &index.to_string());
        put_decimals(
            &mut control_point,
            tags::CUMULATIVE_METERSET_WEIGHT,
            &[delivery.monitor_units()[index] / total],
        );
        put_decimals(&mut control_point, tags::GANTRY_ANGLE, &[to_iec(delivery.gantry()[index])]);
        put_text(
            &mut control_point,
            tags::GANTRY_ROTATION_DIRECTION,
            VR::CS,
            gantry_directions[index],
        );
        put_decimals(
            &mut control_point,
            tags::BEAM_LIMITING_DEVICE_ANGLE,
            &[to_iec(delivery.collimator()[index])],
        );
        put_text(
            &mut control_point,
            tags::BEAM_LIMITING_DEVICE_ROTATION_DIRECTION,
            VR::CS,
            collimator_directions[index],
        );

        let jaw = delivery.jaw();
        let mlc = delivery.mlc();
        let mut bank_a = Vec::with_capacity(2 * leaf_pairs);
        let mut bank_b = Vec::with_capacity(leaf_pairs);
        for pair in (0..leaf_pairs).rev() {
            bank_a.push(-mlc[[index, pair, 1]]);
            bank_b.push(mlc[[index, pair, 0]]);
        }
        bank_a.extend(bank_b);

        let mut positions = x_jaw.clone();
        positions.push(device_position(
            Y_JAW_DEVICE,
            &[-jaw[[index, 1]], jaw[[index, 0]]],
        ));
        positions.push(device_position(MLC_DEVICE, &bank_a));
        put_sequence(
            &mut control_point,
            tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
            positions,
        );
        control_points.push(control_point);
    }

    let mut beam = replay.template.clone();
    put_text(
        &mut beam,
        tags::NUMBER_OF_CONTROL_POINTS,
        VR::IS,
        &control_points.len().to_string(),
    );
    put_decimals(&mut beam, tags::FINAL_CUMULATIVE_METERSET_WEIGHT, &[1.0]);
    put_sequence(&mut beam, tags::CONTROL_POINT_SEQUENCE, control_points);
    Ok(beam)
}

fn device_position(kind: &str, positions: &[f64]) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    put_text(&mut item, tags::RT_BEAM_LIMITING_DEVICE_TYPE, VR::CS, kind);
    put_decimals(&mut item, tags::LEAF_JAW_POSITIONS, positions);
    item
}

/// Put a decimal string attribute, one value per entry
pub fn put_decimals(object: &mut InMemDicomObject, tag: Tag, values: &[f64]) {
    let strings: Vec<String> = values
        .iter()
        .map(|value| format!("{value:.PLAN_DECIMALS$}"))
        .collect();
    object.put(DataElement::new(
        tag,
        VR::DS,
        PrimitiveValue::Strs(strings.into_iter().collect()),
    ));
}

/// Put a single valued text attribute
pub fn put_text(object: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    object.put(DataElement::new(tag, vr, PrimitiveValue::from(value.to_string())));
}

/// Put a sequence attribute holding the given items
pub fn put_sequence(object: &mut InMemDicomObject, tag: Tag, items: Vec<InMemDicomObject>) {
    object.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtplan::delivery_from_plan;
    use crate::rtplan::testing::*;

    fn two_beam_template() -> InMemDicomObject {
        plan(
            vec![open_beam(1, 4, 0.0, 50.0), open_beam(2, 4, 90.0, 50.0)],
            &[(1, vec![(1, 50.0), (2, 50.0)])],
        )
    }

    fn assert_close(found: &[f64], expected: &[f64]) {
        assert_eq!(found.len(), expected.len());
        for (f, e) in found.iter().zip(expected.iter()) {
            assert!((f - e).abs() < 1e-6, "{found:?} != {expected:?}");
        }
    }

    #[test]
    fn replays_a_delivery_into_the_template() {
        let template = two_beam_template();
        let delivery = delivery_from_plan(&template, None).unwrap();
        let plan = to_plan(&delivery, &template, None).unwrap();
        let replayed = delivery_from_plan(&plan, None).unwrap();

        assert_close(replayed.monitor_units(), delivery.monitor_units());
        assert_close(replayed.gantry(), delivery.gantry());
        assert_eq!(replayed.mlc(), delivery.mlc());
        assert_eq!(replayed.jaw(), delivery.jaw());
    }

    #[test]
    fn writes_metersets_and_directions() {
        let template = two_beam_template();
        let delivery = delivery_from_plan(&template, None).unwrap();
        let plan = to_plan(&delivery, &template, None).unwrap();

        let group = fraction_group_item(&plan, Some(1)).unwrap();
        let references = referenced_beams(group).unwrap();
        assert_eq!(references, vec![(1, 50.0), (2, 50.0)]);

        let beam = beam_item(&plan, 2).unwrap();
        let control_points = sequence(beam, tags::CONTROL_POINT_SEQUENCE, "").unwrap();
        assert_eq!(control_points.len(), 2);
        let direction = control_points[1]
            .get(tags::GANTRY_ROTATION_DIRECTION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(direction.trim(), "NONE");
        let weight = control_points[1]
            .get(tags::CUMULATIVE_METERSET_WEIGHT)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(weight.trim(), "1.000000");
    }

    #[test]
    fn control_points_between_beams_are_reported() {
        let template = two_beam_template();
        let stray = plan(vec![open_beam(1, 4, 45.0, 50.0)], &[(1, vec![(1, 10.0)])]);
        let delivery = merge(&[
            delivery_from_plan(&template, None).unwrap(),
            delivery_from_plan(&stray, None).unwrap(),
        ])
        .unwrap();
        assert!(matches!(
            to_plan(&delivery, &template, None),
            Err(PlanError::MaskError(MaskError::UncapturedControlPoints { count: 2, .. }))
        ));
    }

    #[test]
    fn rotating_template_beams_are_rejected() {
        let control_point = |weight: f64, gantry: f64| ControlPoint {
            weight,
            gantry,
            jaw: [-50.0, 50.0],
            bank_a: vec![-50.0; 4],
            bank_b: vec![50.0; 4],
        };
        let arc = beam(1, 4, &[control_point(0.0, 0.0), control_point(1.0, 10.0)]);
        let template = plan(vec![arc], &[(1, vec![(1, 10.0)])]);
        let delivery = delivery_from_plan(&template, None).unwrap();
        assert!(matches!(
            to_plan(&delivery, &template, None),
            Err(PlanError::RotatingBeam(1))
        ));
    }

    #[test]
    fn single_beam_uses_the_nearest_template_beam() {
        let template = two_beam_template();
        let delivery = delivery_from_plan(&template, None).unwrap();
        let plan = to_single_beam_plan(&delivery, &template, 88.5, None).unwrap();

        let beams = sequence(&plan, tags::BEAM_SEQUENCE, "").unwrap();
        assert_eq!(beams.len(), 1);
        let group = fraction_group_item(&plan, None).unwrap();
        assert_eq!(referenced_beams(group).unwrap(), vec![(2, 50.0)]);
    }

    #[test]
    fn single_beam_without_samples_fails() {
        let template = two_beam_template();
        let delivery = delivery_from_plan(&template, None).unwrap();
        assert!(matches!(
            to_single_beam_plan(&delivery, &template, 180.0, None),
            Err(PlanError::MaskError(MaskError::NoControlPoints { .. }))
        ));
    }
}
