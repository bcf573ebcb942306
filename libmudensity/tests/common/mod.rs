#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use dicom::core::VR;
use dicom::object::meta::FileMetaTableBuilder;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use std::path::Path;

use libmudensity::plan_writer::{put_decimals, put_sequence, put_text};

pub const LEAF_PAIRS: usize = 80;

const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
const RT_PLAN_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.5";

/// One sample of an Agility treatment record; every leaf pair shares the same positions
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub mu: f64,
    pub gantry: f64,
    pub y1_jaw: f64,
    pub y2_jaw: f64,
    pub y1_leaf: f64,
    pub y2_leaf: f64,
}

impl Sample {
    /// A square field of the given half width at a gantry angle (IEC)
    pub fn square(mu: f64, gantry: f64, half_width: f64) -> Self {
        Self {
            mu,
            gantry,
            y1_jaw: half_width,
            y2_jaw: half_width,
            y1_leaf: half_width,
            y2_leaf: half_width,
        }
    }
}

fn channel_names() -> Vec<String> {
    let mut names = vec![
        String::from("Step Dose/Actual Value (Mu)"),
        String::from("Step Gantry/Scaled Actual (deg)"),
        String::from("Step Collimator/Scaled Actual (deg)"),
        String::from("Y1 Diaphragm/Scaled Actual (mm)"),
        String::from("Y2 Diaphragm/Scaled Actual (mm)"),
    ];
    for bank in ["Y1", "Y2"] {
        for leaf in 1..=LEAF_PAIRS {
            names.push(format!("{bank} Leaf {leaf}/Scaled Actual (mm)"));
        }
    }
    names
}

/// Encode samples as a TRF with one i16 channel per value at a scale of 0.1
pub fn trf_bytes(samples: &[Sample]) -> Vec<u8> {
    let names = channel_names();
    let mut contents = b"\t19/06/14 13:05:22 Z\t+10:00\tG1/6X\tLA1\tTRF3;0.04".to_vec();
    for name in names.iter() {
        contents.extend_from_slice(format!(";{name}=i16:0.1:0").as_bytes());
    }
    for index in 0..names.len() {
        contents.extend_from_slice(&[b'\t', 0xdc, 0x00, 0x20 + (index % 0x50) as u8]);
    }
    contents.extend_from_slice(&[b'\t', 0xdc, 0x00]);

    let raw = |value: f64| (value * 10.0).round() as i16;
    for sample in samples {
        let mut record = vec![
            raw(sample.mu),
            raw(sample.gantry),
            0,
            raw(sample.y1_jaw),
            raw(sample.y2_jaw),
        ];
        record.extend(std::iter::repeat(raw(sample.y1_leaf)).take(LEAF_PAIRS));
        record.extend(std::iter::repeat(raw(sample.y2_leaf)).take(LEAF_PAIRS));
        for value in record {
            contents.write_i16::<LittleEndian>(value).unwrap();
        }
    }
    contents
}

pub fn write_trf(path: &Path, samples: &[Sample]) {
    std::fs::write(path, trf_bytes(samples)).unwrap();
}

fn device(kind: &str, pairs: usize) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    put_text(&mut item, tags::RT_BEAM_LIMITING_DEVICE_TYPE, VR::CS, kind);
    put_text(&mut item, tags::NUMBER_OF_LEAF_JAW_PAIRS, VR::IS, &pairs.to_string());
    if kind == "MLCX" {
        let boundaries: Vec<f64> = (0..=pairs).map(|i| i as f64 * 5.0 - 200.0).collect();
        put_decimals(&mut item, tags::LEAF_POSITION_BOUNDARIES, &boundaries);
    }
    item
}

fn position(kind: &str, values: &[f64]) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    put_text(&mut item, tags::RT_BEAM_LIMITING_DEVICE_TYPE, VR::CS, kind);
    put_decimals(&mut item, tags::LEAF_JAW_POSITIONS, values);
    item
}

/// A static square beam on an Agility head
pub fn square_beam(number: i32, gantry: f64, half_width: f64) -> InMemDicomObject {
    let mut beam = InMemDicomObject::new_empty();
    put_text(&mut beam, tags::BEAM_NUMBER, VR::IS, &number.to_string());
    put_text(&mut beam, tags::BEAM_NAME, VR::LO, &format!("G{gantry}"));
    put_decimals(&mut beam, tags::FINAL_CUMULATIVE_METERSET_WEIGHT, &[1.0]);
    put_text(&mut beam, tags::NUMBER_OF_CONTROL_POINTS, VR::IS, "2");
    put_sequence(
        &mut beam,
        tags::BEAM_LIMITING_DEVICE_SEQUENCE,
        vec![device("ASYMX", 1), device("ASYMY", 1), device("MLCX", LEAF_PAIRS)],
    );

    let mut leaves = vec![-half_width; LEAF_PAIRS];
    leaves.extend(vec![half_width; LEAF_PAIRS]);
    let control_points = [0.0, 1.0]
        .iter()
        .enumerate()
        .map(|(index, weight)| {
            let mut item = InMemDicomObject::new_empty();
            put_text(&mut item, tags::CONTROL_POINT_INDEX, VR::IS, &index.to_string());
            put_decimals(&mut item, tags::CUMULATIVE_METERSET_WEIGHT, &[*weight]);
            if index == 0 {
                put_decimals(&mut item, tags::GANTRY_ANGLE, &[gantry]);
                put_text(&mut item, tags::GANTRY_ROTATION_DIRECTION, VR::CS, "NONE");
                put_decimals(&mut item, tags::BEAM_LIMITING_DEVICE_ANGLE, &[0.0]);
                put_sequence(
                    &mut item,
                    tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
                    vec![
                        position("ASYMX", &[-half_width, half_width]),
                        position("ASYMY", &[-half_width, half_width]),
                        position("MLCX", &leaves),
                    ],
                );
            }
            item
        })
        .collect();
    put_sequence(&mut beam, tags::CONTROL_POINT_SEQUENCE, control_points);
    beam
}

/// A plan with one fraction group referencing every beam with the given metersets
pub fn plan(beams: Vec<(InMemDicomObject, f64)>) -> InMemDicomObject {
    let mut plan = InMemDicomObject::new_empty();
    put_text(&mut plan, tags::SOP_CLASS_UID, VR::UI, RT_PLAN_STORAGE);
    put_text(&mut plan, tags::SOP_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.2.1125.1");
    put_text(&mut plan, tags::MODALITY, VR::CS, "RTPLAN");

    let mut references = Vec::new();
    let mut items = Vec::new();
    for (index, (beam, meterset)) in beams.into_iter().enumerate() {
        let mut reference = InMemDicomObject::new_empty();
        put_text(&mut reference, tags::REFERENCED_BEAM_NUMBER, VR::IS, &(index + 1).to_string());
        put_decimals(&mut reference, tags::BEAM_METERSET, &[meterset]);
        references.push(reference);
        items.push(beam);
    }

    let mut group = InMemDicomObject::new_empty();
    put_text(&mut group, tags::FRACTION_GROUP_NUMBER, VR::IS, "1");
    put_text(&mut group, tags::NUMBER_OF_BEAMS, VR::IS, &items.len().to_string());
    put_sequence(&mut group, tags::REFERENCED_BEAM_SEQUENCE, references);

    put_sequence(&mut plan, tags::BEAM_SEQUENCE, items);
    put_sequence(&mut plan, tags::FRACTION_GROUP_SEQUENCE, vec![group]);
    plan
}

pub fn write_plan_file(path: &Path, plan: InMemDicomObject) {
    let file = plan
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(RT_PLAN_STORAGE)
                .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1"),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}
