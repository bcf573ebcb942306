use ndarray::{Array2, Array3};
use std::path::Path;

use super::angle::to_bipolar;
use super::constants::*;
use super::delivery::{cumulative_mu, Delivery};
use super::error::{DeliveryError, MachineError, TrfFileError, TrfTableError};
use super::machine::{LeafBank, MachineDescriptor};
use super::trf_header::{
    decode_header, decode_layout, determine_header_length, Header, TableLayout,
};
use super::trf_table::TrfTable;

/// A fully decoded treatment record file.
///
/// The whole file is read into memory up front; decoding never returns to the file system.
#[derive(Debug, Clone)]
pub struct TrfFile {
    pub header: Header,
    pub layout: TableLayout,
    pub table: TrfTable,
    pub machine: MachineDescriptor,
}

impl TrfFile {
    /// Read and decode the TRF at path.
    ///
    /// If no machine is given, one is chosen from the number of leaf channels in the file.
    pub fn open(path: &Path, machine: Option<&MachineDescriptor>) -> Result<Self, TrfFileError> {
        let contents =
            std::fs::read(path).map_err(|e| TrfFileError::BadFilePath(path.to_path_buf(), e))?;
        log::info!(
            "Read {} from {}",
            human_bytes::human_bytes(contents.len() as f64),
            path.display()
        );
        Self::from_bytes(&contents, machine)
    }

    /// Decode a TRF already held in memory
    pub fn from_bytes(
        contents: &[u8],
        machine: Option<&MachineDescriptor>,
    ) -> Result<Self, TrfFileError> {
        let header_length = determine_header_length(contents)?;
        let header_contents = &contents[..header_length];
        let header = decode_header(header_contents)?;
        let layout = decode_layout(header_contents)?;

        // Canonical names do not depend on the leaf count
        let naming = machine.cloned().unwrap_or_else(MachineDescriptor::agility);
        let table = TrfTable::decode(&contents[header_length..], &layout, &naming)?;

        let leaf_pairs = MachineDescriptor::count_leaf_columns(
            table.column_names().iter().map(|name| name.as_str()),
        );
        let machine = match machine {
            Some(machine) if machine.leaf_pair_count() == leaf_pairs => machine.clone(),
            Some(_) => {
                let error = MachineError::UnsupportedLeafCount(leaf_pairs);
                return Err(TrfTableError::from(error).into());
            }
            None => MachineDescriptor::from_leaf_count(leaf_pairs).map_err(TrfTableError::from)?,
        };

        log::debug!(
            "Decoded {} samples of {} channels for field {:?} on {}",
            table.n_samples(),
            layout.channels.len(),
            header.field_name,
            header.machine
        );

        Ok(Self {
            header,
            layout,
            table,
            machine,
        })
    }

    /// Reconstruct the delivery recorded in the table
    pub fn delivery(&self) -> Result<Delivery, TrfFileError> {
        let table = &self.table;
        let raw_mu: Vec<f64> = table.column(MU_COLUMN)?.to_vec();
        let gantry =
            to_bipolar(&table.column(GANTRY_COLUMN)?.to_vec()).map_err(DeliveryError::from)?;
        let collimator =
            to_bipolar(&table.column(COLLIMATOR_COLUMN)?.to_vec()).map_err(DeliveryError::from)?;

        let n_samples = table.n_samples();
        let leaf_pairs = self.machine.leaf_pair_count();
        let mut mlc = Array3::<f64>::zeros((n_samples, leaf_pairs, 2));
        for pair in 0..leaf_pairs {
            for (bank_index, bank) in [LeafBank::Y1, LeafBank::Y2].into_iter().enumerate() {
                let column = table.column(&MachineDescriptor::leaf_column(bank, pair + 1))?;
                for (sample, value) in column.iter().enumerate() {
                    mlc[[sample, pair, bank_index]] = *value;
                }
            }
        }

        let mut jaw = Array2::<f64>::zeros((n_samples, 2));
        for (bank_index, name) in [Y1_JAW_COLUMN, Y2_JAW_COLUMN].into_iter().enumerate() {
            jaw.column_mut(bank_index).assign(&table.column(name)?);
        }

        Ok(Delivery::new(
            cumulative_mu(&raw_mu),
            gantry,
            collimator,
            mlc,
            jaw,
        )?)
    }

    /// Export the decoded table as CSV
    pub fn write_csv(&self, path: &Path) -> Result<(), TrfFileError> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.table.write_csv(&mut file)?;
        Ok(())
    }
}

/// Decode the TRF at path into a Delivery
pub fn delivery_from_trf(
    path: &Path,
    machine: Option<&MachineDescriptor>,
) -> Result<Delivery, TrfFileError> {
    TrfFile::open(path, machine)?.delivery()
}
