use byteorder::{LittleEndian, ReadBytesExt};
use fxhash::FxHashMap;
use ndarray::{Array2, ArrayView1};
use std::io::{Cursor, Write};

use super::constants::TIME_COLUMN;
use super::error::TrfTableError;
use super::machine::MachineDescriptor;
use super::trf_header::{ChannelKind, TableLayout};

/// The decoded table of a TRF: one row per sample, one column per channel.
///
/// Columns carry canonical names; the first column is the sample time in seconds.
#[derive(Debug, Clone)]
pub struct TrfTable {
    columns: Vec<String>,
    index: FxHashMap<String, usize>,
    data: Array2<f64>,
}

impl TrfTable {
    /// Decode the binary records following the header
    pub fn decode(
        contents: &[u8],
        layout: &TableLayout,
        machine: &MachineDescriptor,
    ) -> Result<Self, TrfTableError> {
        let record_size = layout.record_size();
        if record_size == 0 || contents.len() % record_size != 0 {
            return Err(TrfTableError::Truncated {
                len: contents.len(),
                record_size,
            });
        }
        let n_samples = contents.len() / record_size;
        if n_samples == 0 {
            return Err(TrfTableError::EmptyTable);
        }

        let mut columns = vec![String::from(TIME_COLUMN)];
        columns.extend(
            layout
                .channels
                .iter()
                .map(|channel| machine.canonical_column(&channel.name)),
        );

        let mut data = Array2::<f64>::zeros((n_samples, columns.len()));
        let mut cursor = Cursor::new(contents);
        for (sample, mut row) in data.rows_mut().into_iter().enumerate() {
            row[0] = sample as f64 * layout.interval;
            for (channel, value) in layout.channels.iter().zip(row.iter_mut().skip(1)) {
                let raw = match channel.kind {
                    ChannelKind::I16 => cursor.read_i16::<LittleEndian>()? as f64,
                    ChannelKind::U16 => cursor.read_u16::<LittleEndian>()? as f64,
                    ChannelKind::I32 => cursor.read_i32::<LittleEndian>()? as f64,
                };
                *value = raw * channel.scale + channel.offset;
            }
        }

        let index = columns
            .iter()
            .enumerate()
            .map(|(position, name)| (name.clone(), position))
            .collect();

        Ok(Self {
            columns,
            index,
            data,
        })
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Get a column by its canonical name
    pub fn column(&self, name: &str) -> Result<ArrayView1<f64>, TrfTableError> {
        match self.index.get(name) {
            Some(position) => Ok(self.data.column(*position)),
            None => Err(TrfTableError::MissingColumn(String::from(name))),
        }
    }

    /// Write the table as CSV: a header row of column names, then one row per sample
    pub fn write_csv<W: Write>(&self, writer: &mut W) -> Result<(), TrfTableError> {
        let header: Vec<String> = self.columns.iter().map(|name| csv_field(name)).collect();
        writeln!(writer, "{}", header.join(","))?;
        for row in self.data.rows() {
            let values: Vec<String> = row.iter().map(|value| value.to_string()).collect();
            writeln!(writer, "{}", values.join(","))?;
        }
        Ok(())
    }
}

fn csv_field(name: &str) -> String {
    if name.contains(',') || name.contains('"') {
        format!("\"{}\"", name.replace('"', "\"\""))
    } else {
        String::from(name)
    }
}
