#[cfg(feature = "hdf5")]
use hdf5::types::VarLenUnicode;
#[cfg(feature = "hdf5")]
use std::str::FromStr;

use std::io::Write;
use std::path::{Path, PathBuf};

use super::constants::{FORMAT_VERSION, MU_DENSITY_GROUP_NAME};
use super::error::ArchiveError;
use super::mu_density::MuDensity;

const X_NAME: &str = "x";
const Y_NAME: &str = "y";
const DENSITY_NAME: &str = "density";

// Structure
// mu_density - grid_resolution, total_mu, version
// |---- x(dset)
// |---- y(dset)
// |---- density(dset) indexed [y, x]

/// Write an MU-density archive at path with the extension of the enabled format.
/// Returns the path actually written.
pub fn write_archive(result: &MuDensity, path: &Path) -> Result<PathBuf, ArchiveError> {
    #[cfg(feature = "hdf5")]
    let path = {
        let path = path.with_extension("h5");
        write_hdf5(result, &path)?;
        path
    };
    #[cfg(not(feature = "hdf5"))]
    let path = {
        let path = path.with_extension("csv");
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        write_csv(result, &mut file)?;
        file.flush()?;
        path
    };
    log::info!(
        "Wrote {} x {} MU-density ({:.3} MU) to {}",
        result.y.len(),
        result.x.len(),
        result.total_mu,
        path.display()
    );
    Ok(path)
}

/// Write the archive as HDF5: one group holding the axes and density, with the grid
/// resolution, total MU and format version as attributes
#[cfg(feature = "hdf5")]
pub fn write_hdf5(result: &MuDensity, path: &Path) -> Result<(), ArchiveError> {
    let file_handle = hdf5::File::create(path)?;
    let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

    let group = file_handle.create_group(MU_DENSITY_GROUP_NAME)?;
    group
        .new_attr::<f64>()
        .create("grid_resolution")?
        .write_scalar(&result.resolution)?;
    group
        .new_attr::<f64>()
        .create("total_mu")?
        .write_scalar(&result.total_mu)?;
    group
        .new_attr::<VarLenUnicode>()
        .create("version")?
        .write_scalar(&VarLenUnicode::from_str(&version)?)?;

    group
        .new_dataset_builder()
        .with_data(&result.x)
        .create(X_NAME)?;
    group
        .new_dataset_builder()
        .with_data(&result.y)
        .create(Y_NAME)?;
    group
        .new_dataset_builder()
        .with_data(&result.density)
        .create(DENSITY_NAME)?;
    Ok(())
}

/// Write the archive as CSV: a commented version line, the x and y axes as labelled rows,
/// then one row of density per y
pub fn write_csv<W: Write>(result: &MuDensity, writer: &mut W) -> Result<(), ArchiveError> {
    writeln!(
        writer,
        "# {}:{} {} grid_resolution={} total_mu={}",
        env!("CARGO_PKG_NAME"),
        FORMAT_VERSION,
        MU_DENSITY_GROUP_NAME,
        result.resolution,
        result.total_mu
    )?;
    writeln!(writer, "{X_NAME},{}", join(result.x.iter()))?;
    writeln!(writer, "{Y_NAME},{}", join(result.y.iter()))?;
    for row in result.density.rows() {
        writeln!(writer, "{}", join(row.iter()))?;
    }
    Ok(())
}

fn join<'a>(values: impl Iterator<Item = &'a f64>) -> String {
    values
        .map(|value| value.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn small_result() -> MuDensity {
        MuDensity {
            x: array![-1.0, 0.0, 1.0],
            y: array![0.0, 1.0],
            density: Array2::from_shape_vec((2, 3), vec![0.0, 1.5, 0.0, 0.0, 2.0, 0.25]).unwrap(),
            resolution: 1.0,
            total_mu: 2.0,
        }
    }

    #[test]
    fn csv_lists_axes_then_rows() {
        let mut buffer = Vec::new();
        write_csv(&small_result(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("# libmudensity:1.0 mu_density"));
        assert_eq!(lines[1], "x,-1,0,1");
        assert_eq!(lines[2], "y,0,1");
        assert_eq!(lines[3], "0,1.5,0");
        assert_eq!(lines[4], "0,2,0.25");
    }

    #[test]
    fn archive_is_written_with_the_format_extension() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_archive(&small_result(), &dir.path().join("field")).unwrap();
        assert!(written.exists());
        #[cfg(not(feature = "hdf5"))]
        assert_eq!(written.extension().unwrap(), "csv");
        #[cfg(feature = "hdf5")]
        assert_eq!(written.extension().unwrap(), "h5");
    }
}
