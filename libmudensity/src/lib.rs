//! # mudensity
//!
//! mudensity reconstructs what a linear accelerator delivered and turns it into an
//! MU-density map, written in Rust. It reads the binary treatment record files (.trf)
//! written by the linac control system and DICOM RT plans (.dcm), reduces both to a common
//! `Delivery` (a sequence of control points holding MU, gantry and collimator angles, jaw
//! and MLC positions), and integrates the beam aperture over the delivery on a regular grid
//! at isocentre. Comparing the MU-density of a plan with that of its treatment record is
//! the usual use.
//!
//! ## Installation
//!
//! The only method of install is from source, which is laid out below.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### HDF5
//!
//! MU-density archives are written as HDF5 when the `hdf5` feature is enabled. HDF5 must
//! then be installed, typically using a package manager (homebrew, apt, etc). If it lives
//! in a custom location, write the following snippet into `.cargo/config.toml` in the
//! repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! Without the feature archives are written as CSV.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./mudensity_cli` (add
//! `--features hdf5` for HDF5 output) from the top level repository.
//!
//! ## Configuration
//!
//! The `calc` command is driven by a YAML configuration file. A template can be made with
//! `mudensity_cli new -p config.yml`:
//!
//! ```yml
//! input_paths: []
//! output_path: None
//! machine: null
//! grid_resolution: 1.0
//! gantry_angle: null
//! gantry_tolerance: 3.0
//! fraction_group: null
//! n_threads: 1
//! ```
//!
//! - `input_paths`: TRF and RT plan files to process
//! - `output_path`: directory receiving one archive per input
//! - `machine`: `agility`, `millennium` or `!custom [widths...]` (mm, top leaf pair first).
//! If null, TRF inputs are matched on their leaf count and RT plans use their leaf
//! position boundaries.
//! - `grid_resolution`: grid spacing in mm
//! - `gantry_angle`, `gantry_tolerance`: if an angle is given, only control points within
//! the tolerance (degrees) of it contribute
//! - `fraction_group`: fraction group of RT plan inputs, required if a plan has several
//! - `n_threads`: size of the calculation thread pool
//!
//! ## Coordinates
//!
//! x is the direction of MLC travel and y the direction of jaw travel, in mm at isocentre.
//! Leaf pair 0 is the top (+y) pair. `mlc[[cp, pair, 0]]` is the left leaf, whose edge is at
//! x = -value, and `mlc[[cp, pair, 1]]` the right leaf with its edge at x = +value. Jaws are
//! (Y1, Y2) and leave -Y2 <= y <= Y1 open. Gantry and collimator angles are bipolar, in
//! (-180, 180].
//!
//! ## Output
//!
//! ### HDF5 Data Format
//!
//! ```text
//! field.h5
//! mu_density - grid_resolution, total_mu, version
//! |---- x(dset)
//! |---- y(dset)
//! |---- density(dset) indexed [y, x]
//! ```
pub mod angle;
pub mod archive;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod grid;
pub mod machine;
pub mod mu_density;
pub mod plan_writer;
pub mod process;
pub mod rtplan;
pub mod trf_file;
pub mod trf_header;
pub mod trf_table;
pub mod worker_status;
