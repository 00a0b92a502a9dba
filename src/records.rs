//! Configuration records shipped between processes
//!
//! Every record is `#[repr(C)]` and derives its wire format with
//! `#[derive(Equivalence)]`. The records mirror the in-memory layout of the
//! simulation's own structures; they are only valid between processes built
//! from the same image.
#![allow(missing_docs)]

use crate::Equivalence;

/// Maximum number of soil layers
pub const MAX_LAYERS: usize = 25;
/// Months per year
pub const MAX_MONTHS: usize = 12;
/// Days per year, leap years included
pub const MAX_DAYS: usize = 366;
/// Number of vegetation types
pub const NVEGTYPES: usize = 4;
/// Maximum number of soil water retention curve parameters
pub const SWRC_PARAM_NMAX: usize = 6;
/// Number of output keys
pub const SW_OUTNKEYS: usize = 32;
/// Number of output periods
pub const SW_OUTNPERIODS: usize = 4;
/// Maximum length of a species name, without the terminating NUL
pub const MAX_SPECIESNAMELEN: usize = 4;
/// Size of a node name record
pub const MAX_PROCESSOR_NAME: usize = 256;

/// Simulation domain settings every process needs
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct DomainConfig {
    pub has_consistent_soil_layer_depths: i32,
    pub n_max_soil_layers: u32,
    pub n_max_evap_layers: u32,
    pub start_year: u32,
    pub end_year: u32,
}

/// Spin-up settings
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct SpinupConfig {
    pub scope: u32,
    pub duration: u32,
    pub mode: i32,
    pub rng_seed: i32,
    /// Non-zero if spin-up is enabled
    pub spinup: u32,
}

/// Monthly sky inputs, plus the daily snow density interpolated from them
#[repr(C)]
#[derive(Equivalence, Clone, Copy, Debug, PartialEq)]
pub struct SkyInputs {
    pub cloud_cov: [f64; MAX_MONTHS],
    pub windspeed: [f64; MAX_MONTHS],
    pub r_humidity: [f64; MAX_MONTHS],
    pub snow_density: [f64; MAX_MONTHS],
    pub n_rain_per_day: [f64; MAX_MONTHS],
    /// Indexed by day of year, starting at 1
    pub snow_density_daily: [f64; MAX_DAYS + 1],
}

impl Default for SkyInputs {
    fn default() -> SkyInputs {
        SkyInputs {
            cloud_cov: [0.0; MAX_MONTHS],
            windspeed: [0.0; MAX_MONTHS],
            r_humidity: [0.0; MAX_MONTHS],
            snow_density: [0.0; MAX_MONTHS],
            n_rain_per_day: [0.0; MAX_MONTHS],
            snow_density_daily: [0.0; MAX_DAYS + 1],
        }
    }
}

/// Site location inputs
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct ModelRunInputs {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: f64,
    pub slope: f64,
    pub aspect: f64,
    pub is_north: u32,
}

/// Per-layer soil inputs
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct SoilRunInputs {
    pub width: [f64; MAX_LAYERS],
    pub depths: [f64; MAX_LAYERS],
    pub soil_density_input: [f64; MAX_LAYERS],
    pub ev_coeff: [f64; MAX_LAYERS],
    pub transp_coeff: [[f64; MAX_LAYERS]; NVEGTYPES],
    pub fraction_vol_bulk_gravel: [f64; MAX_LAYERS],
    pub fraction_weight_matric_sand: [f64; MAX_LAYERS],
    pub fraction_weight_matric_clay: [f64; MAX_LAYERS],
    pub fraction_weight_om: [f64; MAX_LAYERS],
    pub impermeability: [f64; MAX_LAYERS],
    pub avg_lyr_temp_init: [f64; MAX_LAYERS],
    pub swrcp_mineral_soil: [[f64; SWRC_PARAM_NMAX]; MAX_LAYERS],
}

/// Fractional cover and albedo of one cover type
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct CoverType {
    pub f_cover: f64,
    pub albedo: f64,
}

/// Monthly production inputs of one vegetation type
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct VegType {
    pub cover: CoverType,
    pub litter: [f64; MAX_MONTHS],
    pub biomass: [f64; MAX_MONTHS],
    pub pct_live: [f64; MAX_MONTHS],
    pub lai_conv: [f64; MAX_MONTHS],
}

/// Vegetation production inputs
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct VegProdRunInputs {
    pub veg: [VegType; NVEGTYPES],
    pub bare_cover: CoverType,
}

/// Site inputs
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct SiteRunInputs {
    pub t_soil_constant: f64,
}

/// Run-input template: the five input aggregates of one simulation run
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct RunInputs {
    pub sky: SkyInputs,
    pub model: ModelRunInputs,
    pub soil: SoilRunInputs,
    pub veg_prod: VegProdRunInputs,
    pub site: SiteRunInputs,
}

/// Wall-time statistics of one process
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct WallTime {
    pub time_mean: f64,
    pub time_sd: f64,
    pub time_min: f64,
    pub time_max: f64,
    pub n_timed_runs: u64,
    pub n_untimed_runs: u64,
}

/// Output-domain settings the I/O processes need
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct OutDomIo {
    pub sum_type: [i32; SW_OUTNKEYS],
    pub use_key: [i32; SW_OUTNKEYS],
    pub nrow_out: [u64; SW_OUTNPERIODS],
    pub used_periods: i32,
    pub time_steps: [[i32; SW_OUTNPERIODS]; SW_OUTNKEYS],
}

/// Establishment parameters of one species
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq)]
pub struct VegEstabInfo {
    pub species_name: [u8; MAX_SPECIESNAMELEN + 1],
    pub veg_type: u32,
    pub estab_doy: u32,
    pub min_pregerm_days: u32,
    pub max_pregerm_days: u32,
    pub min_wetdays_for_germ: u32,
    pub max_drydays_postgerm: u32,
    pub min_wetdays_for_estab: u32,
    pub min_days_germ2estab: u32,
    pub max_days_germ2estab: u32,
    pub estab_lyrs: u32,
    pub bars: [f32; 2],
    pub min_swc_germ: f32,
    pub min_swc_estab: f32,
    pub min_temp_germ: f32,
    pub max_temp_germ: f32,
    pub min_temp_estab: f32,
    pub max_temp_estab: f32,
}

/// The wire form of a designation
///
/// Sent to every process ahead of its work units and served compute ranks.
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DesignationRecord {
    /// Role code, see [`Role`](crate::coordination::Role)
    pub proc_job: i32,
    /// Number of compute processes served (I/O only)
    pub n_comp_procs: i32,
    /// Serving I/O rank (compute only)
    pub io_rank: i32,
    /// Number of translated work-unit lists that follow
    pub n_translated_sets: i32,
    /// Number of work units that follow
    pub n_suids: u64,
}

/// A simulation unit: an opaque pair of indices into the simulation domain
#[repr(C)]
#[derive(Equivalence, Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Suid {
    pub row: u64,
    pub col: u64,
}

impl Suid {
    /// A unit at `row`, `col`
    pub fn new(row: u64, col: u64) -> Suid {
        Suid { row, col }
    }
}

/// A NUL-padded node name
#[repr(C)]
#[derive(Equivalence, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessorName {
    pub name: [u8; MAX_PROCESSOR_NAME],
}

impl ProcessorName {
    /// Encode `name`, truncated so that at least one NUL remains.
    pub fn new(name: &str) -> ProcessorName {
        let mut record = ProcessorName::default();
        let mut len = name.len().min(MAX_PROCESSOR_NAME - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        record.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        record
    }

    /// The name up to the first NUL
    pub fn decode(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_PROCESSOR_NAME);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

impl Default for ProcessorName {
    fn default() -> ProcessorName {
        ProcessorName {
            name: [0; MAX_PROCESSOR_NAME],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{Equivalence as _, Primitive};
    use std::mem::size_of;

    #[test]
    fn designation_record_has_five_runs() {
        let datatype = DesignationRecord::equivalent_datatype().unwrap();
        let blocks = datatype.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].primitive, Primitive::I32);
        assert_eq!(blocks[0].count, 4);
        assert_eq!(blocks[1].primitive, Primitive::U64);
        assert_eq!(datatype.packed_size(), 4 * 4 + 8);
    }

    #[test]
    fn run_inputs_cover_every_member() {
        let datatype = RunInputs::equivalent_datatype().unwrap();
        assert_eq!(datatype.extent(), size_of::<RunInputs>());
        let doubles = 5 * MAX_MONTHS
            + MAX_DAYS
            + 1
            + 5
            + 11 * MAX_LAYERS
            + NVEGTYPES * MAX_LAYERS
            + SWRC_PARAM_NMAX * MAX_LAYERS
            + NVEGTYPES * (2 + 4 * MAX_MONTHS)
            + 2
            + 1;
        assert_eq!(datatype.packed_size(), doubles * 8 + 4);
    }

    #[test]
    fn veg_estab_info_skips_name_padding() {
        let datatype = VegEstabInfo::equivalent_datatype().unwrap();
        assert_eq!(datatype.packed_size(), 5 + 10 * 4 + 8 * 4);
        assert!(datatype.packed_size() < size_of::<VegEstabInfo>());
    }

    #[test]
    fn processor_names_are_nul_padded() {
        let name = ProcessorName::new("node-07");
        assert_eq!(name.decode(), "node-07");
        assert_eq!(name.name[7], 0);

        let long = "x".repeat(400);
        assert_eq!(ProcessorName::new(&long).decode().len(), MAX_PROCESSOR_NAME - 1);
    }
}
