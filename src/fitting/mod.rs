/// Spectral fitting with an external LCModel-class tool
///
/// Each voxel is fitted in its own work directory: the signal and control
/// files are written there, the executable runs with the control file on
/// stdin, the COORD output is parsed, and the directory is removed (after
/// copying its contents to the permanent output, if one is configured)
/// before the next voxel starts.

pub mod control;
pub mod coord;
pub mod raw;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::import::Header;
use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;
use crate::pipeline::command::{check_tool_available, ExternalCommand, ExternalToolError};
use control::{ControlFile, ControlValue};
use coord::{read_coord, FitResult};
use raw::{write_raw, RawHeader};

const RAW_FILE: &str = "data.raw";
const H2O_FILE: &str = "h2o.raw";
const CONTROL_FILE: &str = "control.file";
const COORD_FILE: &str = "spectrum.coord";
const TABLE_FILE: &str = "spectrum.table";

/// One spectrum to fit
#[derive(Debug, Clone, Copy)]
pub struct FitJob<'a> {
    /// (i, j, k) for CSI; (repetition, 0, 0) for single-voxel data
    pub voxel: [usize; 3],
    pub spectrum: &'a Spectrum,
    pub wref: Option<&'a Spectrum>,
    pub header: &'a Header,
}

pub trait SpectrumFitter: Send {
    fn name(&self) -> &str;

    /// Checks done once before any voxel; failure aborts fitting
    fn prepare(&self) -> Result<(), ExternalToolError>;

    fn fit(&self, job: &FitJob<'_>) -> Result<FitResult, ExternalToolError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VoxelOutcome {
    Fitted(FitResult),
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelFit {
    pub voxel: [usize; 3],
    pub outcome: VoxelOutcome,
}

impl VoxelFit {
    pub fn result(&self) -> Option<&FitResult> {
        match &self.outcome {
            VoxelOutcome::Fitted(r) => Some(r),
            VoxelOutcome::Failed { .. } => None,
        }
    }
}

/// Fit every voxel (or repetition). A failing voxel is recorded and the
/// others continue; only a failed [`SpectrumFitter::prepare`] is an error.
pub fn fit_all(
    fitter: &dyn SpectrumFitter,
    data: &Transients,
    wref: Option<&Transients>,
    header: &Header,
) -> Result<Vec<VoxelFit>, ExternalToolError> {
    fitter.prepare()?;

    let per_voxel_wref = match (data, wref) {
        (Transients::Csi(grid), Some(Transients::Csi(w))) if w.dims() == grid.dims() => {
            Some(w.voxels())
        }
        _ => None,
    };
    let shared_wref = match (per_voxel_wref, wref) {
        (None, Some(w)) => match w.reference() {
            Ok(s) => Some(s),
            Err(e) => {
                log::warn!("Water reference unusable for fitting: {}", e);
                None
            }
        },
        _ => None,
    };

    if let Transients::Svs(list) = data {
        if list.len() > 1 {
            log::info!("Fitting {} repetitions individually", list.len());
        }
    }

    let mut fits = Vec::with_capacity(data.len());
    for (n, spectrum) in data.spectra().iter().enumerate() {
        let voxel = match data {
            Transients::Csi(grid) => grid.voxel_position(n),
            Transients::Svs(_) => [n, 0, 0],
        };
        let job = FitJob {
            voxel,
            spectrum,
            wref: per_voxel_wref
                .map(|w| &w[n])
                .or(shared_wref.as_ref()),
            header,
        };
        let outcome = match fitter.fit(&job) {
            Ok(result) => {
                log::info!(
                    "{} fit of voxel {:?}: {} metabolites",
                    fitter.name(),
                    voxel,
                    result.metabolites.len()
                );
                VoxelOutcome::Fitted(result)
            }
            Err(e) => {
                log::error!("{} fit of voxel {:?} failed: {}", fitter.name(), voxel, e);
                VoxelOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        fits.push(VoxelFit { voxel, outcome });
    }
    Ok(fits)
}

// ============================================================================
//  LCModel
// ============================================================================

fn default_executable() -> String {
    "lcmodel".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("mrs-pipeline")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcModelSettings {
    pub executable: String,
    /// Arguments placed before the control file is piped in
    pub args: Vec<String>,
    pub basis_file: PathBuf,
    /// Parent of the per-voxel work directories
    pub work_dir: PathBuf,
    pub ppm_start: f64,
    pub ppm_end: f64,
    pub title: String,
    /// Conjugate the signal when writing RAW files
    pub conjugate: bool,
    /// Extra control-file entries, written after the generated ones
    pub extra: BTreeMap<String, ControlValue>,
}

impl Default for LcModelSettings {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            basis_file: PathBuf::new(),
            work_dir: default_work_dir(),
            ppm_start: 0.2,
            ppm_end: 4.0,
            title: String::new(),
            conjugate: false,
            extra: BTreeMap::new(),
        }
    }
}

pub struct LcModelFitter {
    settings: LcModelSettings,
    /// Where each voxel's files are kept; `None` discards them
    output_dir: Option<PathBuf>,
    session: String,
}

impl LcModelFitter {
    pub fn new(settings: LcModelSettings, output_dir: Option<PathBuf>) -> Self {
        Self {
            settings,
            output_dir,
            session: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn settings(&self) -> &LcModelSettings {
        &self.settings
    }

    pub fn control_file(&self, job: &FitJob<'_>, name: &str) -> ControlFile {
        let s = job.spectrum;
        let title = if self.settings.title.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", self.settings.title, name)
        };

        let mut control = ControlFile::new();
        control
            .set("title", title)
            .set("filbas", self.settings.basis_file.display().to_string())
            .set("filraw", RAW_FILE)
            .set("filcoo", COORD_FILE)
            .set("filtab", TABLE_FILE)
            .set("lcoord", 9i64)
            .set("ltable", 7i64)
            .set("hzpppm", s.f0())
            .set("deltat", s.dt())
            .set("nunfil", s.np())
            .set("echot", s.te())
            .set("ppmst", self.settings.ppm_start.max(self.settings.ppm_end))
            .set("ppmend", self.settings.ppm_start.min(self.settings.ppm_end))
            .set("dows", job.wref.is_some());
        if job.wref.is_some() {
            control.set("filh2o", H2O_FILE);
        }
        for (key, value) in &self.settings.extra {
            control.set(key, value.clone());
        }
        control
    }

    fn keep_outputs(&self, workdir: &Path, name: &str) -> io::Result<()> {
        let Some(root) = &self.output_dir else {
            return Ok(());
        };
        let target = root.join(name);
        fs::create_dir_all(&target)?;
        for entry in fs::read_dir(workdir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                fs::copy(&path, target.join(entry.file_name()))?;
            }
        }
        Ok(())
    }
}

impl SpectrumFitter for LcModelFitter {
    fn name(&self) -> &str {
        "LCModel"
    }

    fn prepare(&self) -> Result<(), ExternalToolError> {
        if !check_tool_available(&self.settings.executable) {
            return Err(ExternalToolError::Spawn {
                program: self.settings.executable.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "not found on PATH"),
            });
        }
        if !self.settings.basis_file.is_file() {
            return Err(ExternalToolError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("basis set {} not found", self.settings.basis_file.display()),
            )));
        }
        fs::create_dir_all(&self.settings.work_dir)?;
        Ok(())
    }

    fn fit(&self, job: &FitJob<'_>) -> Result<FitResult, ExternalToolError> {
        let [i, j, k] = job.voxel;
        let name = format!("voxel_{}_{}_{}", i, j, k);
        let workdir = self
            .settings
            .work_dir
            .join(format!("{}_{}", self.session, name));
        if workdir.exists() {
            fs::remove_dir_all(&workdir)?;
        }
        fs::create_dir_all(&workdir)?;
        let _cleanup = scopeguard::guard(workdir.clone(), |dir| {
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("Cannot remove work directory {}: {}", dir.display(), e);
            }
        });

        let sequence = job.header.sequence.as_deref();
        write_raw(
            &workdir.join(RAW_FILE),
            job.spectrum,
            &RawHeader::for_spectrum(&name, job.spectrum, sequence),
            self.settings.conjugate,
        )?;
        if let Some(w) = job.wref {
            write_raw(
                &workdir.join(H2O_FILE),
                w,
                &RawHeader::for_spectrum(&name, w, sequence),
                self.settings.conjugate,
            )?;
        }

        let control = self.control_file(job, &name).render();
        fs::write(workdir.join(CONTROL_FILE), &control)?;

        ExternalCommand::new(&self.settings.executable)
            .args(&self.settings.args)
            .working_dir(&workdir)
            .describe(&format!("LCModel fit of {}", name))
            .execute_piped(Some(control.as_bytes()))?
            .check(&self.settings.executable)?;

        let result = read_coord(&workdir.join(COORD_FILE))?;
        self.keep_outputs(&workdir, &name)?;
        Ok(result)
    }
}
