use serde::{Deserialize, Serialize};

use super::spectrum::{Spectrum, SpectrumError};

/// Chemical-shift-imaging grid: one spectrum per voxel, row-major (i, j, k).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiGrid {
    dims: [usize; 3],
    voxels: Vec<Spectrum>,
}

impl CsiGrid {
    pub fn new(dims: [usize; 3], voxels: Vec<Spectrum>) -> Result<Self, SpectrumError> {
        let expected = dims.iter().product::<usize>();
        if expected == 0 {
            return Err(SpectrumError::Empty);
        }
        if voxels.len() != expected {
            return Err(SpectrumError::LengthMismatch {
                expected,
                got: voxels.len(),
            });
        }
        Ok(Self { dims, voxels })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn voxels(&self) -> &[Spectrum] {
        &self.voxels
    }

    pub fn flat_index(&self, i: usize, j: usize, k: usize) -> Option<usize> {
        let [ni, nj, nk] = self.dims;
        if i >= ni || j >= nj || k >= nk {
            return None;
        }
        Some((i * nj + j) * nk + k)
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<&Spectrum> {
        self.flat_index(i, j, k).map(|idx| &self.voxels[idx])
    }

    /// (i, j, k) of a flat voxel index
    pub fn voxel_position(&self, flat: usize) -> [usize; 3] {
        let [_, nj, nk] = self.dims;
        [flat / (nj * nk), (flat / nk) % nj, flat % nk]
    }

    /// Same grid shape with new voxel contents
    pub fn with_voxels(&self, voxels: Vec<Spectrum>) -> Result<Self, SpectrumError> {
        CsiGrid::new(self.dims, voxels)
    }
}

/// The signal stream passed between steps.
///
/// Single-voxel data is an ordered list of repetitions; CSI data is a voxel
/// grid. The shape family is fixed for the duration of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transients {
    Svs(Vec<Spectrum>),
    Csi(CsiGrid),
}

impl Transients {
    /// Every spectrum in storage order
    pub fn spectra(&self) -> &[Spectrum] {
        match self {
            Transients::Svs(list) => list,
            Transients::Csi(grid) => grid.voxels(),
        }
    }

    pub fn len(&self) -> usize {
        self.spectra().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra().is_empty()
    }

    pub fn is_csi(&self) -> bool {
        matches!(self, Transients::Csi(_))
    }

    pub fn first(&self) -> Option<&Spectrum> {
        self.spectra().first()
    }

    pub fn has_multi_coil(&self) -> bool {
        self.spectra().iter().any(|s| s.is_multi_coil())
    }

    /// Apply a per-spectrum transform, keeping the shape
    pub fn map_spectra<F, E>(&self, f: F) -> Result<Transients, E>
    where
        F: Fn(&Spectrum) -> Result<Spectrum, E>,
        E: From<SpectrumError>,
    {
        let mapped = self.spectra().iter().map(f).collect::<Result<Vec<_>, E>>()?;
        self.with_spectra(mapped).map_err(E::from)
    }

    /// Same shape family with replaced contents. For CSI the count must match.
    pub fn with_spectra(&self, spectra: Vec<Spectrum>) -> Result<Transients, SpectrumError> {
        match self {
            Transients::Svs(_) => Ok(Transients::Svs(spectra)),
            Transients::Csi(grid) => Ok(Transients::Csi(grid.with_voxels(spectra)?)),
        }
    }

    /// Repetition average used wherever a single reference spectrum is needed
    pub fn reference(&self) -> Result<Spectrum, SpectrumError> {
        Spectrum::mean(self.spectra())
    }

    pub fn describe(&self) -> String {
        match self {
            Transients::Svs(list) => format!(
                "SVS, {} repetition(s) × {} points",
                list.len(),
                list.first().map(|s| s.np()).unwrap_or(0)
            ),
            Transients::Csi(grid) => {
                let [i, j, k] = grid.dims();
                format!(
                    "CSI {}×{}×{}, {} points",
                    i,
                    j,
                    k,
                    grid.voxels().first().map(|s| s.np()).unwrap_or(0)
                )
            }
        }
    }
}
