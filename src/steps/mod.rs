/// Processing steps
///
/// A step reads the typed [`DataBag`], writes `output` (and optionally
/// `wref_output`) and reports any degraded behaviour through its
/// [`StepOutcome`]. Numerical failures are absorbed inside the step; a
/// returned [`StepError`] means the run cannot continue.

pub mod alignment;
pub mod apodization;
pub mod averaging;
pub mod bad_averages;
pub mod coil_combination;
pub mod eddy_current;
pub mod external;
pub mod parameter;
pub mod quality;
pub mod registry;
pub mod te_phase;

use std::fmt;
use std::str::FromStr;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::import::Header;
use crate::data::spectrum::SpectrumError;
use crate::data::transients::Transients;
use crate::dsp::least_squares::GaussianFit;
use crate::pipeline::command::ExternalToolError;
use parameter::{ParameterError, ParameterSet, ParameterValue};

pub use registry::StepRegistry;

// ============================================================================
//  Kinds
// ============================================================================

/// Every step kind the registry knows about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    CoilCombination,
    EddyCurrentCorrection,
    FreqPhaseAlignment,
    TePhaseCorrection,
    RemoveBadAverages,
    Average,
    BlockAverage,
    SnrWeightedAverage,
    MovingAverage,
    LineBroadening,
    ZeroPadding,
    QualityMatrix,
    /// Subprocess plugin registered at runtime
    External(String),
}

impl StepKind {
    pub const BUILTIN: [StepKind; 12] = [
        StepKind::CoilCombination,
        StepKind::EddyCurrentCorrection,
        StepKind::FreqPhaseAlignment,
        StepKind::TePhaseCorrection,
        StepKind::RemoveBadAverages,
        StepKind::Average,
        StepKind::BlockAverage,
        StepKind::SnrWeightedAverage,
        StepKind::MovingAverage,
        StepKind::LineBroadening,
        StepKind::ZeroPadding,
        StepKind::QualityMatrix,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            StepKind::CoilCombination => "CoilCombination",
            StepKind::EddyCurrentCorrection => "EddyCurrentCorrection",
            StepKind::FreqPhaseAlignment => "FreqPhaseAlignment",
            StepKind::TePhaseCorrection => "TePhaseCorrection",
            StepKind::RemoveBadAverages => "RemoveBadAverages",
            StepKind::Average => "Average",
            StepKind::BlockAverage => "BlockAverage",
            StepKind::SnrWeightedAverage => "SnrWeightedAverage",
            StepKind::MovingAverage => "MovingAverage",
            StepKind::LineBroadening => "LineBroadening",
            StepKind::ZeroPadding => "ZeroPadding",
            StepKind::QualityMatrix => "QualityMatrix",
            StepKind::External(name) => name,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = std::convert::Infallible;

    /// Unknown names become [`StepKind::External`]; the registry decides
    /// whether such a kind actually exists.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StepKind::BUILTIN
            .iter()
            .find(|k| k.as_str() == s)
            .cloned()
            .unwrap_or_else(|| StepKind::External(s.to_string())))
    }
}

// ============================================================================
//  Data bag
// ============================================================================

/// Named inputs and outputs of one step invocation
#[derive(Debug, Clone)]
pub struct DataBag {
    pub input: Transients,
    /// Water reference, re-resolved to the most recently corrected version
    pub wref: Option<Transients>,
    pub output: Option<Transients>,
    pub wref_output: Option<Transients>,
    pub header: Header,
    /// Traceability labels written by steps that regroup repetitions
    pub labels: Vec<String>,
    /// Read-only baseline (history entry 0 or a step-requested replacement)
    pub baseline: Option<Transients>,
}

impl DataBag {
    pub fn new(input: Transients, wref: Option<Transients>, header: Header) -> Self {
        Self {
            input,
            wref,
            output: None,
            wref_output: None,
            header,
            labels: Vec::new(),
            baseline: None,
        }
    }

    pub fn with_baseline(mut self, baseline: Option<Transients>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Identity output: the input moves through untouched
    pub fn pass_through(&mut self) {
        self.output = Some(self.input.clone());
    }

    /// Water reference as a single averaged spectrum
    pub fn wref_reference(&self) -> Option<Result<crate::data::spectrum::Spectrum, SpectrumError>> {
        self.wref.as_ref().map(|w| w.reference())
    }
}

// ============================================================================
//  Outcome, diagnostics, errors
// ============================================================================

/// Non-fatal result of `process`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Degradation warnings; non-empty means an identity fallback was used
    /// for at least part of the data.
    pub warnings: Vec<String>,
    /// Replacement for the controller's baseline
    pub baseline: Option<Transients>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        let message = message.into();
        log::warn!("{}", message);
        Self {
            warnings: vec![message],
            baseline: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Water linewidth from a Gaussian fit of the water peak
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterLinewidth {
    pub fwhm_hz: f64,
    pub fwhm_ppm: f64,
    pub fit: GaussianFit,
}

/// Intermediates retained from the last `process` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Diagnostics {
    CoilCombination {
        /// Complex weight applied to each coil
        weights: Vec<Complex64>,
        shots_per_measurement: usize,
    },
    EddyCurrent {
        raw_phase: Vec<f64>,
        smoothed_phase: Vec<f64>,
        slope: f64,
        intercept: f64,
    },
    /// Linear phase trend of every voxel's water reference, in grid order
    EddyCurrentGrid {
        dims: [usize; 3],
        slopes: Vec<f64>,
        intercepts: Vec<f64>,
    },
    Alignment {
        target_index: Option<usize>,
        target_shift_hz: f64,
        target_phase_rad: f64,
        shifts_hz: Vec<f64>,
        phases_rad: Vec<f64>,
        converged: Vec<bool>,
    },
    TePhase {
        te_ms: f64,
        first_order_rad: f64,
        /// Target voxel for CSI, `None` for the SVS median target
        target_index: Option<usize>,
        shifts_hz: Vec<f64>,
        phases_rad: Vec<f64>,
        converged: Vec<bool>,
    },
    BadAverages {
        metric: Vec<f64>,
        z_scores: Vec<f64>,
        removed: Vec<usize>,
    },
    Averaging {
        groups: Vec<Vec<usize>>,
        weights: Vec<f64>,
    },
    Quality {
        snr: Vec<f64>,
        baseline_snr: Vec<f64>,
        water: Option<WaterLinewidth>,
    },
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    External(#[from] ExternalToolError),
    #[error("{0}")]
    Invalid(String),
}

// ============================================================================
//  Step trait
// ============================================================================

pub trait Step: Send {
    fn kind(&self) -> StepKind;

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    fn get_parameter(&self, idname: &str) -> Result<&ParameterValue, ParameterError> {
        self.parameters().get(idname)
    }

    fn set_parameter(&mut self, idname: &str, value: ParameterValue) -> Result<(), ParameterError> {
        self.parameters_mut().set(idname, value)
    }

    fn reset_parameters(&mut self) {
        self.parameters_mut().reset();
    }

    /// Run the step. Must set `data.output` on success.
    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError>;

    fn diagnostics(&self) -> Option<&Diagnostics> {
        None
    }
}

impl fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind(), self.parameters().summary())
    }
}

/// SVS repetitions, or a degraded pass-through for CSI data. Used by steps
/// that combine repetitions and have no meaning on a voxel grid.
pub(crate) fn svs_or_pass_through(
    kind: &StepKind,
    data: &mut DataBag,
    outcome: &mut StepOutcome,
) -> Option<Vec<crate::data::spectrum::Spectrum>> {
    match &data.input {
        Transients::Svs(list) => Some(list.clone()),
        Transients::Csi(_) => {
            outcome.warn(format!("{} does not apply to CSI data; passing through", kind));
            data.pass_through();
            None
        }
    }
}
