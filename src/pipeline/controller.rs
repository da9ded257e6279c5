/// Execution controller
///
/// ```text
/// Idle --start--> Loading --ok--> Running(0) --> ... --> Running(N-1) --> Fitting --> Done
///                    |                 |                                     |
///                    +--- error -------+------------- error -----------------+--> Idle
/// ```
///
/// `advance` performs exactly one transition; autorun is a loop over it.
/// `terminate` returns to `Idle` from any state and discards the history.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::import::{load_inputs, Header, InputLoadError, InputSet, JsonLoader, MrsLoader};
use crate::data::spectrum::{Spectrum, SpectrumError};
use crate::data::transients::Transients;
use crate::fitting::{fit_all, SpectrumFitter, VoxelFit, VoxelOutcome};
use crate::log::reproducibility::ProcessingLog;
use crate::steps::coil_combination::CoilCombination;
use crate::steps::{DataBag, Step, StepError, StepKind};

use super::command::ExternalToolError;
use super::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Idle,
    Loading,
    /// Step `k` is the next one to execute
    Running(usize),
    Fitting,
    Done,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Loading => write!(f, "Loading"),
            ControllerState::Running(k) => write!(f, "Running step {}", k),
            ControllerState::Fitting => write!(f, "Fitting"),
            ControllerState::Done => write!(f, "Done"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Loading failed: {0}")]
    Load(#[from] InputLoadError),
    #[error("Coil combination of the loaded data failed: {0}")]
    CoilCombination(#[source] StepError),
    #[error("Step {index} ({kind}) failed: {source}")]
    Step {
        index: usize,
        kind: StepKind,
        #[source]
        source: StepError,
    },
    #[error("Step {index} ({kind}) panicked: {message}")]
    StepPanicked {
        index: usize,
        kind: StepKind,
        message: String,
    },
    #[error("Fitting failed: {0}")]
    Fitting(#[from] ExternalToolError),
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ControllerState,
    },
    #[error("Run cancelled")]
    Cancelled,
}

/// What one call to [`ExecutionController::advance`] did
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    StepCompleted {
        index: usize,
        kind: StepKind,
        warnings: Vec<String>,
    },
    Fitted {
        fitted: usize,
        failed: usize,
    },
    /// Fitting state left without a fitter configured
    Finished,
}

/// Operator-applied correction on top of the processed data, used when
/// entering the fitting state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualAdjustment {
    pub frequency_hz: f64,
    pub phase0_deg: f64,
    /// Pivot is the reference shift (0 Hz)
    pub phase1_deg_per_ppm: f64,
}

impl ManualAdjustment {
    pub fn is_identity(&self) -> bool {
        self.frequency_hz == 0.0 && self.phase0_deg == 0.0 && self.phase1_deg_per_ppm == 0.0
    }

    pub fn apply(&self, spectrum: &Spectrum) -> Spectrum {
        spectrum.adjust_frequency(self.frequency_hz).adjust_phase(
            self.phase0_deg.to_radians(),
            self.phase1_deg_per_ppm.to_radians() / spectrum.f0(),
        )
    }
}

/// Append-only record of the signal after each step. Index 0 is the loaded
/// (and if needed coil-combined) data; both lists always have equal length.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    data_steps: Vec<Transients>,
    wref_steps: Vec<Option<Transients>>,
}

impl ExecutionHistory {
    fn push(&mut self, data: Transients, wref: Option<Transients>) {
        self.data_steps.push(data);
        self.wref_steps.push(wref);
    }

    fn clear(&mut self) {
        self.data_steps.clear();
        self.wref_steps.clear();
    }

    pub fn len(&self) -> usize {
        self.data_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_steps.is_empty()
    }

    pub fn data(&self, index: usize) -> Option<&Transients> {
        self.data_steps.get(index)
    }

    pub fn wref(&self, index: usize) -> Option<&Transients> {
        self.wref_steps.get(index).and_then(|w| w.as_ref())
    }

    pub fn latest_data(&self) -> Option<&Transients> {
        self.data_steps.last()
    }

    /// Most recently corrected water reference
    pub fn latest_wref(&self) -> Option<&Transients> {
        self.wref_steps.last().and_then(|w| w.as_ref())
    }

    pub fn data_steps(&self) -> &[Transients] {
        &self.data_steps
    }

    pub fn wref_steps(&self) -> &[Option<Transients>] {
        &self.wref_steps
    }
}

pub struct ExecutionController {
    pipeline: Pipeline,
    loader: Box<dyn MrsLoader>,
    fitter: Option<Box<dyn SpectrumFitter>>,
    ppm_reference: Option<f64>,
    state: ControllerState,
    history: ExecutionHistory,
    header: Header,
    baseline: Option<Transients>,
    labels: Vec<String>,
    manual: ManualAdjustment,
    final_output: Option<Transients>,
    fits: Vec<VoxelFit>,
    log: ProcessingLog,
    cancel: Arc<AtomicBool>,
}

impl ExecutionController {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            loader: Box::new(JsonLoader),
            fitter: None,
            ppm_reference: None,
            state: ControllerState::Idle,
            history: ExecutionHistory::default(),
            header: Header::default(),
            baseline: None,
            labels: Vec::new(),
            manual: ManualAdjustment::default(),
            final_output: None,
            fits: Vec::new(),
            log: ProcessingLog::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_loader(mut self, loader: Box<dyn MrsLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_fitter(mut self, fitter: Box<dyn SpectrumFitter>) -> Self {
        self.fitter = Some(fitter);
        self
    }

    /// Chemical shift assigned to 0 Hz for every loaded spectrum
    pub fn with_ppm_reference(mut self, ppm: f64) -> Self {
        self.ppm_reference = Some(ppm);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Replace the pipeline; only allowed when no run is in progress
    pub fn set_pipeline(&mut self, pipeline: Pipeline) -> Result<(), RunError> {
        match self.state {
            ControllerState::Idle | ControllerState::Done => {
                self.pipeline = pipeline;
                Ok(())
            }
            state => Err(RunError::InvalidState {
                action: "replace the pipeline",
                state,
            }),
        }
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn baseline(&self) -> Option<&Transients> {
        self.baseline.as_ref()
    }

    /// Repetition labels written by the last regrouping step
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn manual_adjustment(&self) -> ManualAdjustment {
        self.manual
    }

    pub fn set_manual_adjustment(&mut self, adjustment: ManualAdjustment) {
        self.manual = adjustment;
    }

    /// Data handed to the fitter (manual adjustment applied)
    pub fn final_output(&self) -> Option<&Transients> {
        self.final_output.as_ref()
    }

    pub fn fit_results(&self) -> &[VoxelFit] {
        &self.fits
    }

    pub fn processing_log(&self) -> &ProcessingLog {
        &self.log
    }

    /// Flag checked at every step boundary; setting it makes the next
    /// transition fail with [`RunError::Cancelled`]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn reset(&mut self) {
        self.state = ControllerState::Idle;
        self.history.clear();
        self.baseline = None;
        self.labels.clear();
        self.final_output = None;
        self.fits.clear();
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// User-triggered reset from any state
    pub fn terminate(&mut self) {
        if self.state != ControllerState::Idle {
            log::info!("Run terminated in state {}", self.state);
        }
        self.reset();
    }

    fn check_startable(&self) -> Result<(), RunError> {
        match self.state {
            ControllerState::Idle | ControllerState::Done => Ok(()),
            state => Err(RunError::InvalidState {
                action: "start",
                state,
            }),
        }
    }

    /// Load files and establish history entry 0
    pub fn start(&mut self, inputs: &[PathBuf], wref: Option<&Path>) -> Result<ControllerState, RunError> {
        self.check_startable()?;
        self.reset();
        self.state = ControllerState::Loading;
        match load_inputs(self.loader.as_ref(), inputs, wref) {
            Ok(set) => self.begin(set),
            Err(e) => {
                log::error!("{}", e);
                self.reset();
                Err(RunError::Load(e))
            }
        }
    }

    /// Start from data already in memory
    pub fn start_with(&mut self, inputs: InputSet) -> Result<ControllerState, RunError> {
        self.check_startable()?;
        self.reset();
        self.state = ControllerState::Loading;
        self.begin(inputs)
    }

    fn begin(&mut self, inputs: InputSet) -> Result<ControllerState, RunError> {
        match self.establish(inputs) {
            Ok(state) => Ok(state),
            Err(e) => {
                log::error!("{}", e);
                self.reset();
                Err(e)
            }
        }
    }

    fn establish(&mut self, inputs: InputSet) -> Result<ControllerState, RunError> {
        if inputs.data.is_empty() {
            return Err(RunError::Load(InputLoadError::NoFiles));
        }
        let (mut data, mut wref) = (inputs.data, inputs.wref);
        if let Some(ppm) = self.ppm_reference {
            let rereference = |s: &Spectrum| Ok::<_, SpectrumError>(s.clone().with_ppm0(ppm));
            let inconsistent = |e: SpectrumError| InputLoadError::Inconsistent(e.to_string());
            data = data.map_spectra(rereference).map_err(inconsistent)?;
            wref = match wref {
                Some(w) => Some(w.map_spectra(rereference).map_err(inconsistent)?),
                None => None,
            };
        }

        self.log = ProcessingLog::new();
        self.log.set_sources(
            &inputs
                .sources
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        );
        self.header = inputs.header;

        let first_is_combination = self
            .pipeline
            .step(0)
            .map(|s| s.kind() == StepKind::CoilCombination)
            .unwrap_or(false);
        if data.has_multi_coil() && !first_is_combination {
            log::info!("Multi-coil data: combining coils before the first step");
            let mut bag = DataBag::new(data, wref, self.header.clone());
            let mut combination = CoilCombination::default();
            let outcome = combination
                .process(&mut bag)
                .map_err(RunError::CoilCombination)?;
            self.log.add_entry(
                StepKind::CoilCombination.as_str(),
                "automatic, before the first step",
                &combination.parameters().summary(),
                &outcome.warnings,
            );
            wref = bag.wref_output.take().or(bag.wref.take());
            data = match bag.output.take() {
                Some(out) => out,
                None => bag.input,
            };
        }

        log::info!("Loaded {} from {} vendor data", data.describe(), inputs.vendor);
        self.baseline = Some(data.clone());
        self.history.push(data, wref);
        self.state = self.state_after(None);
        log::info!("State: {}", self.state);
        Ok(self.state)
    }

    /// State following the step with index `done` (`None` = loading)
    fn state_after(&self, done: Option<usize>) -> ControllerState {
        let next = done.map(|k| k + 1).unwrap_or(0);
        if next < self.pipeline.len() {
            ControllerState::Running(next)
        } else {
            ControllerState::Fitting
        }
    }

    fn check_cancelled(&mut self) -> Result<(), RunError> {
        if self.cancel.load(Ordering::SeqCst) {
            log::warn!("Run cancelled in state {}", self.state);
            self.reset();
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    /// Perform a single transition
    pub fn advance(&mut self) -> Result<Transition, RunError> {
        match self.state {
            ControllerState::Running(k) => {
                self.check_cancelled()?;
                self.run_step(k)
            }
            ControllerState::Fitting => {
                self.check_cancelled()?;
                self.run_fitting()
            }
            state => Err(RunError::InvalidState {
                action: "advance",
                state,
            }),
        }
    }

    /// Drive transitions until `Done`
    pub fn run_to_end(&mut self) -> Result<Vec<Transition>, RunError> {
        let mut transitions = Vec::new();
        while self.state != ControllerState::Done {
            transitions.push(self.advance()?);
        }
        Ok(transitions)
    }

    fn run_step(&mut self, index: usize) -> Result<Transition, RunError> {
        let input = self
            .history
            .latest_data()
            .filter(|_| index < self.pipeline.len())
            .cloned();
        let Some(input) = input else {
            let state = self.state;
            self.reset();
            return Err(RunError::InvalidState {
                action: "run a step",
                state,
            });
        };
        let mut bag = DataBag::new(input, self.history.latest_wref().cloned(), self.header.clone())
            .with_baseline(self.baseline.clone());
        let Some(step) = self.pipeline.step_mut(index) else {
            return Err(RunError::InvalidState {
                action: "run a step",
                state: self.state,
            });
        };
        let kind = step.kind();
        let was_csi = bag.input.is_csi();
        log::info!("Running step {} ({})", index, kind);

        let result = panic::catch_unwind(AssertUnwindSafe(|| step.process(&mut bag)));
        let parameters = step.parameters().summary();

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(source)) => {
                log::error!("Step {} ({}) failed: {}", index, kind, source);
                self.reset();
                return Err(RunError::Step { index, kind, source });
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Step {} ({}) panicked: {}", index, kind, message);
                self.reset();
                return Err(RunError::StepPanicked { index, kind, message });
            }
        };

        let output = match bag.output.take() {
            Some(out) if out.is_csi() == was_csi && !out.is_empty() => out,
            Some(_) => {
                self.reset();
                return Err(RunError::Step {
                    index,
                    kind,
                    source: StepError::Invalid("output is empty or changed shape family".to_string()),
                });
            }
            None => {
                self.reset();
                return Err(RunError::Step {
                    index,
                    kind,
                    source: StepError::Invalid("step produced no output".to_string()),
                });
            }
        };
        let wref = bag.wref_output.take().or(bag.wref.take());

        self.log
            .add_entry(kind.as_str(), &output.describe(), &parameters, &outcome.warnings);
        if !bag.labels.is_empty() {
            self.labels = std::mem::take(&mut bag.labels);
        }
        if let Some(baseline) = outcome.baseline {
            log::debug!("Step {} replaced the baseline", index);
            self.baseline = Some(baseline);
        }
        self.history.push(output, wref);
        self.state = self.state_after(Some(index));
        log::info!("State: {}", self.state);

        Ok(Transition::StepCompleted {
            index,
            kind,
            warnings: outcome.warnings,
        })
    }

    fn run_fitting(&mut self) -> Result<Transition, RunError> {
        let Some(data) = self.history.latest_data() else {
            self.reset();
            return Err(RunError::InvalidState {
                action: "fit",
                state: ControllerState::Fitting,
            });
        };
        let manual = self.manual;
        let data = if manual.is_identity() {
            data.clone()
        } else {
            log::info!(
                "Manual adjustment: {:.3} Hz, {:.2}°, {:.3}°/ppm",
                manual.frequency_hz,
                manual.phase0_deg,
                manual.phase1_deg_per_ppm
            );
            match data.map_spectra(|s| Ok::<_, SpectrumError>(manual.apply(s))) {
                Ok(adjusted) => adjusted,
                Err(e) => {
                    self.reset();
                    return Err(RunError::Step {
                        index: self.pipeline.len(),
                        kind: StepKind::External("ManualAdjustment".to_string()),
                        source: e.into(),
                    });
                }
            }
        };
        self.final_output = Some(data.clone());

        let Some(fitter) = self.fitter.as_ref() else {
            self.state = ControllerState::Done;
            log::info!("No fitter configured; run finished");
            return Ok(Transition::Finished);
        };
        let result = fit_all(
            fitter.as_ref(),
            &data,
            self.history.latest_wref(),
            &self.header,
        );
        match result {
            Ok(fits) => {
                let failed = fits
                    .iter()
                    .filter(|f| matches!(f.outcome, VoxelOutcome::Failed { .. }))
                    .count();
                let fitted = fits.len() - failed;
                let warnings: Vec<String> = fits
                    .iter()
                    .filter_map(|f| match &f.outcome {
                        VoxelOutcome::Failed { message } => Some(format!("voxel {:?}: {}", f.voxel, message)),
                        VoxelOutcome::Fitted(_) => None,
                    })
                    .collect();
                self.log.add_entry(
                    "Fitting",
                    &format!("{} fitted, {} failed", fitted, failed),
                    "",
                    &warnings,
                );
                self.fits = fits;
                self.state = ControllerState::Done;
                log::info!("State: {}", self.state);
                Ok(Transition::Fitted { fitted, failed })
            }
            Err(e) => {
                log::error!("Fitting could not start: {}", e);
                self.reset();
                Err(RunError::Fitting(e))
            }
        }
    }
}
