/// Background execution of the controller
///
/// The controller lives on its own thread; callers talk to it through a
/// command channel and observe it through an event channel. Terminate is
/// delivered through the controller's cancel flag as well, so it takes
/// effect at the next step boundary even while autorun is busy.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::data::import::{Header, InputSet};
use crate::data::transients::Transients;
use crate::fitting::VoxelFit;
use crate::log::reproducibility::ProcessingLog;
use crate::steps::StepKind;

use super::controller::{ControllerState, ExecutionController, ManualAdjustment, RunError, Transition};
use super::Pipeline;

#[derive(Debug)]
pub enum WorkerCommand {
    Start {
        inputs: Vec<PathBuf>,
        wref: Option<PathBuf>,
    },
    StartWith(Box<InputSet>),
    /// One transition
    Advance,
    /// Transitions until done, failure or cancellation
    Autorun,
    SetManualAdjustment(ManualAdjustment),
    SetPipeline(Pipeline),
    Terminate,
    Shutdown,
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: Option<Transients>,
    pub header: Header,
    pub labels: Vec<String>,
    pub fits: Vec<VoxelFit>,
    pub log: ProcessingLog,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    StateChanged(ControllerState),
    StepCompleted {
        index: usize,
        kind: StepKind,
    },
    /// Follows `StepCompleted` when the step fell back or warned
    StepDegraded {
        index: usize,
        kind: StepKind,
        warnings: Vec<String>,
    },
    FitCompleted {
        fitted: usize,
        failed: usize,
    },
    /// The run stopped and the controller is back in `Idle`
    Failed(String),
    /// A command was not valid in the current state; nothing changed
    Rejected(String),
    Finished(Box<RunSummary>),
}

pub struct PipelineWorker {
    commands: Sender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PipelineWorker {
    pub fn spawn(controller: ExecutionController) -> std::io::Result<Self> {
        let (commands, command_rx) = unbounded();
        let (event_tx, events) = unbounded();
        let cancel = controller.cancel_handle();
        let handle = thread::Builder::new()
            .name("mrs-pipeline".to_string())
            .spawn(move || worker_loop(controller, command_rx, event_tx))?;
        Ok(Self {
            commands,
            events,
            cancel,
            handle: Some(handle),
        })
    }

    /// Queue a command; returns false once the worker has exited
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Cancel at the next step boundary and return to `Idle`
    pub fn terminate(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.send(WorkerCommand::Terminate);
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Pipeline worker thread panicked");
            }
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    mut controller: ExecutionController,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
) {
    let emit = |event: WorkerEvent| {
        // receiver gone means nobody is listening any more
        let _ = events.send(event);
    };

    for command in commands.iter() {
        log::debug!("Worker command: {:?}", command);
        match command {
            WorkerCommand::Start { inputs, wref } => {
                emit(WorkerEvent::StateChanged(ControllerState::Loading));
                let result = controller.start(&inputs, wref.as_deref());
                report_start(&controller, result, &emit);
            }
            WorkerCommand::StartWith(set) => {
                emit(WorkerEvent::StateChanged(ControllerState::Loading));
                let result = controller.start_with(*set);
                report_start(&controller, result, &emit);
            }
            WorkerCommand::Advance => {
                step_once(&mut controller, &emit);
            }
            WorkerCommand::Autorun => {
                while step_once(&mut controller, &emit) {
                    if controller.state() == ControllerState::Done {
                        break;
                    }
                }
            }
            WorkerCommand::SetManualAdjustment(adjustment) => {
                controller.set_manual_adjustment(adjustment);
            }
            WorkerCommand::SetPipeline(pipeline) => {
                if let Err(e) = controller.set_pipeline(pipeline) {
                    emit(WorkerEvent::Rejected(e.to_string()));
                }
            }
            WorkerCommand::Terminate => {
                controller.terminate();
                emit(WorkerEvent::StateChanged(ControllerState::Idle));
            }
            WorkerCommand::Shutdown => break,
        }
    }
    log::debug!("Pipeline worker stopped");
}

fn report_start(
    controller: &ExecutionController,
    result: Result<ControllerState, RunError>,
    emit: &impl Fn(WorkerEvent),
) {
    match result {
        Ok(state) => emit(WorkerEvent::StateChanged(state)),
        Err(e @ RunError::InvalidState { .. }) => emit(WorkerEvent::Rejected(e.to_string())),
        Err(e) => {
            emit(WorkerEvent::Failed(e.to_string()));
            emit(WorkerEvent::StateChanged(controller.state()));
        }
    }
}

/// Returns true when the transition succeeded
fn step_once(controller: &mut ExecutionController, emit: &impl Fn(WorkerEvent)) -> bool {
    match controller.advance() {
        Ok(transition) => {
            match transition {
                Transition::StepCompleted {
                    index,
                    kind,
                    warnings,
                } => {
                    emit(WorkerEvent::StepCompleted {
                        index,
                        kind: kind.clone(),
                    });
                    if !warnings.is_empty() {
                        emit(WorkerEvent::StepDegraded {
                            index,
                            kind,
                            warnings,
                        });
                    }
                }
                Transition::Fitted { fitted, failed } => {
                    emit(WorkerEvent::FitCompleted { fitted, failed })
                }
                Transition::Finished => {}
            }
            emit(WorkerEvent::StateChanged(controller.state()));
            if controller.state() == ControllerState::Done {
                emit(WorkerEvent::Finished(Box::new(RunSummary {
                    output: controller.final_output().cloned(),
                    header: controller.header().clone(),
                    labels: controller.labels().to_vec(),
                    fits: controller.fit_results().to_vec(),
                    log: controller.processing_log().clone(),
                })));
            }
            true
        }
        Err(e @ RunError::InvalidState { .. }) => {
            emit(WorkerEvent::Rejected(e.to_string()));
            false
        }
        Err(e) => {
            emit(WorkerEvent::Failed(e.to_string()));
            emit(WorkerEvent::StateChanged(controller.state()));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::spectrum::tests::synthetic_fid;
    use crate::steps::parameter::ParameterSet;
    use crate::steps::{DataBag, Step, StepError, StepOutcome, StepRegistry};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn input_set(n: usize) -> Box<InputSet> {
        Box::new(InputSet {
            data: Transients::Svs(
                (0..n)
                    .map(|i| synthetic_fid(128, 0.0005, i as f64, 0.05))
                    .collect(),
            ),
            wref: None,
            header: Header::default(),
            vendor: "test".to_string(),
            sources: Vec::new(),
        })
    }

    fn worker(kinds: &[&str]) -> PipelineWorker {
        let registry = StepRegistry::with_builtin();
        let mut pipeline = Pipeline::new();
        for k in kinds {
            pipeline.push(registry.create(k).unwrap());
        }
        PipelineWorker::spawn(ExecutionController::new(pipeline)).unwrap()
    }

    /// Collect events up to and including the first one matching `stop`
    fn collect_until(worker: &PipelineWorker, stop: impl Fn(&WorkerEvent) -> bool) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        loop {
            let event = worker.events().recv_timeout(TIMEOUT).unwrap();
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    struct Slow {
        params: ParameterSet,
    }

    impl Step for Slow {
        fn kind(&self) -> StepKind {
            StepKind::External("Slow".to_string())
        }
        fn parameters(&self) -> &ParameterSet {
            &self.params
        }
        fn parameters_mut(&mut self) -> &mut ParameterSet {
            &mut self.params
        }
        fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
            thread::sleep(Duration::from_millis(20));
            data.pass_through();
            Ok(StepOutcome::ok())
        }
    }

    #[test]
    fn test_autorun_reports_every_transition() {
        let w = worker(&["ZeroPadding", "Average"]);
        w.send(WorkerCommand::StartWith(input_set(4)));
        w.send(WorkerCommand::Autorun);
        let events = collect_until(&w, |e| matches!(e, WorkerEvent::Finished(_)));

        assert!(matches!(events[0], WorkerEvent::StateChanged(ControllerState::Loading)));
        assert!(matches!(events[1], WorkerEvent::StateChanged(ControllerState::Running(0))));
        let steps: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::StepCompleted { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![0, 1]);

        let Some(WorkerEvent::Finished(summary)) = events.last() else {
            panic!("run did not finish");
        };
        assert_eq!(summary.output.as_ref().unwrap().len(), 1);
        assert_eq!(summary.log.len(), 2);
        assert!(summary.fits.is_empty());
        w.shutdown();
    }

    #[test]
    fn test_degraded_step_is_reported() {
        // ensemble steps pass CSI data through with a warning
        let w = worker(&["Average"]);
        let mut set = input_set(0);
        let voxel = synthetic_fid(128, 0.0005, 0.0, 0.05);
        set.data = Transients::Csi(
            crate::data::transients::CsiGrid::new([2, 1, 1], vec![voxel; 2]).unwrap(),
        );
        w.send(WorkerCommand::StartWith(set));
        w.send(WorkerCommand::Autorun);
        let events = collect_until(&w, |e| matches!(e, WorkerEvent::Finished(_)));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::StepDegraded { index: 0, warnings, .. } if !warnings.is_empty()
        )));
    }

    #[test]
    fn test_single_step_mode() {
        let w = worker(&["ZeroPadding"]);
        w.send(WorkerCommand::StartWith(input_set(2)));
        collect_until(&w, |e| matches!(e, WorkerEvent::StateChanged(ControllerState::Running(0))));

        w.send(WorkerCommand::Advance);
        let events = collect_until(&w, |e| matches!(e, WorkerEvent::StateChanged(_)));
        assert!(matches!(events[0], WorkerEvent::StepCompleted { index: 0, .. }));
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::StateChanged(ControllerState::Fitting))
        ));

        w.send(WorkerCommand::Advance);
        collect_until(&w, |e| matches!(e, WorkerEvent::Finished(_)));
    }

    #[test]
    fn test_load_failure_returns_to_idle() {
        let w = worker(&["Average"]);
        w.send(WorkerCommand::Start {
            inputs: vec![PathBuf::from("/nonexistent/svs.json")],
            wref: None,
        });
        let events = collect_until(&w, |e| matches!(e, WorkerEvent::StateChanged(ControllerState::Idle)));
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Failed(_))));
    }

    #[test]
    fn test_advance_while_idle_is_rejected() {
        let w = worker(&["Average"]);
        w.send(WorkerCommand::Advance);
        let event = w.events().recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(event, WorkerEvent::Rejected(_)));
    }

    #[test]
    fn test_terminate_during_autorun() {
        let mut pipeline = Pipeline::new();
        for _ in 0..50 {
            pipeline.push(Box::new(Slow {
                params: ParameterSet::new(),
            }));
        }
        let w = PipelineWorker::spawn(ExecutionController::new(pipeline)).unwrap();
        w.send(WorkerCommand::StartWith(input_set(2)));
        w.send(WorkerCommand::Autorun);
        collect_until(&w, |e| matches!(e, WorkerEvent::StepCompleted { .. }));

        w.terminate();
        let events = collect_until(&w, |e| matches!(e, WorkerEvent::Failed(_)));
        let completed = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::StepCompleted { .. }))
            .count();
        assert!(completed < 49);
        assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Finished(_))));
        collect_until(&w, |e| matches!(e, WorkerEvent::StateChanged(ControllerState::Idle)));
    }
}
