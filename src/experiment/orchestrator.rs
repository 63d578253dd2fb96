//! Acquisition orchestrator
//!
//! Drives [`ExperimentState`] from `Start` to `Done`, running each state's
//! entry action and feeding its [`StepOutcome`] to the transition function.
//! Any failure in `Initialize`, `Measure`, `Save` or `Analyze` lands in
//! `Finalize`, which closes whatever instrument handles were opened.

use super::config::ExperimentConfig;
use super::connector::InstrumentConnector;
use super::operator::{MenuChoice, Operator};
use super::state::{ExperimentState, StepOutcome};
use crate::analysis::{AnalysisReport, Analyzer, RcTransientAnalyzer};
use crate::config::FrhConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::{FunctionGenerator, InstrumentRole, Multimeter};
use crate::measurement::{ExperimentPhase, SampleBatch};
use crate::storage::BatchSink;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Both phase batches of one run, ready for analysis.
///
/// Only built when the capacitor batch is saved after the generator batch.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    generator: SampleBatch,
    capacitor: SampleBatch,
    experiment: ExperimentConfig,
}

impl CompletedRun {
    /// Generator-phase batch.
    pub fn generator(&self) -> &SampleBatch {
        &self.generator
    }

    /// Capacitor-phase batch.
    pub fn capacitor(&self) -> &SampleBatch {
        &self.capacitor
    }

    /// Analyze with the run's own parameters.
    pub fn analyze(&self, analyzer: &dyn Analyzer) -> AppResult<AnalysisReport> {
        AnalysisReport::compute(
            analyzer,
            &self.generator,
            &self.capacitor,
            self.experiment.nominal_capacitance_f,
            self.experiment.resistance_ohm,
            self.experiment.sample_spacing_s,
        )
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// Both phases acquired and analyzed
    Analyzed(AnalysisReport),
    /// A state failed; the run went straight to `Finalize`
    Aborted {
        /// State whose action failed
        state: ExperimentState,
        /// Failure message
        reason: String,
    },
}

/// Per-run scratch state, dropped when the machine returns to `Start`.
struct RunContext {
    experiment: Option<ExperimentConfig>,
    generator: Option<FunctionGenerator>,
    multimeter: Option<Multimeter>,
    generator_idn: Option<String>,
    multimeter_idn: Option<String>,
    phase: ExperimentPhase,
    pending: Option<SampleBatch>,
    generator_batch: Option<SampleBatch>,
    completed: Option<CompletedRun>,
    report: Option<AnalysisReport>,
    abort: Option<(ExperimentState, String)>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            experiment: None,
            generator: None,
            multimeter: None,
            generator_idn: None,
            multimeter_idn: None,
            phase: ExperimentPhase::GeneratorPhase,
            pending: None,
            generator_batch: None,
            completed: None,
            report: None,
            abort: None,
        }
    }
}

impl RunContext {
    fn instruments(&mut self) -> AppResult<(&mut FunctionGenerator, &mut Multimeter)> {
        match (self.generator.as_mut(), self.multimeter.as_mut()) {
            (Some(afg), Some(dmm)) => Ok((afg, dmm)),
            _ => Err(DaqError::Configuration(
                "instruments are not initialized".to_string(),
            )),
        }
    }

    /// `resource (identity)` for the instrument behind `error`, if any.
    fn describe_instrument(&self, error: &DaqError) -> Option<String> {
        let resource = error.resource()?;
        let idn = [
            (self.generator.as_ref().map(|g| g.resource()), &self.generator_idn),
            (self.multimeter.as_ref().map(|m| m.resource()), &self.multimeter_idn),
        ]
        .into_iter()
        .find(|(r, _)| *r == Some(resource))
        .and_then(|(_, idn)| idn.clone());

        Some(match idn {
            Some(idn) => format!("{} ({})", resource, idn),
            None => resource.to_string(),
        })
    }

    async fn close_instruments(&mut self) {
        if let Some(dmm) = self.multimeter.take() {
            if let Err(e) = dmm.close().await {
                warn!("Failed to close multimeter: {}", e);
            }
        }
        if let Some(afg) = self.generator.take() {
            if let Err(e) = afg.close().await {
                warn!("Failed to close generator: {}", e);
            }
        }
    }
}

/// Runs the measurement state machine against a bench.
pub struct Orchestrator {
    config: FrhConfig,
    connector: Box<dyn InstrumentConnector>,
    sink: Box<dyn BatchSink>,
    analyzer: Box<dyn Analyzer>,
    state: ExperimentState,
    visited: Vec<ExperimentState>,
    results: Vec<RunResult>,
}

impl Orchestrator {
    /// Orchestrator with the reference analyzer on the configured DC range.
    pub fn new(
        config: FrhConfig,
        connector: impl InstrumentConnector + 'static,
        sink: impl BatchSink + 'static,
    ) -> Self {
        let analyzer = config
            .dc_range()
            .map(RcTransientAnalyzer::with_range)
            .unwrap_or_default();
        Self {
            config,
            connector: Box::new(connector),
            sink: Box::new(sink),
            analyzer: Box::new(analyzer),
            state: ExperimentState::Start,
            visited: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Replace the analyzer.
    pub fn with_analyzer(mut self, analyzer: impl Analyzer + 'static) -> Self {
        self.analyzer = Box::new(analyzer);
        self
    }

    /// Current state.
    pub fn state(&self) -> ExperimentState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn visited(&self) -> &[ExperimentState] {
        &self.visited
    }

    /// One entry per run that reached `Finalize`.
    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    /// Run until the operator quits.
    pub async fn run(&mut self, operator: &mut dyn Operator) -> AppResult<()> {
        self.state = ExperimentState::Start;
        self.visited.push(self.state);
        let mut run = RunContext::default();

        while !self.state.is_terminal() {
            let span = info_span!("run", index = self.results.len() + 1, state = %self.state);
            let outcome = self.step(operator, &mut run).instrument(span).await;

            let next = match self.state.next(outcome) {
                Ok(next) => next,
                Err(e) => {
                    error!("{}", e);
                    run.close_instruments().await;
                    return Err(e);
                }
            };
            debug!("{} --[{}]--> {}", self.state, outcome, next);

            if next == ExperimentState::Start {
                run = RunContext::default();
            }
            self.state = next;
            self.visited.push(next);
        }
        info!("Acquisition finished after {} run(s)", self.results.len());
        Ok(())
    }

    async fn step(&mut self, operator: &mut dyn Operator, run: &mut RunContext) -> StepOutcome {
        match self.state {
            ExperimentState::Start => match operator.main_menu() {
                Ok(MenuChoice::Measure) => StepOutcome::Completed,
                Ok(MenuChoice::Quit) => StepOutcome::Quit,
                Err(e) => {
                    warn!("Main menu: {}", e);
                    StepOutcome::Quit
                }
            },
            ExperimentState::InputParameters => {
                match operator.read_parameters(&self.config.experiment) {
                    Ok(experiment) => {
                        info!("Parameters: {}", experiment);
                        run.experiment = Some(experiment);
                        StepOutcome::Completed
                    }
                    Err(e) => {
                        warn!("Parameter input: {}", e);
                        StepOutcome::Quit
                    }
                }
            }
            ExperimentState::Initialize => {
                let result = self.initialize(run).await;
                self.settle(result.map(|_| StepOutcome::Completed), operator, run)
            }
            ExperimentState::Measure => {
                let span = info_span!("phase", phase = %run.phase);
                let result = self.measure(operator, run).instrument(span).await;
                self.settle(result.map(|_| StepOutcome::Completed), operator, run)
            }
            ExperimentState::Save => {
                let result = self.save(run).await;
                self.settle(result, operator, run)
            }
            ExperimentState::Analyze => {
                let result = self.analyze(operator, run).await;
                self.settle(result.map(|_| StepOutcome::Completed), operator, run)
            }
            ExperimentState::Finalize => self.finalize(operator, run).await,
            ExperimentState::Done => StepOutcome::Quit,
        }
    }

    /// Turn a failed action into `Failed`, reporting it on the way.
    fn settle(
        &self,
        result: AppResult<StepOutcome>,
        operator: &mut dyn Operator,
        run: &mut RunContext,
    ) -> StepOutcome {
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let instrument = run.describe_instrument(&e);
                error!(
                    state = %self.state,
                    instrument = instrument.as_deref().unwrap_or("-"),
                    "{}",
                    e
                );
                operator.report_failure(self.state, &e, instrument.as_deref());
                run.abort = Some((self.state, e.to_string()));
                StepOutcome::Failed
            }
        }
    }

    async fn initialize(&mut self, run: &mut RunContext) -> AppResult<()> {
        let experiment = run
            .experiment
            .clone()
            .ok_or_else(|| DaqError::Configuration("experiment parameters missing".to_string()))?;
        let samples = experiment.samples_per_trigger(self.config.acquisition.samples_per_trigger)?;
        self.config.check_fetch_timeout(&experiment, samples)?;
        let range = self.config.dc_range()?;

        let channel = self.connector.open(InstrumentRole::Generator).await?;
        run.generator = Some(
            FunctionGenerator::new(channel).with_settle_time(self.config.generator.reset_settle()),
        );
        let channel = self.connector.open(InstrumentRole::Multimeter).await?;
        run.multimeter = Some(
            Multimeter::new(channel).with_settle_time(self.config.multimeter.reset_settle()),
        );

        let (afg, dmm) = run.instruments()?;
        let generator_idn = afg.identify().await?.trim().to_string();
        let multimeter_idn = dmm.identify().await?.trim().to_string();
        info!("Generator: {}", generator_idn);
        info!("Multimeter: {}", multimeter_idn);
        run.generator_idn = Some(generator_idn);
        run.multimeter_idn = Some(multimeter_idn);

        let (afg, dmm) = run.instruments()?;
        afg.reset().await?;
        dmm.reset().await?;

        afg.decouple_channels().await?;
        afg.configure_measurement_signal(
            experiment.frequency_hz,
            self.config.signal.amplitude_vpp,
            self.config.signal.offset_v,
        )
        .await?;
        afg.configure_trigger_pulse(experiment.frequency_hz).await?;
        afg.align_phases().await?;

        dmm.configure_dc_range(range.volts()).await?;
        dmm.set_speed(self.config.acquisition.speed).await?;
        dmm.configure_external_trigger(samples).await?;

        info!(
            "Bench initialized: {} samples per trigger, {} V range, {:?} speed",
            samples, range, self.config.acquisition.speed
        );
        Ok(())
    }

    async fn measure(&mut self, operator: &mut dyn Operator, run: &mut RunContext) -> AppResult<()> {
        let phase = run.phase;
        operator.announce_phase(phase)?;

        let (afg, dmm) = run.instruments()?;
        afg.start_outputs().await?;
        info!("Measuring...");
        let batch = dmm.measure_on_trigger().await?;

        operator.show_batch(phase, &batch)?;
        run.pending = Some(batch);
        Ok(())
    }

    async fn save(&mut self, run: &mut RunContext) -> AppResult<StepOutcome> {
        let phase = run.phase;
        let batch = run
            .pending
            .take()
            .ok_or_else(|| DaqError::Configuration(format!("no {} batch to save", phase)))?;
        self.sink.save_batch(phase, &batch).await?;

        match phase {
            ExperimentPhase::GeneratorPhase => run.generator_batch = Some(batch),
            ExperimentPhase::CapacitorPhase => {
                let generator = run.generator_batch.take().ok_or_else(|| {
                    DaqError::Configuration("capacitor batch saved before generator".to_string())
                })?;
                let experiment = run.experiment.clone().ok_or_else(|| {
                    DaqError::Configuration("experiment parameters missing".to_string())
                })?;
                run.completed = Some(CompletedRun {
                    generator,
                    capacitor: batch,
                    experiment,
                });
            }
        }
        run.phase = phase.next();
        Ok(StepOutcome::PhaseSaved(phase))
    }

    async fn analyze(&mut self, operator: &mut dyn Operator, run: &mut RunContext) -> AppResult<()> {
        let completed = run
            .completed
            .take()
            .ok_or_else(|| DaqError::Analysis("both phases must be saved first".to_string()))?;
        let report = completed.analyze(self.analyzer.as_ref())?;
        info!(
            "C = {:.6e} F ± {:.3e} F over {} cycles",
            report.capacitance_f, report.uncertainty_f, report.valid_cycles
        );
        self.sink.save_report(&report).await?;
        operator.show_result(&report)?;
        run.report = Some(report);
        Ok(())
    }

    async fn finalize(&mut self, operator: &mut dyn Operator, run: &mut RunContext) -> StepOutcome {
        run.close_instruments().await;

        let result = match (run.report.take(), run.abort.take()) {
            (Some(report), _) => RunResult::Analyzed(report),
            (None, Some((state, reason))) => RunResult::Aborted { state, reason },
            (None, None) => RunResult::Aborted {
                state: ExperimentState::Finalize,
                reason: "run ended without a result".to_string(),
            },
        };
        self.results.push(result);

        match operator.final_menu() {
            Ok(MenuChoice::Measure) => StepOutcome::Continue,
            Ok(MenuChoice::Quit) => StepOutcome::Quit,
            Err(e) => {
                warn!("Final menu: {}", e);
                StepOutcome::Quit
            }
        }
    }
}
