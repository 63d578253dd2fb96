use frh_daq::config::FrhConfig;
use frh_daq::experiment::{
    ExperimentState, MenuChoice, Orchestrator, RunResult, ScriptedOperator,
};
use frh_daq::measurement::ExperimentPhase;
use frh_daq::sim::{Fault, InstrumentRole, RcCircuit, SimulatedBench};
use frh_daq::storage::{read_batch, TextFileStore, BATCH_HEADER};
use std::path::Path;
use ExperimentState::*;

fn fast_config(dir: &Path) -> FrhConfig {
    let mut config = FrhConfig::default();
    config.generator.reset_settle_ms = 0;
    config.multimeter.reset_settle_ms = 0;
    config.storage.output_dir = dir.to_path_buf();
    config
}

fn orchestrator(config: FrhConfig, bench: &SimulatedBench) -> Orchestrator {
    let store = TextFileStore::from_config(&config.storage);
    Orchestrator::new(config, bench.clone(), store)
}

#[tokio::test]
async fn test_full_run_recovers_capacitance() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let bench = SimulatedBench::new();
    let mut orch = orchestrator(config.clone(), &bench);
    let mut operator = ScriptedOperator::new([MenuChoice::Measure, MenuChoice::Quit]);

    orch.run(&mut operator).await.unwrap();

    assert_eq!(
        orch.visited(),
        &[
            Start,
            InputParameters,
            Initialize,
            Measure,
            Save,
            Measure,
            Save,
            Analyze,
            Finalize,
            Done
        ]
    );
    assert_eq!(
        operator.announced,
        vec![ExperimentPhase::GeneratorPhase, ExperimentPhase::CapacitorPhase]
    );
    assert!(operator.failures.is_empty());

    let report = match orch.results() {
        [RunResult::Analyzed(report)] => report.clone(),
        other => panic!("expected one analyzed run, got {:?}", other),
    };
    let relative_error = (report.capacitance_f - 1e-6).abs() / 1e-6;
    assert!(
        relative_error < 0.05,
        "C = {:e} F is too far from 1 uF",
        report.capacitance_f
    );
    assert!(report.uncertainty_f > 0.0);
    assert!(report.valid_cycles >= 1);
    assert_eq!(operator.results.len(), 1);

    let generator = read_batch(config.generator_path()).await.unwrap();
    let capacitor = read_batch(config.capacitor_path()).await.unwrap();
    assert_eq!(generator.len(), 250);
    assert_eq!(capacitor.len(), 250);
    let raw = std::fs::read_to_string(config.generator_path()).unwrap();
    assert!(raw.starts_with(BATCH_HEADER));
    assert!(config.report_path().exists());

    assert_eq!(bench.open_channels(), 0);
}

#[tokio::test]
async fn test_save_failure_goes_to_finalize() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("occupied");
    std::fs::write(&not_a_dir, "x").unwrap();
    let bench = SimulatedBench::new();
    let mut orch = orchestrator(fast_config(&not_a_dir), &bench);
    let mut operator = ScriptedOperator::new([MenuChoice::Measure, MenuChoice::Quit]);

    orch.run(&mut operator).await.unwrap();

    assert_eq!(
        orch.visited(),
        &[Start, InputParameters, Initialize, Measure, Save, Finalize, Done]
    );
    assert!(matches!(
        orch.results(),
        [RunResult::Aborted { state: Save, .. }]
    ));
    assert_eq!(operator.failures.len(), 1);
    assert_eq!(bench.open_channels(), 0);
}

#[tokio::test]
async fn test_missing_trigger_aborts_measure() {
    let dir = tempfile::tempdir().unwrap();
    let bench = SimulatedBench::new();
    bench.set_trigger_cable(false);
    let mut orch = orchestrator(fast_config(dir.path()), &bench);
    let mut operator = ScriptedOperator::new([MenuChoice::Measure, MenuChoice::Quit]);

    orch.run(&mut operator).await.unwrap();

    assert_eq!(
        orch.visited(),
        &[Start, InputParameters, Initialize, Measure, Finalize, Done]
    );
    match orch.results() {
        [RunResult::Aborted { state, reason }] => {
            assert_eq!(*state, Measure);
            assert!(reason.contains("No external trigger"), "{}", reason);
        }
        other => panic!("expected an aborted run, got {:?}", other),
    }
    assert!(!dir.path().join("mediciones_generador.txt").exists());
    assert_eq!(bench.open_channels(), 0);
}

#[tokio::test]
async fn test_capacitor_phase_timeout_skips_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let bench = SimulatedBench::new();
    // The generator-phase fetch goes through; the capacitor-phase one times out.
    bench.inject_fault_after(InstrumentRole::Multimeter, "FETCh?", 1, Fault::Timeout);
    let mut orch = orchestrator(config.clone(), &bench);
    let mut operator = ScriptedOperator::new([MenuChoice::Measure, MenuChoice::Quit]);

    orch.run(&mut operator).await.unwrap();

    assert_eq!(
        orch.visited(),
        &[
            Start,
            InputParameters,
            Initialize,
            Measure,
            Save,
            Measure,
            Finalize,
            Done
        ]
    );
    assert!(!orch.visited().contains(&Analyze));
    assert!(matches!(
        orch.results(),
        [RunResult::Aborted { state: Measure, .. }]
    ));
    assert_eq!(operator.shown_batches.len(), 1);
    assert!(config.generator_path().exists());
    assert!(!config.capacitor_path().exists());
    assert!(!config.report_path().exists());

    let fetches = bench
        .command_log(InstrumentRole::Multimeter)
        .iter()
        .filter(|c| c.as_str() == "FETCh?")
        .count();
    assert_eq!(fetches, 2);
    assert_eq!(bench.closes(InstrumentRole::Generator), 1);
    assert_eq!(bench.closes(InstrumentRole::Multimeter), 1);
    assert_eq!(bench.open_channels(), 0);
}

#[tokio::test]
async fn test_slow_circuit_is_analyzed() {
    let dir = tempfile::tempdir().unwrap();
    let bench = SimulatedBench::with_circuit(RcCircuit {
        resistance_ohm: 100e3,
        capacitance_f: 2.2e-6,
    });
    let mut orch = orchestrator(fast_config(dir.path()), &bench);
    let mut operator = ScriptedOperator::new([MenuChoice::Measure, MenuChoice::Quit]);

    orch.run(&mut operator).await.unwrap();

    let report = match orch.results() {
        [RunResult::Analyzed(report)] => report.clone(),
        other => panic!("expected one analyzed run, got {:?}", other),
    };
    let relative_error = (report.capacitance_f - 2.2e-6).abs() / 2.2e-6;
    assert!(
        relative_error < 0.05,
        "C = {:e} F is too far from 2.2 uF",
        report.capacitance_f
    );
    assert_eq!(report.valid_cycles, 5);
}

#[tokio::test]
async fn test_continue_starts_a_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let bench = SimulatedBench::new();
    let mut orch = orchestrator(fast_config(dir.path()), &bench);
    let mut operator = ScriptedOperator::new([
        MenuChoice::Measure,
        MenuChoice::Measure,
        MenuChoice::Measure,
        MenuChoice::Quit,
    ]);

    orch.run(&mut operator).await.unwrap();

    assert_eq!(orch.results().len(), 2);
    assert!(orch
        .results()
        .iter()
        .all(|r| matches!(r, RunResult::Analyzed(_))));
    assert_eq!(orch.state(), Done);
    assert_eq!(bench.open_channels(), 0);
}
