//! Operator interaction
//!
//! The orchestrator never touches stdin/stdout directly; every prompt and
//! report goes through [`Operator`]. [`ConsoleOperator`] is the terminal
//! implementation, [`ScriptedOperator`] replays canned answers.

use super::config::ExperimentConfig;
use super::state::ExperimentState;
use crate::analysis::AnalysisReport;
use crate::error::{AppResult, DaqError};
use crate::measurement::{ExperimentPhase, SampleBatch};
use std::collections::VecDeque;
use std::io::{BufRead, Write};

/// Answer to a menu prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    /// Start (or repeat) a measurement
    Measure,
    /// Leave the program
    Quit,
}

/// Everything the orchestrator asks of or tells the operator.
pub trait Operator {
    /// Main menu shown in `Start`.
    fn main_menu(&mut self) -> AppResult<MenuChoice>;

    /// Collect the run parameters, offering `defaults`.
    fn read_parameters(&mut self, defaults: &ExperimentConfig) -> AppResult<ExperimentConfig>;

    /// Tell the operator where the test lead must be for `phase`.
    fn announce_phase(&mut self, phase: ExperimentPhase) -> AppResult<()>;

    /// Summary of an acquired batch.
    fn show_batch(&mut self, phase: ExperimentPhase, batch: &SampleBatch) -> AppResult<()>;

    /// Final C ± u(C).
    fn show_result(&mut self, report: &AnalysisReport) -> AppResult<()>;

    /// A state's action failed. `instrument` is the resource involved, if any.
    fn report_failure(&mut self, state: ExperimentState, error: &DaqError, instrument: Option<&str>);

    /// Continuation menu shown in `Finalize`.
    fn final_menu(&mut self) -> AppResult<MenuChoice>;
}

/// Line-oriented terminal operator
pub struct ConsoleOperator<R, W> {
    input: R,
    output: W,
}

impl ConsoleOperator<std::io::BufReader<std::io::Stdin>, std::io::Stdout> {
    /// Operator on the process stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    /// Operator over arbitrary streams.
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Give back the output stream.
    pub fn into_output(self) -> W {
        self.output
    }

    fn read_line(&mut self) -> AppResult<String> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "input closed",
            )));
        }
        Ok(line.trim().to_string())
    }

    fn prompt_f64(&mut self, label: &str, default: f64) -> AppResult<f64> {
        loop {
            write!(self.output, "{} [{}]: ", label, default)?;
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(default);
            }
            match line.replace(',', ".").parse::<f64>() {
                Ok(v) => return Ok(v),
                Err(_) => writeln!(self.output, "  '{}' is not a number", line)?,
            }
        }
    }

    fn prompt_u32(&mut self, label: &str, default: u32) -> AppResult<u32> {
        loop {
            write!(self.output, "{} [{}]: ", label, default)?;
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(default);
            }
            match line.parse::<u32>() {
                Ok(v) => return Ok(v),
                Err(_) => writeln!(self.output, "  '{}' is not a whole number", line)?,
            }
        }
    }

    fn menu(&mut self, title: &str, measure_label: &str) -> AppResult<MenuChoice> {
        loop {
            writeln!(self.output)?;
            writeln!(self.output, "=== {} ===", title)?;
            writeln!(self.output, "  1) {}", measure_label)?;
            writeln!(self.output, "  0) Quit")?;
            write!(self.output, "> ")?;
            match self.read_line()?.as_str() {
                "1" => return Ok(MenuChoice::Measure),
                "0" | "q" | "Q" => return Ok(MenuChoice::Quit),
                other => writeln!(self.output, "  unknown option '{}'", other)?,
            }
        }
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn main_menu(&mut self) -> AppResult<MenuChoice> {
        self.menu("FRH capacitance measurement", "New measurement")
    }

    fn read_parameters(&mut self, defaults: &ExperimentConfig) -> AppResult<ExperimentConfig> {
        loop {
            writeln!(self.output, "Experiment parameters (Enter keeps the default)")?;
            let config = ExperimentConfig {
                nominal_capacitance_f: self
                    .prompt_f64("Nominal capacitance (F)", defaults.nominal_capacitance_f)?,
                resistance_ohm: self.prompt_f64("Series resistance (ohm)", defaults.resistance_ohm)?,
                time_constant_s: self.prompt_f64("Time constant (s)", defaults.time_constant_s)?,
                frequency_hz: self.prompt_f64("Frequency (Hz)", defaults.frequency_hz)?,
                sample_spacing_s: self.prompt_f64("Sample spacing (s)", defaults.sample_spacing_s)?,
                cycle_count: self.prompt_u32("Cycles", defaults.cycle_count)?,
            };
            match config.validate() {
                Ok(()) => {
                    writeln!(self.output, "{}", config)?;
                    return Ok(config);
                }
                Err(e) => writeln!(self.output, "  {}", e)?,
            }
        }
    }

    fn announce_phase(&mut self, phase: ExperimentPhase) -> AppResult<()> {
        let where_ = match phase {
            ExperimentPhase::GeneratorPhase => "across the loaded generator output (channel 1)",
            ExperimentPhase::CapacitorPhase => "across the capacitor",
        };
        writeln!(self.output)?;
        write!(
            self.output,
            "Connect the DMM {} and press Enter to measure...",
            where_
        )?;
        self.read_line()?;
        Ok(())
    }

    fn show_batch(&mut self, phase: ExperimentPhase, batch: &SampleBatch) -> AppResult<()> {
        match batch.min_max() {
            Some((lo, hi)) => writeln!(
                self.output,
                "{} phase: {} readings, {:.6} V .. {:.6} V",
                phase,
                batch.len(),
                lo,
                hi
            )?,
            None => writeln!(self.output, "{} phase: no readings", phase)?,
        }
        Ok(())
    }

    fn show_result(&mut self, report: &AnalysisReport) -> AppResult<()> {
        writeln!(self.output)?;
        writeln!(
            self.output,
            "Loaded generator peak: {:.6} V ± {:.6} V",
            report.peak_voltage.value, report.peak_voltage.uncertainty
        )?;
        writeln!(
            self.output,
            "Cx = {:.6e} F ± {:.3e} F ({:.4} %), {} cycles, R = {} ohm",
            report.capacitance_f,
            report.uncertainty_f,
            report.relative_uncertainty * 100.0,
            report.valid_cycles,
            report.resistance_ohm
        )?;
        Ok(())
    }

    fn report_failure(&mut self, state: ExperimentState, error: &DaqError, instrument: Option<&str>) {
        // Nothing sensible left to do if the terminal itself is gone.
        let _ = match instrument {
            Some(resource) => writeln!(self.output, "{} failed on '{}': {}", state, resource, error),
            None => writeln!(self.output, "{} failed: {}", state, error),
        };
    }

    fn final_menu(&mut self) -> AppResult<MenuChoice> {
        self.menu("Measurement finished", "Measure again")
    }
}

/// Operator that replays prepared answers and records what it was shown
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    menu_choices: VecDeque<MenuChoice>,
    parameters: VecDeque<ExperimentConfig>,
    /// Phases announced, in order
    pub announced: Vec<ExperimentPhase>,
    /// Batch sizes shown, in order
    pub shown_batches: Vec<(ExperimentPhase, usize)>,
    /// Results shown
    pub results: Vec<AnalysisReport>,
    /// Failures reported as `(state, message, instrument)`
    pub failures: Vec<(ExperimentState, String, Option<String>)>,
}

impl ScriptedOperator {
    /// Answer menus with `choices` in order; both menus draw from the same queue.
    pub fn new(choices: impl IntoIterator<Item = MenuChoice>) -> Self {
        Self {
            menu_choices: choices.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Queue the parameters returned by the next `read_parameters`.
    pub fn with_parameters(mut self, config: ExperimentConfig) -> Self {
        self.parameters.push_back(config);
        self
    }

    fn next_choice(&mut self) -> MenuChoice {
        self.menu_choices.pop_front().unwrap_or(MenuChoice::Quit)
    }
}

impl Operator for ScriptedOperator {
    fn main_menu(&mut self) -> AppResult<MenuChoice> {
        Ok(self.next_choice())
    }

    fn read_parameters(&mut self, defaults: &ExperimentConfig) -> AppResult<ExperimentConfig> {
        let config = self.parameters.pop_front().unwrap_or_else(|| defaults.clone());
        config.validate()?;
        Ok(config)
    }

    fn announce_phase(&mut self, phase: ExperimentPhase) -> AppResult<()> {
        self.announced.push(phase);
        Ok(())
    }

    fn show_batch(&mut self, phase: ExperimentPhase, batch: &SampleBatch) -> AppResult<()> {
        self.shown_batches.push((phase, batch.len()));
        Ok(())
    }

    fn show_result(&mut self, report: &AnalysisReport) -> AppResult<()> {
        self.results.push(report.clone());
        Ok(())
    }

    fn report_failure(&mut self, state: ExperimentState, error: &DaqError, instrument: Option<&str>) {
        self.failures
            .push((state, error.to_string(), instrument.map(str::to_string)));
    }

    fn final_menu(&mut self) -> AppResult<MenuChoice> {
        Ok(self.next_choice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn console(input: &str) -> ConsoleOperator<Cursor<Vec<u8>>, Vec<u8>> {
        ConsoleOperator::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn test_menu_retries_unknown_option() {
        let mut op = console("7\n1\n");
        assert_eq!(op.main_menu().unwrap(), MenuChoice::Measure);
        let out = String::from_utf8(op.into_output()).unwrap();
        assert!(out.contains("unknown option '7'"));
    }

    #[test]
    fn test_menu_eof_is_error() {
        let mut op = console("");
        assert!(matches!(op.final_menu(), Err(DaqError::Io(_))));
    }

    #[test]
    fn test_parameters_keep_defaults_on_empty_lines() {
        let mut op = console("\n\n\n\n\n\n");
        let defaults = ExperimentConfig::default();
        assert_eq!(op.read_parameters(&defaults).unwrap(), defaults);
    }

    #[test]
    fn test_parameters_accept_decimal_comma_and_reprompt() {
        // capacitance, resistance (bad then good), tau, f, spacing, cycles
        let mut op = console("2,2e-6\nabc\n47000\n\n2\n0.01\n10\n");
        let config = op.read_parameters(&ExperimentConfig::default()).unwrap();
        assert_eq!(config.nominal_capacitance_f, 2.2e-6);
        assert_eq!(config.resistance_ohm, 47000.0);
        assert_eq!(config.frequency_hz, 2.0);
        assert_eq!(config.cycle_count, 10);
    }

    #[test]
    fn test_invalid_parameters_restart_prompt() {
        let mut op = console("0\n\n\n\n\n\n\n\n\n\n\n\n");
        let config = op.read_parameters(&ExperimentConfig::default()).unwrap();
        assert_eq!(config, ExperimentConfig::default());
        let out = String::from_utf8(op.into_output()).unwrap();
        assert!(out.contains("nominal capacitance must be > 0"));
    }

    #[test]
    fn test_failure_names_instrument() {
        let mut op = console("");
        let err = DaqError::TriggerTimeout {
            resource: "SIM::DMM".to_string(),
            timeout: std::time::Duration::from_secs(5),
        };
        op.report_failure(ExperimentState::Measure, &err, Some("SIM::DMM"));
        let out = String::from_utf8(op.into_output()).unwrap();
        assert!(out.starts_with("MEASURE failed on 'SIM::DMM'"));
    }

    #[test]
    fn test_scripted_operator_defaults_to_quit() {
        let mut op = ScriptedOperator::new([MenuChoice::Measure]);
        assert_eq!(op.main_menu().unwrap(), MenuChoice::Measure);
        assert_eq!(op.final_menu().unwrap(), MenuChoice::Quit);
    }
}
