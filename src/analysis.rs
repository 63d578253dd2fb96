//! RC transient analysis
//!
//! Turns the two phase batches into a capacitance estimate with a combined
//! standard uncertainty. The excitation is a square wave into a series RC, so
//! each rising half-cycle of the capacitor voltage follows
//! `v(t) = Vp - (Vp - v0) · exp(-t / RC)`, i.e. `ln(1 - v/Vp)` is linear in `t`
//! with slope `-1/RC`. The starting level `v0` only moves the intercept, so
//! cycles that never fully discharge fit the same way.

use crate::error::{AppResult, DaqError};
use crate::instrument::DcRange;
use crate::measurement::SampleBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keithley 2110 DCV gain error (fraction of reading).
pub const DMM_GAIN_ERROR: f64 = 35e-6;
/// Keithley 2110 DCV offset error (fraction of range).
pub const DMM_OFFSET_ERROR: f64 = 5e-6;

/// Lower edge of the fitted band, as a fraction of the peak.
const FIT_LOW: f64 = 0.1;
/// Upper edge of the fitted band.
const FIT_HIGH: f64 = 0.9;
/// Points needed for a cycle to count.
const MIN_FIT_POINTS: usize = 3;
/// Reversal that confirms a crest or valley, as a fraction of the peak.
const TURN_HYSTERESIS: f64 = 0.05;

/// Plateau level of the excitation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakVoltage {
    /// Mean high level (V)
    pub value: f64,
    /// Standard deviation of the high-level samples (V)
    pub uncertainty: f64,
}

/// Per-cycle fit results over the capacitor batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientFit {
    /// `-1 / (slope · R)` per valid cycle (F)
    pub capacitance_estimates: Vec<f64>,
    /// Slope of `ln(1 - v/Vp)` against time (1/s)
    pub fit_slopes: Vec<f64>,
    /// Intercept of each fit
    pub fit_intercepts: Vec<f64>,
    /// Pearson r of each fit
    pub correlation_values: Vec<f64>,
    /// Standard error of each slope
    pub fit_errors: Vec<f64>,
    /// Cycles with enough points inside the fit band
    pub valid_cycle_count: usize,
    /// Readings in the capacitor batch
    pub sample_count: usize,
    /// Smallest voltage step seen in the batch
    pub digitization_step: f64,
}

impl TransientFit {
    /// Mean of the per-cycle estimates.
    pub fn mean_capacitance(&self) -> Option<f64> {
        mean(&self.capacitance_estimates)
    }
}

/// Combined standard uncertainty of C
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Uncertainty {
    /// In farads
    pub absolute: f64,
    /// Relative to the nominal capacitance
    pub relative: f64,
}

/// Analysis routines consumed by the orchestrator.
pub trait Analyzer: Send + Sync {
    /// Plateau voltage of the generator-phase batch.
    fn analyze_generator_signal(&self, batch: &SampleBatch) -> AppResult<PeakVoltage>;

    /// Fit every charging cycle in the capacitor-phase batch.
    fn process_transient_curve(
        &self,
        batch: &SampleBatch,
        peak: &PeakVoltage,
        sample_spacing_s: f64,
        resistance_ohm: f64,
    ) -> AppResult<TransientFit>;

    /// Combine the scatter of the cycle estimates with the instrument terms.
    fn propagate_uncertainty(
        &self,
        slopes: &[f64],
        valid_cycles: usize,
        digitization_step: f64,
        peak: &PeakVoltage,
        nominal_capacitance_f: f64,
        resistance_ohm: f64,
    ) -> AppResult<Uncertainty>;
}

/// Least-squares log-linear fit over rising half-cycles.
///
/// The DMM offset error is specified against full scale, so the analyzer
/// needs the range the capacitor batch was taken on.
#[derive(Debug, Clone, Copy)]
pub struct RcTransientAnalyzer {
    range: DcRange,
}

impl RcTransientAnalyzer {
    /// Analyzer for batches taken on the 10 V range.
    pub fn new() -> Self {
        Self::with_range(DcRange::R10V)
    }

    /// Analyzer for batches taken on `range`.
    pub fn with_range(range: DcRange) -> Self {
        Self { range }
    }

    /// Range used for the offset term.
    pub fn range(&self) -> DcRange {
        self.range
    }
}

impl Default for RcTransientAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for RcTransientAnalyzer {
    fn analyze_generator_signal(&self, batch: &SampleBatch) -> AppResult<PeakVoltage> {
        let (lo, hi) = batch
            .min_max()
            .ok_or_else(|| DaqError::Analysis("generator batch is empty".to_string()))?;
        let mid = (lo + hi) / 2.0;
        let high: Vec<f64> = batch.readings().iter().copied().filter(|v| *v > mid).collect();

        // A flat signal has nothing above the midpoint.
        let high = if high.is_empty() {
            batch.readings().to_vec()
        } else {
            high
        };
        let value = mean(&high).unwrap_or(0.0);
        if value <= 0.0 {
            return Err(DaqError::Analysis(format!(
                "generator peak must be positive, got {:.6} V",
                value
            )));
        }
        Ok(PeakVoltage {
            value,
            uncertainty: std_dev(&high).unwrap_or(0.0),
        })
    }

    fn process_transient_curve(
        &self,
        batch: &SampleBatch,
        peak: &PeakVoltage,
        sample_spacing_s: f64,
        resistance_ohm: f64,
    ) -> AppResult<TransientFit> {
        if !(sample_spacing_s > 0.0 && sample_spacing_s.is_finite()) {
            return Err(DaqError::Analysis(format!(
                "sample spacing must be > 0, got {}",
                sample_spacing_s
            )));
        }
        if !(resistance_ohm > 0.0 && resistance_ohm.is_finite()) {
            return Err(DaqError::Analysis(format!(
                "resistance must be > 0, got {}",
                resistance_ohm
            )));
        }
        if peak.value <= 0.0 {
            return Err(DaqError::Analysis("peak voltage must be > 0".to_string()));
        }

        let readings = batch.readings();
        let mut fit = TransientFit {
            capacitance_estimates: Vec::new(),
            fit_slopes: Vec::new(),
            fit_intercepts: Vec::new(),
            correlation_values: Vec::new(),
            fit_errors: Vec::new(),
            valid_cycle_count: 0,
            sample_count: readings.len(),
            digitization_step: digitization_step(readings),
        };

        for cycle in charging_cycles(readings, peak.value) {
            let points: Vec<(f64, f64)> = cycle
                .iter()
                .enumerate()
                .filter(|(_, v)| **v > FIT_LOW * peak.value && **v < FIT_HIGH * peak.value)
                .map(|(i, v)| (i as f64 * sample_spacing_s, (1.0 - v / peak.value).ln()))
                .collect();
            if points.len() < MIN_FIT_POINTS {
                continue;
            }
            let Some(line) = linear_fit(&points) else {
                continue;
            };
            if line.slope >= 0.0 {
                continue;
            }

            fit.capacitance_estimates.push(-1.0 / (line.slope * resistance_ohm));
            fit.fit_slopes.push(line.slope);
            fit.fit_intercepts.push(line.intercept);
            fit.correlation_values.push(line.r);
            fit.fit_errors.push(line.slope_error);
            fit.valid_cycle_count += 1;
        }

        if fit.valid_cycle_count == 0 {
            return Err(DaqError::Analysis(format!(
                "no charging cycle with at least {} points between {:.0}% and {:.0}% of {:.6} V",
                MIN_FIT_POINTS,
                FIT_LOW * 100.0,
                FIT_HIGH * 100.0,
                peak.value
            )));
        }
        Ok(fit)
    }

    fn propagate_uncertainty(
        &self,
        slopes: &[f64],
        valid_cycles: usize,
        digitization_step: f64,
        peak: &PeakVoltage,
        nominal_capacitance_f: f64,
        resistance_ohm: f64,
    ) -> AppResult<Uncertainty> {
        if valid_cycles == 0 || slopes.is_empty() {
            return Err(DaqError::Analysis("no valid cycles to propagate".to_string()));
        }
        if nominal_capacitance_f <= 0.0 || resistance_ohm <= 0.0 || peak.value <= 0.0 {
            return Err(DaqError::Analysis(
                "capacitance, resistance and peak must be > 0".to_string(),
            ));
        }

        let estimates: Vec<f64> = slopes.iter().map(|m| -1.0 / (m * resistance_ohm)).collect();
        let c_mean = mean(&estimates).unwrap_or(nominal_capacitance_f);

        let type_a = match std_dev(&estimates) {
            Some(s) => s / (valid_cycles as f64).sqrt(),
            None => 0.0,
        };
        let offset = DMM_OFFSET_ERROR * self.range.volts() / peak.value;
        let relative_b = (DMM_GAIN_ERROR.powi(2)
            + offset.powi(2)
            + (digitization_step / peak.value).powi(2))
        .sqrt();
        let type_b = relative_b * c_mean.abs();

        let absolute = (type_a.powi(2) + type_b.powi(2)).sqrt();
        Ok(Uncertainty {
            absolute,
            relative: absolute / nominal_capacitance_f,
        })
    }
}

/// Everything reported for one analyzed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Generator plateau used as Vp
    pub peak_voltage: PeakVoltage,
    /// Mean capacitance estimate (F)
    pub capacitance_f: f64,
    /// Combined standard uncertainty (F)
    pub uncertainty_f: f64,
    /// `uncertainty_f` over the nominal capacitance
    pub relative_uncertainty: f64,
    /// Nominal capacitance entered for the run (F)
    pub nominal_capacitance_f: f64,
    /// Series resistance (Ω)
    pub resistance_ohm: f64,
    /// Cycles that contributed an estimate
    pub valid_cycles: usize,
    /// Readings in the capacitor batch
    pub sample_count: usize,
    /// When the analysis ran
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// Run the full chain on the two phase batches.
    pub fn compute(
        analyzer: &dyn Analyzer,
        generator: &SampleBatch,
        capacitor: &SampleBatch,
        nominal_capacitance_f: f64,
        resistance_ohm: f64,
        sample_spacing_s: f64,
    ) -> AppResult<Self> {
        let peak = analyzer.analyze_generator_signal(generator)?;
        let fit =
            analyzer.process_transient_curve(capacitor, &peak, sample_spacing_s, resistance_ohm)?;
        let uncertainty = analyzer.propagate_uncertainty(
            &fit.fit_slopes,
            fit.valid_cycle_count,
            fit.digitization_step,
            &peak,
            nominal_capacitance_f,
            resistance_ohm,
        )?;
        let capacitance_f = fit
            .mean_capacitance()
            .ok_or_else(|| DaqError::Analysis("no capacitance estimates".to_string()))?;

        Ok(Self {
            peak_voltage: peak,
            capacitance_f,
            uncertainty_f: uncertainty.absolute,
            relative_uncertainty: uncertainty.relative,
            nominal_capacitance_f,
            resistance_ohm,
            valid_cycles: fit.valid_cycle_count,
            sample_count: fit.sample_count,
            analyzed_at: Utc::now(),
        })
    }
}

/// Split `readings` into rising runs, each from a valley to the next crest.
///
/// A turning point only counts once the signal has moved back past it by the
/// hysteresis band. Noise on a settled plateau stays inside the band, and a
/// slow transient that never settles still turns at every excitation edge.
fn charging_cycles(readings: &[f64], peak: f64) -> Vec<&[f64]> {
    let band = TURN_HYSTERESIS * peak;
    let mut cycles = Vec::new();
    let mut rising = false;
    let mut valley = 0;
    // Running minimum while falling, running maximum while rising.
    let mut extreme = 0;

    for (i, &v) in readings.iter().enumerate().skip(1) {
        if rising {
            if v > readings[extreme] {
                extreme = i;
            } else if v < readings[extreme] - band {
                cycles.push(&readings[valley..=extreme]);
                rising = false;
                extreme = i;
            }
        } else if v < readings[extreme] {
            extreme = i;
        } else if v > readings[extreme] + band {
            valley = extreme;
            rising = true;
            extreme = i;
        }
    }
    if rising {
        cycles.push(&readings[valley..=extreme]);
    }
    cycles
}

/// Smallest non-zero spacing between distinct values.
fn digitization_step(readings: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = readings.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > 0.0)
        .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
        .unwrap_or(0.0)
}

struct LineFit {
    slope: f64,
    intercept: f64,
    r: f64,
    slope_error: f64,
}

fn linear_fit(points: &[(f64, f64)]) -> Option<LineFit> {
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let my = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mx).powi(2)).sum();
    let syy: f64 = points.iter().map(|p| (p.1 - my).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    let r = if syy > 0.0 { sxy / (sxx * syy).sqrt() } else { 0.0 };
    let residual: f64 = points
        .iter()
        .map(|p| (p.1 - (slope * p.0 + intercept)).powi(2))
        .sum();
    let slope_error = if points.len() > 2 {
        (residual / (n - 2.0) / sxx).sqrt()
    } else {
        0.0
    };

    Some(LineFit {
        slope,
        intercept,
        r,
        slope_error,
    })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation; needs at least two values.
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: f64 = 100e3;
    const C: f64 = 1e-6;
    const DT: f64 = 0.02;

    /// `cycles` charge/discharge pairs of `half` samples, each half restarting
    /// from a fully settled level.
    fn rc_curve(peak: f64, half: usize, cycles: usize) -> Vec<f64> {
        rc_curve_with_tau(peak, R * C, half, cycles)
    }

    fn rc_curve_with_tau(peak: f64, tau: f64, half: usize, cycles: usize) -> Vec<f64> {
        let mut out = Vec::new();
        for _ in 0..cycles {
            for k in 0..half {
                out.push(peak * (1.0 - (-(k as f64) * DT / tau).exp()));
            }
            for k in 0..half {
                out.push(peak * (-(k as f64) * DT / tau).exp());
            }
        }
        out
    }

    /// Continuous RC response to a 0..peak square wave starting discharged.
    fn rc_response(peak: f64, tau: f64, half: usize, cycles: usize) -> Vec<f64> {
        let decay = (-DT / tau).exp();
        let mut v = 0.0;
        let mut out = Vec::with_capacity(2 * half * cycles);
        for n in 0..2 * half * cycles {
            out.push(v);
            let target = if (n / half) % 2 == 0 { peak } else { 0.0 };
            v = target + (v - target) * decay;
        }
        out
    }

    fn square(peak: f64, half: usize, cycles: usize) -> Vec<f64> {
        (0..cycles)
            .flat_map(|_| {
                std::iter::repeat(peak)
                    .take(half)
                    .chain(std::iter::repeat(0.0).take(half))
            })
            .collect()
    }

    #[test]
    fn test_peak_voltage_of_square_wave() {
        let batch = SampleBatch::new(square(1.0, 25, 4));
        let peak = RcTransientAnalyzer::new().analyze_generator_signal(&batch).unwrap();
        assert!((peak.value - 1.0).abs() < 1e-12);
        assert!(peak.uncertainty < 1e-12);
    }

    #[test]
    fn test_empty_generator_batch_fails() {
        let batch = SampleBatch::new(Vec::new());
        assert!(matches!(
            RcTransientAnalyzer::new().analyze_generator_signal(&batch),
            Err(DaqError::Analysis(_))
        ));
    }

    #[test]
    fn test_fit_recovers_capacitance() {
        let analyzer = RcTransientAnalyzer::new();
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let batch = SampleBatch::new(rc_curve(1.0, 25, 3));

        let fit = analyzer.process_transient_curve(&batch, &peak, DT, R).unwrap();

        assert_eq!(fit.valid_cycle_count, 3);
        assert_eq!(fit.sample_count, 150);
        for c in &fit.capacitance_estimates {
            assert!((c - C).abs() / C < 1e-9, "estimate {}", c);
        }
        for r in &fit.correlation_values {
            assert!(*r < -0.999);
        }
        assert!(fit.digitization_step > 0.0);
    }

    #[test]
    fn test_slow_transients_split_on_excitation_edges() {
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        for c in [2.2e-6, 4.7e-6] {
            let tau = R * c;
            assert!(tau / DT >= 10.0);
            for readings in [rc_response(1.0, tau, 25, 5), rc_curve_with_tau(1.0, tau, 25, 5)] {
                let fit = RcTransientAnalyzer::new()
                    .process_transient_curve(&SampleBatch::new(readings), &peak, DT, R)
                    .unwrap();

                assert_eq!(fit.valid_cycle_count, 5, "C = {:e}", c);
                for estimate in &fit.capacitance_estimates {
                    assert!((estimate - c).abs() / c < 1e-9, "C = {:e}: estimate {:e}", c, estimate);
                }
            }
        }
    }

    #[test]
    fn test_plateau_noise_does_not_split_cycles() {
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let readings: Vec<f64> = rc_response(1.0, R * C, 25, 4)
            .iter()
            .enumerate()
            .map(|(k, v)| v + (k as f64 * 37.0).sin() * 2e-3)
            .collect();

        let fit = RcTransientAnalyzer::new()
            .process_transient_curve(&SampleBatch::new(readings), &peak, DT, R)
            .unwrap();

        assert_eq!(fit.valid_cycle_count, 4);
        let mean_c = fit.mean_capacitance().unwrap();
        assert!((mean_c - C).abs() / C < 0.05, "estimate {:e}", mean_c);
    }

    #[test]
    fn test_offset_term_scales_with_range() {
        let slope = -1.0 / (R * C);
        let peak = PeakVoltage {
            value: 0.5,
            uncertainty: 0.0,
        };
        let slopes = [slope, slope];

        let on_1v = RcTransientAnalyzer::with_range(DcRange::R1V)
            .propagate_uncertainty(&slopes, 2, 0.0, &peak, C, R)
            .unwrap();
        let on_100v = RcTransientAnalyzer::with_range(DcRange::R100V)
            .propagate_uncertainty(&slopes, 2, 0.0, &peak, C, R)
            .unwrap();

        // 5 ppm of 1 V is 10 ppm of a 0.5 V reading; of 100 V it is 1000 ppm.
        let expected_1v = C * (35e-6_f64.powi(2) + 10e-6_f64.powi(2)).sqrt();
        let expected_100v = C * (35e-6_f64.powi(2) + 1000e-6_f64.powi(2)).sqrt();
        assert!((on_1v.absolute - expected_1v).abs() / expected_1v < 1e-9);
        assert!((on_100v.absolute - expected_100v).abs() / expected_100v < 1e-9);
        assert_eq!(RcTransientAnalyzer::default().range(), DcRange::R10V);
    }

    #[test]
    fn test_cycle_with_too_few_points_is_skipped() {
        // tau = 0.1 s sampled at 0.1 s: only two points fall inside the band
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let batch = SampleBatch::new(vec![0.0, 0.632, 0.865, 0.95, 0.98, 0.0]);
        let result = RcTransientAnalyzer::new().process_transient_curve(&batch, &peak, 0.1, R);
        assert!(matches!(result, Err(DaqError::Analysis(_))));
    }

    #[test]
    fn test_invalid_timing_rejected() {
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let batch = SampleBatch::new(rc_curve(1.0, 25, 1));
        assert!(RcTransientAnalyzer::new()
            .process_transient_curve(&batch, &peak, 0.0, R)
            .is_err());
        assert!(RcTransientAnalyzer::new()
            .process_transient_curve(&batch, &peak, DT, -1.0)
            .is_err());
    }

    #[test]
    fn test_digitization_step() {
        assert!((digitization_step(&[0.3, 0.1, 0.1, 0.2, 0.4]) - 0.1).abs() < 1e-12);
        assert_eq!(digitization_step(&[1.0, 1.0]), 0.0);
        assert!((digitization_step(&[0.0, 1e-5, 3e-5]) - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn test_uncertainty_instrument_floor() {
        // Identical slopes: type A vanishes, only the instrument terms remain.
        let slope = -1.0 / (R * C);
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let u = RcTransientAnalyzer::new()
            .propagate_uncertainty(&[slope, slope, slope], 3, 1e-5, &peak, C, R)
            .unwrap();

        // 10 V range at a 1 V peak: offset term is 10 × 5 ppm of the reading.
        let expected =
            C * (DMM_GAIN_ERROR.powi(2) + (10.0 * DMM_OFFSET_ERROR).powi(2) + 1e-10).sqrt();
        assert!((u.absolute - expected).abs() / expected < 1e-9);
        assert!((u.relative - u.absolute / C).abs() < 1e-18);
    }

    #[test]
    fn test_uncertainty_grows_with_scatter() {
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        let tight = [-10.0, -10.0, -10.0];
        let loose = [-9.0, -10.0, -11.0];
        let a = RcTransientAnalyzer::new()
            .propagate_uncertainty(&tight, 3, 1e-5, &peak, C, R)
            .unwrap();
        let b = RcTransientAnalyzer::new()
            .propagate_uncertainty(&loose, 3, 1e-5, &peak, C, R)
            .unwrap();
        assert!(b.absolute > a.absolute);
    }

    #[test]
    fn test_no_cycles_is_error() {
        let peak = PeakVoltage {
            value: 1.0,
            uncertainty: 0.0,
        };
        assert!(RcTransientAnalyzer::new()
            .propagate_uncertainty(&[], 0, 1e-5, &peak, C, R)
            .is_err());
    }

    #[test]
    fn test_report_chain() {
        let generator = SampleBatch::new(square(1.0, 25, 3));
        let capacitor = SampleBatch::new(rc_curve(1.0, 25, 3));
        let report =
            AnalysisReport::compute(&RcTransientAnalyzer::new(), &generator, &capacitor, C, R, DT)
                .unwrap();
        assert!((report.capacitance_f - C).abs() / C < 1e-6);
        assert_eq!(report.valid_cycles, 3);
        assert!(report.relative_uncertainty > 0.0 && report.relative_uncertainty < 0.01);
    }
}
