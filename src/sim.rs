//! Simulated FRH bench
//!
//! In-process stand-in for the AFG1022 + Keithley 2110 pair, used by the test
//! suite and by `frh_daq run --simulate`. It provides:
//! - the SCPI subset both drivers use, with instrument state that can be
//!   inspected after the fact
//! - a command log per instrument for ordering assertions
//! - one-shot fault injection (transport failure, timeout, canned reply)
//! - external trigger edges, either driven by generator channel 2 through the
//!   trigger cable or injected by hand
//! - synthetic readings from an RC circuit driven by generator channel 1
//!
//! A query the instrument would not answer (unknown header, `FETCh?` with no
//! trigger) fails with [`DaqError::Timeout`] immediately instead of waiting
//! out the real timeout.

use crate::channel::{CommandChannel, DEFAULT_TIMEOUT};
use crate::error::{AppResult, DaqError};
use crate::experiment::InstrumentConnector;
use crate::instrument::{DcRange, OutputLoad, Waveform};
use async_trait::async_trait;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

pub use crate::instrument::InstrumentRole;

/// Resource string reported by the simulated generator.
pub const GENERATOR_RESOURCE: &str = "SIM::AFG1022::2234106::INSTR";
/// Resource string reported by the simulated multimeter.
pub const MULTIMETER_RESOURCE: &str = "SIM::KEITHLEY2110::8018964::INSTR";

const GENERATOR_IDN: &str = "TEKTRONIX,AFG1022,2234106,SCPI:99.0 FV:V1.2.3";
const MULTIMETER_IDN: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2110,8018964,02.03-03-20";

/// Overload reading returned by the DMM.
const OVERLOAD: f64 = 9.9e37;
/// Minimum high level accepted on the DMM trigger input (V).
const TTL_HIGH_MIN: f64 = 2.4;

/// State of one generator output
#[derive(Debug, Clone, PartialEq)]
pub struct SimChannelState {
    /// Programmed function
    pub waveform: Waveform,
    /// Frequency (Hz)
    pub frequency_hz: f64,
    /// Amplitude (Vpp)
    pub amplitude_vpp: f64,
    /// DC offset (V)
    pub offset_v: f64,
    /// Declared output load
    pub load: OutputLoad,
    /// Output relay closed
    pub output_enabled: bool,
    /// Pulse width (s)
    pub pulse_width_s: f64,
    /// Pulse edge time (s)
    pub pulse_transition_s: f64,
}

impl Default for SimChannelState {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            frequency_hz: 1000.0,
            amplitude_vpp: 1.0,
            offset_v: 0.0,
            load: OutputLoad::Matched,
            output_enabled: false,
            pulse_width_s: 500e-6,
            pulse_transition_s: 18e-9,
        }
    }
}

impl SimChannelState {
    /// Voltage at the terminals. Without a high-impedance declaration the
    /// generator halves the programmed levels.
    fn gain(&self) -> f64 {
        match self.load {
            OutputLoad::HighImpedance => 1.0,
            OutputLoad::Matched => 0.5,
        }
    }

    fn high_level(&self) -> f64 {
        (self.offset_v + self.amplitude_vpp / 2.0) * self.gain()
    }

    fn voltage_at(&self, t: f64) -> f64 {
        if !self.output_enabled {
            return 0.0;
        }
        let gain = self.gain();
        let half = self.amplitude_vpp / 2.0;
        let cycle = (t * self.frequency_hz).fract();
        let v = match self.waveform {
            Waveform::Square => {
                if cycle < 0.5 {
                    self.offset_v + half
                } else {
                    self.offset_v - half
                }
            }
            Waveform::Pulse => {
                if cycle * (1.0 / self.frequency_hz) < self.pulse_width_s {
                    self.offset_v + half
                } else {
                    self.offset_v - half
                }
            }
            Waveform::Sine => self.offset_v + half * (2.0 * PI * cycle).sin(),
            Waveform::Ramp => self.offset_v + self.amplitude_vpp * (cycle - 0.5),
            Waveform::Dc | Waveform::Noise | Waveform::User => self.offset_v,
        };
        v * gain
    }
}

/// Generator state as seen by the simulation
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorState {
    /// CH1 and CH2
    pub channels: [SimChannelState; 2],
    /// Frequency coupling between channels on
    pub frequency_coupled: bool,
    /// Amplitude coupling between channels on
    pub amplitude_coupled: bool,
    /// `SOUR:PHAS:ALIGN` count
    pub phase_alignments: u32,
    /// `*RST` count
    pub resets: u32,
    /// Error queue, oldest first
    pub errors: Vec<String>,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self {
            channels: [SimChannelState::default(), SimChannelState::default()],
            frequency_coupled: false,
            amplitude_coupled: false,
            phase_alignments: 0,
            resets: 0,
            errors: Vec::new(),
        }
    }
}

/// Multimeter state as seen by the simulation
#[derive(Debug, Clone, PartialEq)]
pub struct MultimeterState {
    /// `VOLT:DC:RANG:AUTO` on
    pub autorange: bool,
    /// Fixed DC range (V)
    pub range_v: f64,
    /// Integration time in power-line cycles
    pub nplc: f64,
    /// `IMM` or `EXT`
    pub trigger_source: String,
    /// Trigger on the rising edge
    pub slope_positive: bool,
    /// Delay after each trigger (s)
    pub trigger_delay_s: f64,
    /// Readings per trigger
    pub sample_count: u32,
    /// Triggers per `INIT`
    pub trigger_count: u32,
    /// Waiting for triggers after `INIT`
    pub armed: bool,
    /// Completed `FETCh?` count
    pub fetches: u32,
    /// `*RST` count
    pub resets: u32,
    /// Error queue, oldest first
    pub errors: Vec<String>,
}

impl Default for MultimeterState {
    fn default() -> Self {
        Self {
            autorange: true,
            range_v: 10.0,
            nplc: 1.0,
            trigger_source: "IMM".to_string(),
            slope_positive: true,
            trigger_delay_s: 0.0,
            sample_count: 1,
            trigger_count: 1,
            armed: false,
            fetches: 0,
            resets: 0,
            errors: Vec::new(),
        }
    }
}

/// Circuit node the DMM test lead is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadNode {
    /// Generator output, across the whole RC
    GeneratorOutput,
    /// Across the capacitor
    Capacitor,
}

/// How the test lead moves between fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadMode {
    /// Stays where it is
    Fixed,
    /// Swaps node after every completed fetch, like the two-phase protocol
    Alternate,
}

/// RC network on the bench
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcCircuit {
    /// Series resistance (Ω)
    pub resistance_ohm: f64,
    /// Capacitance (F)
    pub capacitance_f: f64,
}

impl Default for RcCircuit {
    fn default() -> Self {
        Self {
            resistance_ohm: 100e3,
            capacitance_f: 1e-6,
        }
    }
}

/// One-shot fault applied to the next matching command
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Link failure
    Transport,
    /// No reply within the timeout
    Timeout,
    /// Replace the reply of a query
    Reply(String),
}

struct InjectedFault {
    role: InstrumentRole,
    command: String,
    /// Matching commands to let through first
    skip: usize,
    fault: Fault,
}

struct BenchState {
    generator: GeneratorState,
    multimeter: MultimeterState,
    generator_log: Vec<String>,
    multimeter_log: Vec<String>,
    faults: Vec<InjectedFault>,
    pending_edges: usize,
    trigger_cable: bool,
    lead: LeadNode,
    lead_mode: LeadMode,
    circuit: RcCircuit,
    offline: Vec<InstrumentRole>,
    open_channels: usize,
    generator_closes: usize,
    multimeter_closes: usize,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            generator: GeneratorState::default(),
            multimeter: MultimeterState::default(),
            generator_log: Vec::new(),
            multimeter_log: Vec::new(),
            faults: Vec::new(),
            pending_edges: 0,
            trigger_cable: true,
            lead: LeadNode::GeneratorOutput,
            lead_mode: LeadMode::Alternate,
            circuit: RcCircuit::default(),
            offline: Vec::new(),
            open_channels: 0,
            generator_closes: 0,
            multimeter_closes: 0,
        }
    }
}

/// Shared handle to the simulated bench
#[derive(Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    /// Bench with default instruments and a 100 kΩ / 1 µF circuit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bench with a specific RC circuit.
    pub fn with_circuit(circuit: RcCircuit) -> Self {
        let bench = Self::new();
        bench.lock().circuit = circuit;
        bench
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a channel to one of the simulated instruments.
    pub fn channel(&self, role: InstrumentRole) -> SimulatedChannel {
        self.lock().open_channels += 1;
        SimulatedChannel {
            role,
            resource: match role {
                InstrumentRole::Generator => GENERATOR_RESOURCE.to_string(),
                InstrumentRole::Multimeter => MULTIMETER_RESOURCE.to_string(),
            },
            timeout: DEFAULT_TIMEOUT,
            bench: self.clone(),
            closed: false,
        }
    }

    /// Every command sent to `role`, in order.
    pub fn command_log(&self, role: InstrumentRole) -> Vec<String> {
        let state = self.lock();
        match role {
            InstrumentRole::Generator => state.generator_log.clone(),
            InstrumentRole::Multimeter => state.multimeter_log.clone(),
        }
    }

    /// Forget the command logs.
    pub fn clear_logs(&self) {
        let mut state = self.lock();
        state.generator_log.clear();
        state.multimeter_log.clear();
    }

    /// Snapshot of the generator state.
    pub fn generator_state(&self) -> GeneratorState {
        self.lock().generator.clone()
    }

    /// Snapshot of the multimeter state.
    pub fn multimeter_state(&self) -> MultimeterState {
        self.lock().multimeter.clone()
    }

    /// Queue `n` manual trigger edges on the DMM trigger input.
    pub fn inject_edges(&self, n: usize) {
        self.lock().pending_edges += n;
    }

    /// Connect or disconnect the generator channel 2 → DMM trigger cable.
    pub fn set_trigger_cable(&self, connected: bool) {
        self.lock().trigger_cable = connected;
    }

    /// Move the test lead.
    pub fn set_lead(&self, node: LeadNode) {
        self.lock().lead = node;
    }

    /// Current lead position.
    pub fn lead(&self) -> LeadNode {
        self.lock().lead
    }

    /// Set how the test lead moves between fetches.
    pub fn set_lead_mode(&self, mode: LeadMode) {
        self.lock().lead_mode = mode;
    }

    /// Apply `fault` to the next command on `role` equal to `command`.
    pub fn inject_fault(&self, role: InstrumentRole, command: &str, fault: Fault) {
        self.inject_fault_after(role, command, 0, fault);
    }

    /// Let `skip` matching commands through, then apply `fault` to the next.
    pub fn inject_fault_after(
        &self,
        role: InstrumentRole,
        command: &str,
        skip: usize,
        fault: Fault,
    ) {
        self.lock().faults.push(InjectedFault {
            role,
            command: command.to_string(),
            skip,
            fault,
        });
    }

    /// Shorthand for a canned reply to the next `command` query.
    pub fn inject_reply(&self, role: InstrumentRole, command: &str, reply: &str) {
        self.inject_fault(role, command, Fault::Reply(reply.to_string()));
    }

    /// Make `role` unreachable for new connections.
    pub fn set_offline(&self, role: InstrumentRole, offline: bool) {
        let mut state = self.lock();
        state.offline.retain(|r| *r != role);
        if offline {
            state.offline.push(role);
        }
    }

    /// Channels opened and not yet closed.
    pub fn open_channels(&self) -> usize {
        self.lock().open_channels
    }

    /// Channels to `role` that have been closed.
    pub fn closes(&self, role: InstrumentRole) -> usize {
        let state = self.lock();
        match role {
            InstrumentRole::Generator => state.generator_closes,
            InstrumentRole::Multimeter => state.multimeter_closes,
        }
    }

    fn handle(&self, role: InstrumentRole, command: &str, is_query: bool) -> Handled {
        let mut state = self.lock();
        match role {
            InstrumentRole::Generator => state.generator_log.push(command.to_string()),
            InstrumentRole::Multimeter => state.multimeter_log.push(command.to_string()),
        }

        if let Some(pos) = state
            .faults
            .iter()
            .position(|f| f.role == role && f.command == command)
        {
            if state.faults[pos].skip > 0 {
                state.faults[pos].skip -= 1;
            } else {
                let injected = state.faults.remove(pos);
                return match injected.fault {
                    Fault::Transport => Handled::LinkDown,
                    Fault::Timeout => Handled::NoReply,
                    Fault::Reply(reply) if is_query => Handled::Reply(reply),
                    Fault::Reply(_) => Handled::Done,
                };
            }
        }

        let (header, arg) = split_command(command);
        let reply = match role {
            InstrumentRole::Generator => state.generator_command(&header, arg),
            InstrumentRole::Multimeter => state.multimeter_command(&header, arg),
        };
        match reply {
            Outcome::Ack => Handled::Done,
            Outcome::Reply(text) if is_query => Handled::Reply(text),
            Outcome::Reply(_) => Handled::Done,
            Outcome::Silent => {
                if is_query {
                    Handled::NoReply
                } else {
                    Handled::Done
                }
            }
        }
    }
}

#[async_trait]
impl InstrumentConnector for SimulatedBench {
    async fn open(&self, role: InstrumentRole) -> AppResult<Box<dyn CommandChannel>> {
        if self.lock().offline.contains(&role) {
            return Err(DaqError::Transport {
                resource: match role {
                    InstrumentRole::Generator => GENERATOR_RESOURCE.to_string(),
                    InstrumentRole::Multimeter => MULTIMETER_RESOURCE.to_string(),
                },
                command: "open".to_string(),
                reason: "instrument not responding".to_string(),
            });
        }
        Ok(Box::new(self.channel(role)))
    }
}

enum Handled {
    Done,
    Reply(String),
    NoReply,
    LinkDown,
}

enum Outcome {
    Ack,
    Reply(String),
    Silent,
}

/// Split `"SOUR1:FREQ 1000"` into (`"SOUR1:FREQ"`, `Some("1000")`).
fn split_command(command: &str) -> (String, Option<&str>) {
    let trimmed = command.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((header, arg)) => (header.to_ascii_uppercase(), Some(arg.trim())),
        None => (trimmed.to_ascii_uppercase(), None),
    }
}

/// Split `"SOUR2:VOLT:OFFS"` on `prefix` into (2, `":VOLT:OFFS"`).
fn split_channel<'a>(header: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = header.strip_prefix(prefix)?;
    let digit = rest.chars().next()?.to_digit(10)?;
    match digit {
        1 | 2 => Some((digit as usize - 1, &rest[1..])),
        _ => None,
    }
}

fn parse_on_off(arg: Option<&str>) -> Option<bool> {
    match arg?.to_ascii_uppercase().as_str() {
        "ON" | "1" => Some(true),
        "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn parse_number(arg: Option<&str>) -> Option<f64> {
    arg?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn sci(value: f64) -> String {
    format!("{:E}", value)
}

impl BenchState {
    fn generator_command(&mut self, header: &str, arg: Option<&str>) -> Outcome {
        let afg = &mut self.generator;
        match header {
            "*IDN?" => return Outcome::Reply(GENERATOR_IDN.to_string()),
            "*RST" => {
                let resets = afg.resets + 1;
                let alignments = afg.phase_alignments;
                *afg = GeneratorState::default();
                afg.resets = resets;
                afg.phase_alignments = alignments;
                return Outcome::Ack;
            }
            "*CLS" => {
                afg.errors.clear();
                return Outcome::Ack;
            }
            "SYST:ERR?" => {
                return Outcome::Reply(pop_error(&mut afg.errors));
            }
            "SOUR:COUP:FREQ" => {
                if let Some(on) = parse_on_off(arg) {
                    afg.frequency_coupled = on;
                    return Outcome::Ack;
                }
            }
            "SOUR:COUP:AMPL" => {
                if let Some(on) = parse_on_off(arg) {
                    afg.amplitude_coupled = on;
                    return Outcome::Ack;
                }
            }
            "SOUR:COUP:PHAS" => {
                if parse_number(arg).is_some() {
                    return Outcome::Ack;
                }
            }
            "SOUR:PHAS:ALIGN" => {
                afg.phase_alignments += 1;
                return Outcome::Ack;
            }
            _ => {}
        }

        if let Some((idx, rest)) = split_channel(header, "SOUR") {
            let ch = &mut afg.channels[idx];
            match rest {
                ":FUNC" => {
                    if let Some(w) = arg.and_then(Waveform::from_reply) {
                        ch.waveform = w;
                        return Outcome::Ack;
                    }
                }
                ":FUNC?" => return Outcome::Reply(ch.waveform.mnemonic().to_string()),
                ":FREQ" => {
                    if let Some(f) = parse_number(arg).filter(|f| *f > 0.0) {
                        ch.frequency_hz = f;
                        return Outcome::Ack;
                    }
                }
                ":FREQ?" => return Outcome::Reply(sci(ch.frequency_hz)),
                ":VOLT" => {
                    if let Some(v) = parse_number(arg).filter(|v| *v >= 0.0) {
                        ch.amplitude_vpp = v;
                        return Outcome::Ack;
                    }
                }
                ":VOLT?" => return Outcome::Reply(sci(ch.amplitude_vpp)),
                ":VOLT:OFFS" => {
                    if let Some(v) = parse_number(arg) {
                        ch.offset_v = v;
                        return Outcome::Ack;
                    }
                }
                ":VOLT:OFFS?" => return Outcome::Reply(sci(ch.offset_v)),
                ":PULS:WIDT" => {
                    if let Some(v) = parse_number(arg).filter(|v| *v > 0.0) {
                        ch.pulse_width_s = v;
                        return Outcome::Ack;
                    }
                }
                ":PULS:TRAN" => {
                    if let Some(v) = parse_number(arg).filter(|v| *v > 0.0) {
                        ch.pulse_transition_s = v;
                        return Outcome::Ack;
                    }
                }
                _ => {}
            }
        } else if let Some((idx, rest)) = split_channel(header, "OUTP") {
            let ch = &mut afg.channels[idx];
            match rest {
                "" => {
                    if let Some(on) = parse_on_off(arg) {
                        ch.output_enabled = on;
                        return Outcome::Ack;
                    }
                }
                "?" => {
                    return Outcome::Reply(if ch.output_enabled { "1" } else { "0" }.to_string())
                }
                ":LOAD" => {
                    let load = arg.and_then(|a| {
                        if a.eq_ignore_ascii_case("INF") {
                            Some(OutputLoad::HighImpedance)
                        } else {
                            OutputLoad::from_reply(a)
                        }
                    });
                    if let Some(load) = load {
                        ch.load = load;
                        return Outcome::Ack;
                    }
                }
                ":LOAD?" => {
                    return Outcome::Reply(
                        match ch.load {
                            OutputLoad::HighImpedance => "INF",
                            OutputLoad::Matched => "50",
                        }
                        .to_string(),
                    )
                }
                _ => {}
            }
        }

        warn!("Simulated generator rejected '{}'", header);
        afg.errors.push(format!("-113,\"Undefined header or bad parameter: {}\"", header));
        Outcome::Silent
    }

    fn multimeter_command(&mut self, header: &str, arg: Option<&str>) -> Outcome {
        match header {
            "*IDN?" => return Outcome::Reply(MULTIMETER_IDN.to_string()),
            "*RST" => {
                let resets = self.multimeter.resets + 1;
                let fetches = self.multimeter.fetches;
                self.multimeter = MultimeterState::default();
                self.multimeter.resets = resets;
                self.multimeter.fetches = fetches;
                return Outcome::Ack;
            }
            "*CLS" => {
                self.multimeter.errors.clear();
                return Outcome::Ack;
            }
            "SYST:ERR?" => return Outcome::Reply(pop_error(&mut self.multimeter.errors)),
            "ABOR" => {
                self.multimeter.armed = false;
                return Outcome::Ack;
            }
            "INIT" => {
                self.multimeter.armed = true;
                return Outcome::Ack;
            }
            "FETCH?" => return self.fetch(),
            _ => {}
        }

        let dmm = &mut self.multimeter;
        match header {
            "VOLT:DC:RANG:AUTO" => {
                if let Some(on) = parse_on_off(arg) {
                    dmm.autorange = on;
                    return Outcome::Ack;
                }
            }
            "VOLT:DC:RANG:AUTO?" => {
                return Outcome::Reply(if dmm.autorange { "1" } else { "0" }.to_string())
            }
            "VOLT:DC:RANG" => {
                if let Some(range) = parse_number(arg).and_then(|v| DcRange::try_from(v).ok()) {
                    dmm.range_v = range.volts();
                    dmm.autorange = false;
                    return Outcome::Ack;
                }
            }
            "VOLT:DC:RANG?" => return Outcome::Reply(sci(dmm.range_v)),
            "VOLT:DC:NPLC" => {
                if let Some(n) = parse_number(arg).filter(|n| *n > 0.0) {
                    dmm.nplc = n;
                    return Outcome::Ack;
                }
            }
            "VOLT:DC:NPLC?" => return Outcome::Reply(sci(dmm.nplc)),
            "TRIG:SOUR" => {
                if let Some(source) = arg.map(str::to_ascii_uppercase) {
                    if ["EXT", "IMM", "BUS"].contains(&source.as_str()) {
                        dmm.trigger_source = source;
                        return Outcome::Ack;
                    }
                }
            }
            "TRIG:SOUR?" => return Outcome::Reply(dmm.trigger_source.clone()),
            "TRIG:SLOP" => match arg.map(str::to_ascii_uppercase).as_deref() {
                Some("POS") => {
                    dmm.slope_positive = true;
                    return Outcome::Ack;
                }
                Some("NEG") => {
                    dmm.slope_positive = false;
                    return Outcome::Ack;
                }
                _ => {}
            },
            "TRIG:DEL" => {
                if let Some(d) = parse_number(arg).filter(|d| *d >= 0.0) {
                    dmm.trigger_delay_s = d;
                    return Outcome::Ack;
                }
            }
            "SAMP:COUN" => {
                if let Some(n) = arg.and_then(|a| a.parse::<u32>().ok()).filter(|n| *n >= 1) {
                    dmm.sample_count = n;
                    return Outcome::Ack;
                }
            }
            "SAMP:COUN?" => return Outcome::Reply(dmm.sample_count.to_string()),
            "TRIG:COUN" => {
                if let Some(n) = arg.and_then(|a| a.parse::<u32>().ok()).filter(|n| *n >= 1) {
                    dmm.trigger_count = n;
                    return Outcome::Ack;
                }
            }
            "TRIG:COUN?" => return Outcome::Reply(dmm.trigger_count.to_string()),
            _ => {}
        }

        warn!("Simulated multimeter rejected '{}'", header);
        dmm.errors.push(format!("-113,\"Undefined header or bad parameter: {}\"", header));
        Outcome::Silent
    }

    /// Edges the generator currently drives into the DMM trigger input.
    fn generator_drives_trigger(&self) -> bool {
        let ch2 = &self.generator.channels[1];
        self.trigger_cable
            && ch2.output_enabled
            && matches!(ch2.waveform, Waveform::Pulse | Waveform::Square)
            && ch2.high_level() >= TTL_HIGH_MIN
    }

    fn fetch(&mut self) -> Outcome {
        if !self.multimeter.armed {
            return Outcome::Silent;
        }

        if self.multimeter.trigger_source == "EXT" {
            let needed = self.multimeter.trigger_count as usize;
            if !self.generator_drives_trigger() {
                if self.pending_edges < needed {
                    debug!(
                        "Simulated DMM: {} edge(s) pending, {} needed",
                        self.pending_edges, needed
                    );
                    return Outcome::Silent;
                }
                self.pending_edges -= needed;
            }
        }

        let total = self.multimeter.sample_count as usize * self.multimeter.trigger_count as usize;
        let readings = self.synthesize(total);
        self.multimeter.armed = false;
        self.multimeter.fetches += 1;
        if self.lead_mode == LeadMode::Alternate {
            self.lead = match self.lead {
                LeadNode::GeneratorOutput => LeadNode::Capacitor,
                LeadNode::Capacitor => LeadNode::GeneratorOutput,
            };
        }

        Outcome::Reply(
            readings
                .iter()
                .map(|v| format!("{:+.8E}", v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Seconds between consecutive readings for the current NPLC.
    fn reading_interval(&self) -> f64 {
        let nplc = self.multimeter.nplc;
        if nplc <= 0.1 {
            0.02
        } else {
            nplc / 50.0 + 0.02
        }
    }

    fn synthesize(&self, count: usize) -> Vec<f64> {
        let dt = self.reading_interval();
        let ch1 = &self.generator.channels[0];
        let tau = self.circuit.resistance_ohm * self.circuit.capacitance_f;
        let decay = (-dt / tau).exp();
        let range = self.multimeter.range_v;
        let step = range * 1e-6;
        let seed = f64::from(self.multimeter.fetches) * 7.0;

        let mut vc = ch1.voltage_at(0.0).min(ch1.voltage_at(0.75 / ch1.frequency_hz));
        (0..count)
            .map(|k| {
                let t = k as f64 * dt;
                let vin = ch1.voltage_at(t);
                let clean = match self.lead {
                    LeadNode::GeneratorOutput => vin,
                    LeadNode::Capacitor => vc,
                };
                vc = vin + (vc - vin) * decay;

                let noise = ((k as f64 + seed) * 37.0).sin() * 2e-4;
                let v = ((clean + noise) / step).round() * step;
                if v.abs() > range * 1.2 {
                    OVERLOAD
                } else {
                    v
                }
            })
            .collect()
    }
}

fn pop_error(errors: &mut Vec<String>) -> String {
    if errors.is_empty() {
        "0,\"No error\"".to_string()
    } else {
        errors.remove(0)
    }
}

/// [`CommandChannel`] into the simulated bench
pub struct SimulatedChannel {
    role: InstrumentRole,
    resource: String,
    timeout: Duration,
    bench: SimulatedBench,
    closed: bool,
}

impl SimulatedChannel {
    /// Override the reported timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn link_down(&self, command: &str, reason: &str) -> DaqError {
        DaqError::Transport {
            resource: self.resource.clone(),
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl CommandChannel for SimulatedChannel {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        if self.closed {
            return Err(self.link_down(command, "channel closed"));
        }
        match self.bench.handle(self.role, command, false) {
            Handled::LinkDown => Err(self.link_down(command, "injected link failure")),
            Handled::NoReply => Err(DaqError::Timeout {
                resource: self.resource.clone(),
                command: command.to_string(),
                timeout: self.timeout,
            }),
            Handled::Done | Handled::Reply(_) => Ok(()),
        }
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        if self.closed {
            return Err(self.link_down(command, "channel closed"));
        }
        match self.bench.handle(self.role, command, true) {
            Handled::Reply(reply) => Ok(reply),
            Handled::LinkDown => Err(self.link_down(command, "injected link failure")),
            Handled::NoReply | Handled::Done => Err(DaqError::Timeout {
                resource: self.resource.clone(),
                command: command.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.bench.lock();
            state.open_channels = state.open_channels.saturating_sub(1);
            match self.role {
                InstrumentRole::Generator => state.generator_closes += 1,
                InstrumentRole::Multimeter => state.multimeter_closes += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("SOUR1:FREQ 1000"), ("SOUR1:FREQ".to_string(), Some("1000")));
        assert_eq!(split_command("fetch?"), ("FETCH?".to_string(), None));
    }

    #[test]
    fn test_split_channel() {
        assert_eq!(split_channel("SOUR2:VOLT:OFFS", "SOUR"), Some((1, ":VOLT:OFFS")));
        assert_eq!(split_channel("OUTP1", "OUTP"), Some((0, "")));
        assert_eq!(split_channel("SOUR3:FREQ", "SOUR"), None);
        assert_eq!(split_channel("SOUR:PHAS:ALIGN", "SOUR"), None);
    }

    #[tokio::test]
    async fn test_identity_and_unknown_query() {
        let bench = SimulatedBench::new();
        let mut ch = bench.channel(InstrumentRole::Multimeter);

        assert!(ch.query("*IDN?").await.unwrap().contains("2110"));
        let result = ch.query("MEAS:CURR?").await;
        assert!(matches!(result, Err(DaqError::Timeout { .. })));
        assert!(ch.query("SYST:ERR?").await.unwrap().starts_with("-113"));
    }

    #[tokio::test]
    async fn test_injected_transport_fault_is_one_shot() {
        let bench = SimulatedBench::new();
        let mut ch = bench.channel(InstrumentRole::Generator);
        bench.inject_fault(InstrumentRole::Generator, "*RST", Fault::Transport);

        assert!(ch.send("*RST").await.unwrap_err().is_transport());
        assert!(ch.send("*RST").await.is_ok());
    }

    #[tokio::test]
    async fn test_delayed_fault_skips_earlier_matches() {
        let bench = SimulatedBench::new();
        let mut ch = bench.channel(InstrumentRole::Multimeter);
        bench.inject_fault_after(InstrumentRole::Multimeter, "*IDN?", 1, Fault::Timeout);

        assert!(ch.query("*IDN?").await.is_ok());
        assert!(matches!(ch.query("*IDN?").await, Err(DaqError::Timeout { .. })));
        assert!(ch.query("*IDN?").await.is_ok());

        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert_eq!(bench.closes(InstrumentRole::Multimeter), 1);
        assert_eq!(bench.closes(InstrumentRole::Generator), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_commands() {
        let bench = SimulatedBench::new();
        let mut ch = bench.channel(InstrumentRole::Generator);
        assert_eq!(bench.open_channels(), 1);

        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert_eq!(bench.open_channels(), 0);
        assert!(ch.send("*CLS").await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_generator_drives_trigger_only_when_enabled() {
        let bench = SimulatedBench::new();
        let mut afg = bench.channel(InstrumentRole::Generator);
        let mut dmm = bench.channel(InstrumentRole::Multimeter);

        for cmd in ["OUTP2:LOAD INF", "SOUR2:FUNC PULS", "SOUR2:VOLT 5", "SOUR2:VOLT:OFFS 2.5"] {
            afg.send(cmd).await.unwrap();
        }
        for cmd in ["TRIG:SOUR EXT", "SAMP:COUN 4", "INIT"] {
            dmm.send(cmd).await.unwrap();
        }
        assert!(dmm.query("FETCh?").await.is_err());

        afg.send("OUTP2 ON").await.unwrap();
        dmm.send("INIT").await.unwrap();
        let reply = dmm.query("FETCh?").await.unwrap();
        assert_eq!(reply.split(',').count(), 4);
    }

    #[tokio::test]
    async fn test_unplugged_trigger_cable_blocks_fetch() {
        let bench = SimulatedBench::new();
        let mut afg = bench.channel(InstrumentRole::Generator);
        let mut dmm = bench.channel(InstrumentRole::Multimeter);
        for cmd in ["OUTP2:LOAD INF", "SOUR2:FUNC PULS", "SOUR2:VOLT 5", "SOUR2:VOLT:OFFS 2.5", "OUTP2 ON"] {
            afg.send(cmd).await.unwrap();
        }
        bench.set_trigger_cable(false);

        dmm.send("TRIG:SOUR EXT").await.unwrap();
        dmm.send("INIT").await.unwrap();
        assert!(matches!(
            dmm.query("FETCh?").await,
            Err(DaqError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_capacitor_charges_toward_high_level() {
        let bench = SimulatedBench::new();
        bench.set_lead_mode(LeadMode::Fixed);
        bench.set_lead(LeadNode::Capacitor);
        let mut afg = bench.channel(InstrumentRole::Generator);
        let mut dmm = bench.channel(InstrumentRole::Multimeter);
        for cmd in [
            "OUTP1:LOAD INF",
            "SOUR1:FUNC SQU",
            "SOUR1:FREQ 1",
            "SOUR1:VOLT 1",
            "SOUR1:VOLT:OFFS 0.5",
            "OUTP1 ON",
        ] {
            afg.send(cmd).await.unwrap();
        }
        for cmd in ["VOLT:DC:NPLC 0.02", "SAMP:COUN 25", "INIT"] {
            dmm.send(cmd).await.unwrap();
        }

        let reply = dmm.query("FETCh?").await.unwrap();
        let values: Vec<f64> = reply.split(',').map(|v| v.parse().unwrap()).collect();
        assert!(values[0].abs() < 0.01);
        assert!(values[24] > 0.95);
        assert!(values.windows(2).take(20).all(|w| w[1] >= w[0] - 0.001));
    }
}
