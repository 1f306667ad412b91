//! Deterministic simulated backends.
//!
//! `SimulatedBus` answers like the board's four I2C parts: an ADS1115 ADC,
//! an SHT31 humidity/temperature sensor, a VL6180X time-of-flight sensor and
//! an AT24C256 EEPROM. Random readings come from a seeded `StdRng`, so two
//! buses built with the same seed produce the same measurement stream.
//! Tests reach into the device models through a cloneable `SimulatedHandle`.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{DigitalIo, Direction, Edge, EdgeEvent, PullMode, RegisterBus, EDGE_CHANNEL_CAPACITY};
use crate::config::DeviceAddresses;
use crate::errors::{BusError, BusResult};
use crate::hal::{adc, eeprom, moisture, tof};
use crate::sensors::sht31::crc8;

/// Plausible photodiode readings in sensor units
const PD_UNITS_RANGE: (f32, f32) = (100.0, 150.0);
/// Plausible thickness readings in sensor units
const THICKNESS_UNITS_RANGE: (f32, f32) = (45.0, 65.0);
const TEMPERATURE_RANGE_C: (f32, f32) = (22.0, 30.0);
const HUMIDITY_RANGE_PCT: (f32, f32) = (37.5, 75.0);
const TOF_RANGE_MM: (u8, u8) = (15, 30);

#[derive(Debug, Default)]
struct AdcModel {
    config: u16,
    conversion: i16,
    scripted: [VecDeque<i16>; 4],
}

#[derive(Debug, Default)]
struct MoistureModel {
    pending: Option<[u8; moisture::RESPONSE_LEN]>,
    climate: Option<(f32, f32)>,
    corrupt_crc: bool,
}

#[derive(Debug, Default)]
struct TofModel {
    pointer: u16,
    registers: HashMap<u16, u8>,
    fixed_range: Option<u8>,
    range: u8,
    status: u8,
    fresh_out_of_reset: u8,
    short_read: bool,
}

#[derive(Debug)]
struct EepromModel {
    memory: Vec<u8>,
    pointer: usize,
    page_writes: usize,
    failing_writes: usize,
    short_read: Option<usize>,
}

impl Default for EepromModel {
    fn default() -> Self {
        Self {
            memory: vec![0xFF; eeprom::SIZE],
            pointer: 0,
            page_writes: 0,
            failing_writes: 0,
            short_read: None,
        }
    }
}

struct SimState {
    rng: StdRng,
    addresses: DeviceAddresses,
    absent: HashSet<u8>,
    adc: AdcModel,
    moisture: MoistureModel,
    tof: TofModel,
    eeprom: EepromModel,
}

impl SimState {
    fn uniform(&mut self, (lo, hi): (f32, f32)) -> f32 {
        self.rng.gen_range(lo..=hi)
    }

    fn check(&self, address: u8) -> BusResult<()> {
        let known = [
            self.addresses.adc,
            self.addresses.moisture,
            self.addresses.elasticity,
            self.addresses.eeprom,
        ];
        if self.absent.contains(&address) || !known.contains(&address) {
            return Err(BusError::NoDevice { address });
        }
        Ok(())
    }

    fn units_to_code(units: f32) -> i16 {
        let volts = (units - 100.0) / 30.0;
        (volts * adc::FULL_SCALE / adc::VREF).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }

    fn start_conversion(&mut self, config: u16) {
        let mux = (config & adc::CFG_MUX_MASK) >> 12;
        let channel = mux.saturating_sub(4) as usize;
        let code = match self.adc.scripted.get_mut(channel).and_then(|q| q.pop_front()) {
            Some(code) => code,
            None => {
                let range = if channel == 2 { THICKNESS_UNITS_RANGE } else { PD_UNITS_RANGE };
                let units = self.uniform(range);
                Self::units_to_code(units)
            }
        };
        trace!("[sim] ADC channel {} -> code {}", channel, code);
        self.adc.conversion = code;
    }

    fn run_moisture_command(&mut self, command: u16) {
        match command {
            moisture::CMD_MEASURE_HIGH_REP => {
                let (temp_c, humidity) = match self.moisture.climate {
                    Some(climate) => climate,
                    None => (self.uniform(TEMPERATURE_RANGE_C), self.uniform(HUMIDITY_RANGE_PCT)),
                };
                let t_code = (((temp_c + 45.0) / 175.0) * 65535.0).round().clamp(0.0, 65535.0) as u16;
                let h_code = ((humidity / 100.0) * 65535.0).round().clamp(0.0, 65535.0) as u16;
                let t = t_code.to_be_bytes();
                let h = h_code.to_be_bytes();
                let mut t_crc = crc8(&t);
                if self.moisture.corrupt_crc {
                    t_crc ^= 0xFF;
                }
                self.moisture.pending = Some([t[0], t[1], t_crc, h[0], h[1], crc8(&h)]);
            }
            moisture::CMD_SOFT_RESET => self.moisture.pending = None,
            other => trace!("[sim] SHT31 ignoring command {:#06x}", other),
        }
    }

    fn tof_write(&mut self, index: u16, value: u8) {
        match index {
            tof::REG_SYSRANGE_START if value & 0x01 != 0 => {
                let (lo, hi) = TOF_RANGE_MM;
                self.tof.range = match self.tof.fixed_range {
                    Some(range) => range,
                    None => self.rng.gen_range(lo..=hi),
                };
                self.tof.status = tof::STATUS_RANGE_READY;
            }
            tof::REG_SYSTEM_INTERRUPT_CLEAR => self.tof.status = 0,
            tof::REG_FRESH_OUT_OF_RESET => self.tof.fresh_out_of_reset = value,
            _ => {
                self.tof.registers.insert(index, value);
            }
        }
    }

    fn tof_read(&self, index: u16) -> u8 {
        match index {
            tof::REG_MODEL_ID => tof::MODEL_ID,
            tof::REG_FRESH_OUT_OF_RESET => self.tof.fresh_out_of_reset,
            tof::REG_RESULT_INTERRUPT_STATUS => self.tof.status,
            tof::REG_RESULT_RANGE_VAL => self.tof.range,
            other => self.tof.registers.get(&other).copied().unwrap_or(0),
        }
    }

    fn eeprom_write(&mut self, address: u8, data: &[u8]) -> BusResult<()> {
        let [hi, lo, payload @ ..] = data else {
            return Err(BusError::Nack { address, reason: "missing memory address".to_string() });
        };
        let start = (u16::from_be_bytes([*hi, *lo]) as usize) % eeprom::SIZE;
        self.eeprom.pointer = start;
        if payload.is_empty() {
            return Ok(());
        }

        let fail = self.eeprom.failing_writes > 0;
        if fail {
            self.eeprom.failing_writes -= 1;
        }
        // a failing write cycle still tears the first half of the page
        let written = if fail { payload.len() / 2 } else { payload.len() };
        let page_base = start - start % eeprom::PAGE_SIZE;
        for (i, byte) in payload[..written].iter().enumerate() {
            let offset = (start % eeprom::PAGE_SIZE + i) % eeprom::PAGE_SIZE;
            self.eeprom.memory[page_base + offset] = *byte;
        }
        self.eeprom.page_writes += 1;

        if fail {
            return Err(BusError::Nack { address, reason: "write cycle failed".to_string() });
        }
        Ok(())
    }

    fn eeprom_read(&mut self, buf: &mut [u8]) -> usize {
        let len = self.eeprom.short_read.map_or(buf.len(), |n| n.min(buf.len()));
        for slot in buf.iter_mut().take(len) {
            *slot = self.eeprom.memory[self.eeprom.pointer];
            self.eeprom.pointer = (self.eeprom.pointer + 1) % eeprom::SIZE;
        }
        len
    }
}

fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated register bus
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    initialized: bool,
}

impl SimulatedBus {
    /// `seed = None` draws a seed from the OS.
    pub fn new(seed: Option<u64>, addresses: DeviceAddresses) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SimState {
            rng,
            addresses,
            absent: HashSet::new(),
            adc: AdcModel::default(),
            moisture: MoistureModel::default(),
            tof: TofModel::default(),
            eeprom: EepromModel::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            initialized: false,
        }
    }

    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle { state: self.state.clone() }
    }

    fn state(&self) -> BusResult<MutexGuard<'_, SimState>> {
        if !self.initialized {
            return Err(BusError::NotInitialized { bus: "simulated".to_string() });
        }
        Ok(lock_state(&self.state))
    }
}

#[async_trait]
impl RegisterBus for SimulatedBus {
    async fn initialize(&mut self, bus_id: u8) -> BusResult<()> {
        debug!("[sim] register bus {} initialized", bus_id);
        self.initialized = true;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.initialized = false;
    }

    async fn write_register(&mut self, address: u8, reg: u8, value: u8) -> BusResult<()> {
        let mut state = self.state()?;
        state.check(address)?;
        if address == state.addresses.moisture {
            state.run_moisture_command(u16::from_be_bytes([reg, value]));
            Ok(())
        } else if address == state.addresses.eeprom {
            state.eeprom_write(address, &[reg, value])
        } else {
            Err(BusError::Nack { address, reason: format!("register {:#04x} not writable", reg) })
        }
    }

    async fn write_register16(&mut self, address: u8, reg: u8, value: u16) -> BusResult<()> {
        let mut state = self.state()?;
        state.check(address)?;
        if address != state.addresses.adc || reg != adc::REG_CONFIG {
            return Err(BusError::Nack { address, reason: format!("register {:#04x} not writable", reg) });
        }
        state.adc.config = value;
        if value & adc::CFG_OS_SINGLE != 0 {
            state.start_conversion(value);
        }
        Ok(())
    }

    async fn read_register(&mut self, address: u8, reg: u8) -> BusResult<u8> {
        let value = self.read_register16(address, reg).await?;
        Ok((value >> 8) as u8)
    }

    async fn read_register16(&mut self, address: u8, reg: u8) -> BusResult<u16> {
        let state = self.state()?;
        state.check(address)?;
        if address != state.addresses.adc {
            return Err(BusError::Nack { address, reason: format!("register {:#04x} not readable", reg) });
        }
        match reg {
            adc::REG_CONVERSION => Ok(state.adc.conversion as u16),
            // conversion has always finished by the time anyone asks
            adc::REG_CONFIG => Ok(state.adc.config | adc::CFG_OS_SINGLE),
            _ => Ok(0),
        }
    }

    async fn write_bytes(&mut self, address: u8, data: &[u8]) -> BusResult<()> {
        let mut state = self.state()?;
        state.check(address)?;
        if address == state.addresses.eeprom {
            return state.eeprom_write(address, data);
        }
        if address == state.addresses.elasticity {
            let [hi, lo, values @ ..] = data else {
                return Err(BusError::Nack { address, reason: "missing register index".to_string() });
            };
            let index = u16::from_be_bytes([*hi, *lo]);
            state.tof.pointer = index;
            for (i, value) in values.iter().enumerate() {
                state.tof_write(index.wrapping_add(i as u16), *value);
            }
            return Ok(());
        }
        if address == state.addresses.moisture {
            if let [msb, lsb] = data {
                state.run_moisture_command(u16::from_be_bytes([*msb, *lsb]));
                return Ok(());
            }
        }
        Err(BusError::Nack { address, reason: format!("unexpected {}-byte write", data.len()) })
    }

    async fn read_bytes(&mut self, address: u8, buf: &mut [u8]) -> BusResult<usize> {
        let mut state = self.state()?;
        state.check(address)?;
        if address == state.addresses.eeprom {
            return Ok(state.eeprom_read(buf));
        }
        if address == state.addresses.elasticity {
            if state.tof.short_read {
                return Ok(0);
            }
            let start = state.tof.pointer;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = state.tof_read(start.wrapping_add(i as u16));
            }
            return Ok(buf.len());
        }
        if address == state.addresses.moisture {
            let Some(response) = state.moisture.pending.take() else {
                return Err(BusError::Nack { address, reason: "no measurement pending".to_string() });
            };
            let len = buf.len().min(response.len());
            buf[..len].copy_from_slice(&response[..len]);
            return Ok(len);
        }
        Err(BusError::Nack { address, reason: "raw reads not supported".to_string() })
    }

    async fn is_present(&mut self, address: u8) -> bool {
        match self.state() {
            Ok(state) => state.check(address).is_ok(),
            Err(_) => false,
        }
    }
}

/// Test-side access to the simulated device models
#[derive(Clone)]
pub struct SimulatedHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }

    pub fn set_absent(&self, address: u8, absent: bool) {
        let mut state = self.state();
        if absent {
            state.absent.insert(address);
        } else {
            state.absent.remove(&address);
        }
    }

    /// Queue conversion codes returned, in order, for `channel`.
    pub fn push_adc_codes(&self, channel: u8, codes: impl IntoIterator<Item = i16>) {
        let mut state = self.state();
        if let Some(queue) = state.adc.scripted.get_mut(channel as usize) {
            queue.extend(codes);
        }
    }

    /// Last config word written to the ADC
    pub fn adc_config(&self) -> u16 {
        self.state().adc.config
    }

    /// Pin the humidity sensor to fixed readings instead of random ones.
    pub fn set_climate(&self, temperature_c: f32, humidity_pct: f32) {
        self.state().moisture.climate = Some((temperature_c, humidity_pct));
    }

    pub fn corrupt_moisture_crc(&self, corrupt: bool) {
        self.state().moisture.corrupt_crc = corrupt;
    }

    pub fn set_tof_range(&self, range_mm: u8) {
        self.state().tof.fixed_range = Some(range_mm);
    }

    /// Make ToF register reads return no data
    pub fn set_tof_short_read(&self, short: bool) {
        self.state().tof.short_read = short;
    }

    pub fn eeprom_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state();
        let end = (offset + len).min(eeprom::SIZE);
        state.eeprom.memory[offset.min(end)..end].to_vec()
    }

    pub fn write_eeprom(&self, offset: usize, data: &[u8]) {
        let mut state = self.state();
        for (i, byte) in data.iter().enumerate() {
            if let Some(slot) = state.eeprom.memory.get_mut(offset + i) {
                *slot = *byte;
            }
        }
    }

    pub fn flip_eeprom_byte(&self, offset: usize) {
        if let Some(byte) = self.state().eeprom.memory.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }

    /// Fail (and tear) the next `n` EEPROM page writes.
    pub fn fail_next_eeprom_writes(&self, n: usize) {
        self.state().eeprom.failing_writes = n;
    }

    /// Page writes completed or attempted so far
    pub fn eeprom_page_writes(&self) -> usize {
        self.state().eeprom.page_writes
    }

    /// Truncate EEPROM reads to at most `n` bytes; `None` restores full reads.
    pub fn set_eeprom_short_read(&self, n: Option<usize>) {
        self.state().eeprom.short_read = n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub direction: Direction,
    pub pull: PullMode,
    pub level: bool,
    pub pwm: Option<(u32, u8)>,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            pull: PullMode::None,
            level: false,
            pwm: None,
        }
    }
}

#[derive(Default)]
struct GpioState {
    pins: HashMap<u8, PinState>,
    watches: HashMap<u8, (Edge, broadcast::Sender<EdgeEvent>)>,
    cleaned_up: bool,
}

/// Simulated digital I/O controller
#[derive(Clone)]
pub struct SimulatedGpio {
    state: Arc<Mutex<GpioState>>,
    start: Instant,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GpioState::default())),
            start: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GpioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pin(&self, pin: u8) -> PinState {
        self.state().pins.get(&pin).copied().unwrap_or_default()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.state().cleaned_up
    }

    /// Drive an input pin from outside, as the wired peripheral would.
    pub fn drive_input(&self, pin: u8, level: bool) {
        let t_mono_ms = self.start.elapsed().as_millis() as u64;
        let mut state = self.state();
        let entry = state.pins.entry(pin).or_default();
        let changed = entry.level != level;
        entry.level = level;
        if !changed {
            return;
        }
        if let Some((edge, tx)) = state.watches.get(&pin) {
            if edge.matches(level) {
                let _ = tx.send(EdgeEvent { pin, level, t_mono_ms });
            }
        }
    }
}

impl Default for SimulatedGpio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigitalIo for SimulatedGpio {
    async fn initialize(&mut self) -> BusResult<()> {
        self.state().cleaned_up = false;
        Ok(())
    }

    async fn cleanup(&mut self) {
        let mut state = self.state();
        state.watches.clear();
        state.cleaned_up = true;
    }

    async fn set_direction(&mut self, pin: u8, direction: Direction) -> BusResult<()> {
        self.state().pins.entry(pin).or_default().direction = direction;
        Ok(())
    }

    async fn set_pull_mode(&mut self, pin: u8, mode: PullMode) -> BusResult<()> {
        let mut state = self.state();
        let entry = state.pins.entry(pin).or_default();
        entry.pull = mode;
        if entry.direction == Direction::Input {
            entry.level = mode == PullMode::Up;
        }
        Ok(())
    }

    async fn write(&mut self, pin: u8, level: bool) -> BusResult<()> {
        let mut state = self.state();
        let entry = state.pins.entry(pin).or_default();
        if entry.direction != Direction::Output {
            return Err(BusError::Unsupported(format!("pin {} is not an output", pin)));
        }
        entry.level = level;
        Ok(())
    }

    async fn read(&mut self, pin: u8) -> BusResult<bool> {
        Ok(self.state().pins.get(&pin).map(|p| p.level).unwrap_or(false))
    }

    async fn start_pwm(&mut self, pin: u8, frequency_hz: u32, duty_percent: u8) -> BusResult<()> {
        if frequency_hz == 0 {
            return Err(BusError::Unsupported("PWM frequency of 0 Hz".to_string()));
        }
        self.state().pins.entry(pin).or_default().pwm = Some((frequency_hz, duty_percent.min(100)));
        Ok(())
    }

    async fn stop_pwm(&mut self, pin: u8) -> BusResult<()> {
        self.state().pins.entry(pin).or_default().pwm = None;
        Ok(())
    }

    async fn subscribe_edge(&mut self, pin: u8, edge: Edge) -> BusResult<broadcast::Receiver<EdgeEvent>> {
        let mut state = self.state();
        state.pins.entry(pin).or_default().direction = Direction::Input;
        let (_, tx) = state
            .watches
            .entry(pin)
            .or_insert_with(|| (edge, broadcast::channel(EDGE_CHANNEL_CAPACITY).0));
        Ok(tx.subscribe())
    }
}
