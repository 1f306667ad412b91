use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysfs_gpio::Pin;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DigitalIo, Direction, Edge, EdgeEvent, PullMode, EDGE_CHANNEL_CAPACITY};
use crate::errors::{BusError, BusResult};

const SYSFS_GPIO: &str = "/sys/class/gpio";
const SYSFS_PWM_CHIP: &str = "/sys/class/pwm/pwmchip0";
/// Upper bound on how long a stopped edge watch keeps its thread
const EDGE_POLL_TIMEOUT_MS: isize = 100;

struct EdgeWatch {
    tx: broadcast::Sender<EdgeEvent>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

fn pin_error(pin: u8, err: sysfs_gpio::Error) -> BusError {
    let source = match err {
        sysfs_gpio::Error::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    };
    BusError::Gpio { pin, source }
}

fn kernel_edge(edge: Edge) -> sysfs_gpio::Edge {
    match edge {
        Edge::Rising => sysfs_gpio::Edge::RisingEdge,
        Edge::Falling => sysfs_gpio::Edge::FallingEdge,
        Edge::Both => sysfs_gpio::Edge::BothEdges,
    }
}

/// Linux sysfs digital I/O
///
/// Pins go through `sysfs_gpio`; edge events come from the kernel's edge
/// interrupt on the value file, waited on by one blocking task per pin.
/// sysfs has no pull-resistor control, so only `PullMode::None` is
/// accepted. PWM is driven through the pwmchip attributes.
pub struct SysfsGpio {
    pwm_root: PathBuf,
    exported: HashSet<u8>,
    pwm_exported: HashSet<u8>,
    watches: HashMap<u8, EdgeWatch>,
    start: Instant,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_pwm_root(SYSFS_PWM_CHIP)
    }

    pub fn with_pwm_root(pwm_root: impl Into<PathBuf>) -> Self {
        Self {
            pwm_root: pwm_root.into(),
            exported: HashSet::new(),
            pwm_exported: HashSet::new(),
            watches: HashMap::new(),
            start: Instant::now(),
        }
    }

    fn exported_pin(&mut self, pin: u8) -> BusResult<Pin> {
        let handle = Pin::new(pin as u64);
        if !self.exported.contains(&pin) {
            handle.export().map_err(|e| pin_error(pin, e))?;
            debug!("[gpio] exported pin {}", pin);
            self.exported.insert(pin);
        }
        Ok(handle)
    }

    async fn write_attr(path: &Path, pin: u8, value: &str) -> BusResult<()> {
        tokio::fs::write(path, value)
            .await
            .map_err(|source| BusError::Gpio { pin, source })
    }

    /// Hardware PWM channel for the header pins wired to pwmchip0
    fn pwm_channel(pin: u8) -> Option<u8> {
        match pin {
            12 | 18 => Some(0),
            13 | 19 => Some(1),
            _ => None,
        }
    }

    fn pwm_path(&self, channel: u8, attr: &str) -> PathBuf {
        self.pwm_root.join(format!("pwm{}", channel)).join(attr)
    }

    async fn stop_watches(&mut self) {
        for (pin, watch) in self.watches.drain() {
            watch.stop.store(true, Ordering::Relaxed);
            if let Err(e) = watch.task.await {
                warn!("[gpio] edge watch on pin {} ended abnormally: {}", pin, e);
            }
            if let Err(e) = Pin::new(pin as u64).set_edge(sysfs_gpio::Edge::NoInterrupt) {
                debug!("[gpio] could not clear edge on pin {}: {}", pin, e);
            }
            debug!("[gpio] stopped edge watch on pin {}", pin);
        }
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigitalIo for SysfsGpio {
    async fn initialize(&mut self) -> BusResult<()> {
        tokio::fs::metadata(SYSFS_GPIO)
            .await
            .map_err(|e| BusError::Unsupported(format!("sysfs GPIO unavailable at {}: {}", SYSFS_GPIO, e)))?;
        debug!("[gpio] using {}", SYSFS_GPIO);
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.stop_watches().await;
        let channels: Vec<u8> = self.pwm_exported.drain().collect();
        for channel in channels {
            let _ = tokio::fs::write(self.pwm_path(channel, "enable"), "0").await;
            let _ = tokio::fs::write(self.pwm_root.join("unexport"), channel.to_string()).await;
        }
        for pin in self.exported.drain() {
            if let Err(e) = Pin::new(pin as u64).unexport() {
                warn!("[gpio] failed to unexport pin {}: {}", pin, e);
            }
        }
    }

    async fn set_direction(&mut self, pin: u8, direction: Direction) -> BusResult<()> {
        let handle = self.exported_pin(pin)?;
        let direction = match direction {
            Direction::Input => sysfs_gpio::Direction::In,
            Direction::Output => sysfs_gpio::Direction::Out,
        };
        handle.set_direction(direction).map_err(|e| pin_error(pin, e))
    }

    async fn set_pull_mode(&mut self, pin: u8, mode: PullMode) -> BusResult<()> {
        match mode {
            PullMode::None => Ok(()),
            other => Err(BusError::Unsupported(format!(
                "pull mode {:?} on pin {} (sysfs has no pull control)",
                other, pin
            ))),
        }
    }

    async fn write(&mut self, pin: u8, level: bool) -> BusResult<()> {
        let handle = self.exported_pin(pin)?;
        handle.set_value(level as u8).map_err(|e| pin_error(pin, e))
    }

    async fn read(&mut self, pin: u8) -> BusResult<bool> {
        let handle = self.exported_pin(pin)?;
        Ok(handle.get_value().map_err(|e| pin_error(pin, e))? != 0)
    }

    async fn start_pwm(&mut self, pin: u8, frequency_hz: u32, duty_percent: u8) -> BusResult<()> {
        let channel = Self::pwm_channel(pin)
            .ok_or_else(|| BusError::Unsupported(format!("no hardware PWM on pin {}", pin)))?;
        if frequency_hz == 0 {
            return Err(BusError::Unsupported("PWM frequency of 0 Hz".to_string()));
        }
        if !self.pwm_exported.contains(&channel) {
            if tokio::fs::metadata(self.pwm_root.join(format!("pwm{}", channel))).await.is_err() {
                Self::write_attr(&self.pwm_root.join("export"), pin, &channel.to_string()).await?;
            }
            self.pwm_exported.insert(channel);
        }

        let period_ns = 1_000_000_000u64 / frequency_hz as u64;
        let duty_ns = period_ns * duty_percent.min(100) as u64 / 100;
        // duty must never exceed the period, so clear it before changing the period
        Self::write_attr(&self.pwm_path(channel, "duty_cycle"), pin, "0").await?;
        Self::write_attr(&self.pwm_path(channel, "period"), pin, &period_ns.to_string()).await?;
        Self::write_attr(&self.pwm_path(channel, "duty_cycle"), pin, &duty_ns.to_string()).await?;
        Self::write_attr(&self.pwm_path(channel, "enable"), pin, "1").await?;
        debug!("[gpio] PWM on pin {}: {} Hz, {}%", pin, frequency_hz, duty_percent);
        Ok(())
    }

    async fn stop_pwm(&mut self, pin: u8) -> BusResult<()> {
        let channel = Self::pwm_channel(pin)
            .ok_or_else(|| BusError::Unsupported(format!("no hardware PWM on pin {}", pin)))?;
        Self::write_attr(&self.pwm_path(channel, "enable"), pin, "0").await
    }

    async fn subscribe_edge(&mut self, pin: u8, edge: Edge) -> BusResult<broadcast::Receiver<EdgeEvent>> {
        if let Some(watch) = self.watches.get(&pin) {
            return Ok(watch.tx.subscribe());
        }
        self.set_direction(pin, Direction::Input).await?;
        let handle = Pin::new(pin as u64);
        handle.set_edge(kernel_edge(edge)).map_err(|e| pin_error(pin, e))?;
        let mut poller = handle.get_poller().map_err(|e| pin_error(pin, e))?;
        let mut last = handle.get_value().map_err(|e| pin_error(pin, e))? != 0;

        let (tx, rx) = broadcast::channel(EDGE_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let task_tx = tx.clone();
        let task_stop = stop.clone();
        let start = self.start;
        let task = tokio::task::spawn_blocking(move || {
            while !task_stop.load(Ordering::Relaxed) {
                match poller.poll(EDGE_POLL_TIMEOUT_MS) {
                    Ok(Some(value)) => {
                        let level = value != 0;
                        if level != last && edge.matches(level) {
                            let _ = task_tx.send(EdgeEvent {
                                pin,
                                level,
                                t_mono_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                        last = level;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[gpio] edge watch on pin {} failed: {}", pin, e);
                        break;
                    }
                }
            }
        });

        debug!("[gpio] watching pin {} for {} edges", pin, edge.as_sysfs());
        self.watches.insert(pin, EdgeWatch { tx, stop, task });
        Ok(rx)
    }
}
