//! In-memory status caches fed by polled reads and unsolicited frames.
//!
//! Readers see either the last full refresh or a strictly newer partial
//! update; time-based `should_refresh` guards stale reads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Everything the master reports about one output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputInfo {
    pub output_nr: u8,
    pub module_type: String,
    pub name: String,
    pub light: u8,
    pub timer: u16,
    pub ctimer: u16,
    pub status: u8,
    pub dimmer: u8,
    pub controller_out: u8,
    pub max_power: u8,
    pub floor_level: u8,
}

/// Cache of all output states, kept current by OL frames.
pub struct OutputStatus {
    outputs: Vec<OutputInfo>,
    refreshed_at: Instant,
    refresh_period: Duration,
    force: bool,
}

impl OutputStatus {
    pub fn new(outputs: Vec<OutputInfo>, refresh_period: Duration) -> Self {
        Self {
            outputs,
            refreshed_at: Instant::now(),
            refresh_period,
            force: false,
        }
    }

    /// Replace the cache with a freshly polled list.
    pub fn full_update(&mut self, outputs: Vec<OutputInfo>) {
        self.outputs = outputs;
        self.refreshed_at = Instant::now();
        self.force = false;
    }

    /// Apply one OL frame: the listed outputs are on (with their dimmer
    /// value), everything else is off.
    pub fn partial_update(&mut self, on_outputs: &[(u8, u8)]) {
        for output in &mut self.outputs {
            output.status = 0;
        }
        for (output_nr, dimmer) in on_outputs {
            if let Some(output) = self.outputs.iter_mut().find(|o| o.output_nr == *output_nr) {
                output.status = 1;
                output.dimmer = *dimmer;
            }
        }
    }

    /// Drop the cache's validity; the next read polls the master again.
    pub fn force_refresh(&mut self) {
        self.force = true;
    }

    pub fn should_refresh(&self) -> bool {
        self.force || self.refreshed_at.elapsed() >= self.refresh_period
    }

    pub fn get_outputs(&self) -> &[OutputInfo] {
        &self.outputs
    }
}

/// Ring of the last pressed inputs, limited in size and age.
pub struct InputStatus {
    events: VecDeque<(Instant, (u8, u8))>,
    capacity: usize,
    window: Duration,
}

impl InputStatus {
    pub fn new() -> Self {
        Self::with_limits(5, Duration::from_secs(300))
    }

    pub fn with_limits(capacity: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            window,
        }
    }

    /// Record one `(input, output)` press.
    pub fn add_data(&mut self, event: (u8, u8)) {
        self.events.push_back((Instant::now(), event));
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// The recent presses, oldest first.
    pub fn get_status(&self) -> Vec<(u8, u8)> {
        self.events
            .iter()
            .filter(|(at, _)| at.elapsed() < self.window)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for InputStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Slow-changing global thermostat information.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatInfo {
    pub active: bool,
    pub sensor_nr: u8,
    pub output0_nr: u8,
    pub output1_nr: u8,
    pub name: String,
}

pub struct ThermostatStatus {
    thermostats: Vec<ThermostatInfo>,
    refreshed_at: Instant,
    refresh_period: Duration,
    force: bool,
}

impl ThermostatStatus {
    pub fn new(thermostats: Vec<ThermostatInfo>, refresh_period: Duration) -> Self {
        Self {
            thermostats,
            refreshed_at: Instant::now(),
            refresh_period,
            force: false,
        }
    }

    pub fn update(&mut self, thermostats: Vec<ThermostatInfo>) {
        self.thermostats = thermostats;
        self.refreshed_at = Instant::now();
        self.force = false;
    }

    pub fn force_refresh(&mut self) {
        self.force = true;
    }

    pub fn should_refresh(&self) -> bool {
        self.force || self.refreshed_at.elapsed() >= self.refresh_period
    }

    pub fn get_thermostats(&self) -> &[ThermostatInfo] {
        &self.thermostats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(output_nr: u8) -> OutputInfo {
        OutputInfo {
            output_nr,
            module_type: "O".to_string(),
            name: format!("output {output_nr}"),
            light: 255,
            timer: 0,
            ctimer: 0,
            status: 0,
            dimmer: 0,
            controller_out: 255,
            max_power: 255,
            floor_level: 0,
        }
    }

    #[test]
    fn partial_update_turns_unlisted_outputs_off() {
        let mut status = OutputStatus::new(vec![output(0), output(1), output(2)], Duration::from_secs(600));
        status.partial_update(&[(1, 50)]);
        let outputs = status.get_outputs();
        assert_eq!(outputs[0].status, 0);
        assert_eq!((outputs[1].status, outputs[1].dimmer), (1, 50));
        assert_eq!(outputs[2].status, 0);

        status.partial_update(&[(2, 10)]);
        let outputs = status.get_outputs();
        assert_eq!(outputs[1].status, 0);
        assert_eq!((outputs[2].status, outputs[2].dimmer), (1, 10));
    }

    #[test]
    fn refresh_is_forced_or_time_based() {
        let mut status = OutputStatus::new(vec![output(0)], Duration::from_secs(600));
        assert!(!status.should_refresh());
        status.force_refresh();
        assert!(status.should_refresh());
        status.full_update(vec![output(0)]);
        assert!(!status.should_refresh());

        let mut fast = OutputStatus::new(vec![output(0)], Duration::from_millis(0));
        assert!(fast.should_refresh());
    }

    #[test]
    fn input_ring_keeps_the_last_five() {
        let mut status = InputStatus::new();
        for i in 0..7u8 {
            status.add_data((i, i + 100));
        }
        let events = status.get_status();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], (2, 102));
        assert_eq!(events[4], (6, 106));
    }

    #[test]
    fn input_ring_expires_old_events() {
        let mut status = InputStatus::with_limits(5, Duration::from_millis(0));
        status.add_data((1, 2));
        assert!(status.get_status().is_empty());
    }

    #[test]
    fn thermostat_cache_honors_its_period() {
        let mut status = ThermostatStatus::new(Vec::new(), Duration::from_secs(1800));
        assert!(!status.should_refresh());
        status.force_refresh();
        assert!(status.should_refresh());
        status.update(Vec::new());
        assert!(!status.should_refresh());
    }
}
