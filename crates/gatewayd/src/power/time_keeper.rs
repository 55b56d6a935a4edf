//! Pushes day/night tariff bitmaps to the power modules.
//!
//! Each module stores 14 `HH:MM` boundaries per port (7 days of start/stop).
//! The keeper evaluates them against the local clock and broadcasts an `SDN`
//! update whenever a module's bitmap changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveTime, Timelike};
use tracing::warn;

use super::api;
use super::command::PowerValue;
use super::communicator::PowerCommunicator;
use super::controller::PowerController;
use crate::serial::SerialTransport;

pub struct TimeKeeper<T: SerialTransport> {
    communicator: PowerCommunicator<T>,
    controller: PowerController,
    period: Duration,
    stopped: Arc<AtomicBool>,
}

impl<T: SerialTransport> TimeKeeper<T> {
    pub fn new(
        communicator: PowerCommunicator<T>,
        controller: PowerController,
        period: Duration,
    ) -> Self {
        Self {
            communicator,
            controller,
            period,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) {
        let communicator = self.communicator.clone();
        let controller = self.controller.clone();
        let period = self.period;
        let stopped = self.stopped.clone();

        tokio::spawn(async move {
            let mut last_sent: HashMap<i64, Vec<u8>> = HashMap::new();
            while !stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(period).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }

                let modules = match controller.get_power_modules().await {
                    Ok(modules) => modules,
                    Err(error) => {
                        warn!("time keeper could not list power modules: {error}");
                        continue;
                    }
                };

                let now = Local::now();
                for module in modules {
                    let bitmap: Vec<u8> = module
                        .times
                        .iter()
                        .map(|times| day_night(times.as_deref(), &now))
                        .collect();

                    if last_sent.get(&module.id) == Some(&bitmap) {
                        continue;
                    }

                    let command = match api::set_day_night(module.version) {
                        Ok(command) => command,
                        Err(error) => {
                            warn!("module {} skipped: {error}", module.id);
                            continue;
                        }
                    };
                    let args: Vec<PowerValue> =
                        bitmap.iter().map(|b| PowerValue::U8(*b)).collect();

                    match communicator.do_command(module.address, &command, &args).await {
                        Ok(_) => {
                            last_sent.insert(module.id, bitmap);
                        }
                        Err(error) => {
                            warn!("day/night update for module {} failed: {error}", module.id);
                        }
                    }
                }
            }
        });
    }
}

/// Evaluate one port's boundary list against the clock. Missing or
/// malformed lists put the port in day tariff.
pub fn day_night<Tz: chrono::TimeZone>(times: Option<&str>, now: &chrono::DateTime<Tz>) -> u8 {
    let Some(times) = times else {
        return api::DAY;
    };

    let boundaries: Vec<&str> = times.split(',').collect();
    if boundaries.len() != 14 {
        warn!("expected 14 day/night boundaries, got {}", boundaries.len());
        return api::DAY;
    }

    let weekday = now.weekday().num_days_from_monday() as usize;
    let parse = |value: &str| NaiveTime::parse_from_str(value.trim(), "%H:%M").ok();
    let (Some(start), Some(stop)) = (parse(boundaries[2 * weekday]), parse(boundaries[2 * weekday + 1]))
    else {
        warn!("malformed day/night boundary in {times:?}");
        return api::DAY;
    };

    let current = match NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second()) {
        Some(time) => time,
        None => return api::DAY,
    };

    if start <= current && current < stop {
        api::DAY
    } else {
        api::NIGHT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn week_times(start: &str, stop: &str) -> String {
        std::iter::repeat_n(format!("{start},{stop}"), 7)
            .collect::<Vec<_>>()
            .join(",")
    }

    #[test]
    fn inside_the_window_is_day() {
        let times = week_times("06:00", "22:00");
        let noon = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        assert_eq!(day_night(Some(&times), &noon), api::DAY);
    }

    #[test]
    fn outside_the_window_is_night() {
        let times = week_times("06:00", "22:00");
        let late = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 23, 30, 0).unwrap();
        assert_eq!(day_night(Some(&times), &late), api::NIGHT);

        let early = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 5, 59, 59).unwrap();
        assert_eq!(day_night(Some(&times), &early), api::NIGHT);
    }

    #[test]
    fn boundaries_are_half_open() {
        let times = week_times("06:00", "22:00");
        let at_start = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 6, 0, 0).unwrap();
        assert_eq!(day_night(Some(&times), &at_start), api::DAY);

        let at_stop = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 22, 0, 0).unwrap();
        assert_eq!(day_night(Some(&times), &at_stop), api::NIGHT);
    }

    #[test]
    fn each_weekday_uses_its_own_boundaries() {
        // Weekend-only day tariff.
        let times = "00:00,00:00,00:00,00:00,00:00,00:00,00:00,00:00,00:00,00:00,\
                     08:00,20:00,08:00,20:00";
        // 2024-03-09 is a Saturday.
        let saturday = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(day_night(Some(times), &saturday), api::DAY);

        let wednesday = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        assert_eq!(day_night(Some(times), &wednesday), api::NIGHT);
    }

    #[test]
    fn missing_or_malformed_lists_default_to_day() {
        let noon = chrono::Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        assert_eq!(day_night(None, &noon), api::DAY);
        assert_eq!(day_night(Some("06:00,22:00"), &noon), api::DAY);
        assert_eq!(day_night(Some(&week_times("junk", "22:00")), &noon), api::DAY);
    }
}
