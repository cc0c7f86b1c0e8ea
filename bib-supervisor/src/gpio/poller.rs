//! Input polling and debouncing.
//!
//! One task per provider samples the input lines at the configured cadence
//! and reports transitions on a broadcast channel once a new value has been
//! stable for the line's debounce window. The same task drives the
//! provider's housekeeping hook (auto-clear of the critical-fail signal).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::bib::BitBangConfig;
use crate::gpio::{BitBangProvider, InputEvent};

struct LineState {
    debounce: Duration,
    reported: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

impl LineState {
    /// Feeds one sample; returns a value once it has been stable long
    /// enough to report.
    fn feed(&mut self, value: bool, now: Instant) -> Option<bool> {
        if self.reported.is_none() {
            // First sample fixes the baseline without reporting.
            self.reported = Some(value);
            return None;
        }
        if self.reported == Some(value) {
            self.candidate = None;
            return None;
        }
        match self.candidate {
            Some((candidate, since)) if candidate == value => {
                if now.duration_since(since) >= self.debounce {
                    self.reported = Some(value);
                    self.candidate = None;
                    Some(value)
                } else {
                    None
                }
            }
            _ => {
                self.candidate = Some((value, now));
                // A zero debounce reports on the sample that saw the change.
                if self.debounce.is_zero() {
                    self.reported = Some(value);
                    self.candidate = None;
                    Some(value)
                } else {
                    None
                }
            }
        }
    }
}

/// Background sampler for one bit-bang provider.
pub struct GpioPoller;

impl GpioPoller {
    /// Spawns the polling task. Debounce windows come from `config`;
    /// transitions are published on `events`.
    pub fn spawn(
        provider: Arc<dyn BitBangProvider>,
        config: &BitBangConfig,
        events: broadcast::Sender<InputEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut lines: HashMap<String, LineState> = config
            .inputs
            .iter()
            .map(|input| {
                (
                    input.name.clone(),
                    LineState {
                        debounce: input.debounce,
                        reported: None,
                        candidate: None,
                    },
                )
            })
            .collect();
        let interval = config.polling_interval;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let sampler = Arc::clone(&provider);
                let sampled = tokio::task::spawn_blocking(move || {
                    sampler.maintain().and_then(|_| sampler.sample_inputs())
                })
                .await;

                let samples = match sampled {
                    Ok(Ok(samples)) => samples,
                    Ok(Err(e)) => {
                        tracing::warn!("input sampling failed: {e}");
                        continue;
                    }
                    Err(_) => break,
                };

                let now = Instant::now();
                for (name, value) in samples {
                    let Some(line) = lines.get_mut(&name) else {
                        continue;
                    };
                    if let Some(stable) = line.feed(value, now) {
                        tracing::debug!(line = %name, value = stable, "input changed");
                        let _ = events.send(InputEvent {
                            name,
                            value: stable,
                            at: SystemTime::now(),
                        });
                    }
                }
            }
            tracing::debug!("gpio poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::bib::InputBit;
    use crate::gpio::bitbang::{FakeBitBangHandle, FtdiBitBang};
    use crate::gpio::INPUT_POWER_DOWN_HEADS_UP;
    use pretty_assertions::assert_eq;

    #[test]
    fn debounce_ignores_glitches() {
        let mut line = LineState {
            debounce: Duration::from_millis(100),
            reported: None,
            candidate: None,
        };
        let t0 = Instant::now();
        assert_eq!(line.feed(false, t0), None); // baseline
        assert_eq!(line.feed(true, t0 + Duration::from_millis(10)), None);
        // Bounces back before the window closes: no event.
        assert_eq!(line.feed(false, t0 + Duration::from_millis(20)), None);
        assert_eq!(line.feed(true, t0 + Duration::from_millis(30)), None);
        // Now stays high past the window.
        assert_eq!(line.feed(true, t0 + Duration::from_millis(140)), Some(true));
        // Stable value does not re-report.
        assert_eq!(line.feed(true, t0 + Duration::from_millis(200)), None);
    }

    #[test]
    fn zero_debounce_reports_immediately() {
        let mut line = LineState {
            debounce: Duration::ZERO,
            reported: None,
            candidate: None,
        };
        let t0 = Instant::now();
        assert_eq!(line.feed(false, t0), None);
        assert_eq!(line.feed(true, t0 + Duration::from_millis(1)), Some(true));
    }

    #[tokio::test]
    async fn poller_reports_debounced_transition() {
        let config = BitBangConfig {
            enabled: true,
            inputs: vec![InputBit {
                name: INPUT_POWER_DOWN_HEADS_UP.to_owned(),
                bit: 1,
                active_low: false,
                debounce: Duration::from_millis(20),
            }],
            polling_interval: Duration::from_millis(5),
            ..BitBangConfig::default()
        };
        let (driver, handle) = FakeBitBangHandle::new();
        let provider: Arc<dyn BitBangProvider> =
            Arc::new(FtdiBitBang::new(config.clone(), Box::new(driver)).unwrap());

        let (events, mut rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let task = GpioPoller::spawn(provider, &config, events, shutdown.clone());

        // Let the baseline settle, then raise the line.
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.set_pin(1, true);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event before timeout")
            .unwrap();
        assert_eq!(event.name, INPUT_POWER_DOWN_HEADS_UP);
        assert!(event.value);

        shutdown.cancel();
        let _ = task.await;
    }
}
