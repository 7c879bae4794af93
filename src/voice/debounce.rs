//! Trigger debouncing
//!
//! Two-state machine: `Armed` accepts the next detection and moves to
//! `Cooling`; `Cooling` discards detections until `cooldown` has elapsed since
//! the last accepted one.

use std::time::{Duration, Instant};

use super::DetectionEvent;

/// Debounce phase at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncePhase {
    /// Ready to trigger
    Armed,
    /// Suppressing detections
    Cooling,
}

/// Converts detections into at most one trigger per cooldown window
#[derive(Debug)]
pub struct DebounceController {
    cooldown: Duration,
    last_trigger: Option<Instant>,
}

impl DebounceController {
    /// Create an armed controller
    #[must_use]
    pub const fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_trigger: None,
        }
    }

    /// Update the cooldown window
    pub const fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Current cooldown window
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Phase at `now`
    #[must_use]
    pub fn phase(&self, now: Instant) -> DebouncePhase {
        match self.last_trigger {
            Some(last) if now.saturating_duration_since(last) < self.cooldown => {
                DebouncePhase::Cooling
            }
            _ => DebouncePhase::Armed,
        }
    }

    /// Offer a detection, returning it if it becomes a trigger
    ///
    /// Accepted detections consume the slot regardless of whether the
    /// trigger is later delivered.
    pub fn offer(&mut self, event: DetectionEvent) -> Option<DetectionEvent> {
        match self.phase(event.at) {
            DebouncePhase::Armed => {
                self.last_trigger = Some(event.at);
                Some(event)
            }
            DebouncePhase::Cooling => {
                tracing::debug!(
                    keyword = %event.keyword,
                    confidence = event.confidence,
                    "detection suppressed during cooldown"
                );
                None
            }
        }
    }

    /// Time of the last accepted detection
    #[must_use]
    pub const fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn detection(at: Instant) -> DetectionEvent {
        DetectionEvent {
            at,
            timestamp: Utc::now(),
            confidence: 0.9,
            keyword: "hey steve".to_string(),
        }
    }

    #[test]
    fn starts_armed() {
        let controller = DebounceController::new(Duration::from_millis(1000));
        assert_eq!(controller.phase(Instant::now()), DebouncePhase::Armed);
        assert!(controller.last_trigger().is_none());
    }

    #[test]
    fn cooling_discards_until_window_elapses() {
        let base = Instant::now();
        let mut controller = DebounceController::new(Duration::from_millis(1000));

        assert!(controller.offer(detection(base)).is_some());
        assert_eq!(controller.phase(base), DebouncePhase::Cooling);

        assert!(controller.offer(detection(base + Duration::from_millis(999))).is_none());
        // Discarded detections do not extend the window
        assert_eq!(controller.last_trigger(), Some(base));

        assert!(controller.offer(detection(base + Duration::from_millis(1000))).is_some());
    }

    #[test]
    fn half_cooldown_spacing_dispatches_every_other() {
        let cooldown = Duration::from_millis(800);
        let base = Instant::now();

        for n in 1..=11u32 {
            let mut controller = DebounceController::new(cooldown);
            let accepted = (0..n)
                .filter_map(|i| controller.offer(detection(base + cooldown / 2 * i)))
                .collect::<Vec<_>>();

            assert_eq!(accepted.len() as u32, n.div_ceil(2));
            for pair in accepted.windows(2) {
                assert!(pair[1].at - pair[0].at >= cooldown);
            }
        }
    }

    #[test]
    fn shorter_cooldown_applies_immediately() {
        let base = Instant::now();
        let mut controller = DebounceController::new(Duration::from_secs(10));
        controller.offer(detection(base));

        controller.set_cooldown(Duration::from_millis(100));
        assert_eq!(
            controller.phase(base + Duration::from_millis(100)),
            DebouncePhase::Armed
        );
    }
}
