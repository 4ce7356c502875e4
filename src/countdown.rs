//! Client-side countdown rendering
//!
//! The server freezes an absolute `startTime` when the countdown begins.
//! Renderers recompute the remaining time from it on every tick instead of
//! trusting a decrementing number off the wire. Nothing computed here is
//! ever sent back to the server.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{RaceStateSnapshot, RaceStatus};

const DEGRADED_STEP_MS: i64 = 1000;

/// Whole seconds left, rounded up. Absurd start times pin at `u32::MAX`.
pub fn seconds_remaining(remaining_ms: i64) -> u32 {
    let secs = remaining_ms.max(0).saturating_add(999) / 1000;
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// The parts of a snapshot the countdown needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownInput {
    pub countdown_value: Option<u32>,
    /// Server epoch ms
    pub start_time: Option<i64>,
    pub status: RaceStatus,
}

impl From<&RaceStateSnapshot> for CountdownInput {
    fn from(snapshot: &RaceStateSnapshot) -> Self {
        Self {
            countdown_value: snapshot.countdown_value,
            start_time: snapshot.start_time,
            status: snapshot.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownDisplay {
    Hidden,
    Seconds(u32),
    Go,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownFrame {
    pub display: CountdownDisplay,
    /// True on exactly one tick per countdown
    pub fire_go: bool,
}

#[derive(Debug, Clone)]
pub struct Countdown {
    input: CountdownInput,
    /// Degraded mode: local ms at which `countdown_value` was received
    received_at: i64,
    fired: bool,
}

impl Countdown {
    pub fn new(input: CountdownInput, now_ms: i64) -> Self {
        Self {
            input,
            received_at: now_ms,
            fired: false,
        }
    }

    /// Take a newer snapshot. A changed start time is a new countdown and
    /// re-arms `Go`.
    pub fn update(&mut self, input: CountdownInput, now_ms: i64) {
        if input.start_time != self.input.start_time {
            self.fired = false;
        }
        if input.countdown_value != self.input.countdown_value {
            self.received_at = now_ms;
        }
        self.input = input;
    }

    fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        match self.input.start_time {
            Some(start) => Some(start.saturating_sub(now_ms)),
            None => {
                let value = i64::from(self.input.countdown_value?);
                let elapsed = now_ms.saturating_sub(self.received_at);
                Some((value * DEGRADED_STEP_MS).saturating_sub(elapsed))
            }
        }
    }

    /// `now_ms` is the caller's best estimate of server time
    pub fn tick(&mut self, now_ms: i64) -> CountdownFrame {
        let display = match self.input.status {
            RaceStatus::Waiting | RaceStatus::Finished => CountdownDisplay::Hidden,
            RaceStatus::InProgress => CountdownDisplay::Go,
            RaceStatus::Countdown => match self.remaining_ms(now_ms) {
                None => CountdownDisplay::Hidden,
                Some(ms) if ms <= 0 => CountdownDisplay::Go,
                Some(ms) => CountdownDisplay::Seconds(seconds_remaining(ms)),
            },
        };

        let fire_go = display == CountdownDisplay::Go && !self.fired;
        if fire_go {
            self.fired = true;
        }
        CountdownFrame { display, fire_go }
    }
}

/// Server clock offset estimate from `serverNow` samples
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset_ms: Option<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network delay only ever makes the local receive time later, so the
    /// largest `server - local` sample is the least delayed one.
    pub fn observe(&mut self, server_now_ms: i64, local_received_ms: i64) {
        let sample = server_now_ms - local_received_ms;
        self.offset_ms = Some(self.offset_ms.map_or(sample, |o| o.max(sample)));
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.unwrap_or(0)
    }

    pub fn server_now(&self, local_ms: i64) -> i64 {
        local_ms + self.offset_ms()
    }
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    Display(CountdownDisplay),
    Go,
}

pub const TICK: Duration = Duration::from_millis(100);

/// Drive a countdown on a 100ms tick. Newer snapshots arrive on `updates`;
/// display changes and `Go` (once per start time) are sent to `tx`. The task
/// stops when either channel closes.
pub fn spawn_countdown(
    input: CountdownInput,
    clock: Arc<dyn Clock>,
    offset_ms: i64,
    mut updates: mpsc::Receiver<CountdownInput>,
    tx: mpsc::Sender<CountdownEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let now = || clock.now_ms().saturating_add(offset_ms);
        let mut countdown = Countdown::new(input, now());
        let mut shown = None;
        let mut ticker = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = countdown.tick(now());
                    if shown != Some(frame.display) {
                        shown = Some(frame.display);
                        if tx.send(CountdownEvent::Display(frame.display)).await.is_err() {
                            return;
                        }
                    }
                    if frame.fire_go && tx.send(CountdownEvent::Go).await.is_err() {
                        return;
                    }
                }
                update = updates.recv() => match update {
                    Some(input) => countdown.update(input, now()),
                    None => return,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(start_time: Option<i64>, value: Option<u32>) -> CountdownInput {
        CountdownInput {
            countdown_value: value,
            start_time,
            status: RaceStatus::Countdown,
        }
    }

    #[test]
    fn test_reaches_go_within_a_tick_of_start() {
        let t0 = 1_000_000;
        let mut cd = Countdown::new(counting(Some(t0 + 3000), Some(3)), t0);

        let mut go_at = None;
        let mut fired = 0;
        let mut last = None;
        for step in 0..=40 {
            let now = t0 + step * 100;
            let frame = cd.tick(now);
            if let (Some(CountdownDisplay::Seconds(prev)), CountdownDisplay::Seconds(cur)) =
                (last, frame.display)
            {
                assert!(cur <= prev, "countdown went up");
            }
            if frame.fire_go {
                fired += 1;
                go_at.get_or_insert(now);
            }
            last = Some(frame.display);
        }

        let go_at = go_at.expect("never reached GO");
        assert!(go_at >= t0 + 3000 && go_at < t0 + 3100);
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_go_fires_once_across_rerenders() {
        let mut cd = Countdown::new(counting(Some(5000), Some(1)), 4500);
        assert_eq!(cd.tick(4500).display, CountdownDisplay::Seconds(1));
        assert!(cd.tick(5000).fire_go);
        for t in [5000, 5100, 9000] {
            let frame = cd.tick(t);
            assert_eq!(frame.display, CountdownDisplay::Go);
            assert!(!frame.fire_go);
        }

        // Same countdown re-delivered by a fresh snapshot
        cd.update(counting(Some(5000), None), 5200);
        assert!(!cd.tick(5200).fire_go);
    }

    #[test]
    fn test_late_attach_fires_immediately() {
        let mut cd = Countdown::new(counting(Some(1000), Some(0)), 8000);
        let frame = cd.tick(8000);
        assert_eq!(frame.display, CountdownDisplay::Go);
        assert!(frame.fire_go);

        let live = CountdownInput {
            countdown_value: None,
            start_time: Some(1000),
            status: RaceStatus::InProgress,
        };
        let mut cd = Countdown::new(live, 8000);
        assert!(cd.tick(8000).fire_go);
    }

    #[test]
    fn test_degraded_mode_counts_down_integer() {
        let mut cd = Countdown::new(counting(None, Some(3)), 0);
        assert_eq!(cd.tick(0).display, CountdownDisplay::Seconds(3));
        assert_eq!(cd.tick(1500).display, CountdownDisplay::Seconds(2));
        assert_eq!(cd.tick(2100).display, CountdownDisplay::Seconds(1));
        assert!(cd.tick(3000).fire_go);
    }

    #[test]
    fn test_hidden_outside_countdown() {
        for status in [RaceStatus::Waiting, RaceStatus::Finished] {
            let mut cd = Countdown::new(
                CountdownInput {
                    countdown_value: None,
                    start_time: None,
                    status,
                },
                0,
            );
            let frame = cd.tick(0);
            assert_eq!(frame.display, CountdownDisplay::Hidden);
            assert!(!frame.fire_go);
        }
    }

    #[test]
    fn test_new_start_time_rearms_go() {
        let mut cd = Countdown::new(counting(Some(100), None), 200);
        assert!(cd.tick(200).fire_go);
        cd.update(counting(Some(5000), None), 300);
        let frame = cd.tick(300);
        assert_eq!(frame.display, CountdownDisplay::Seconds(5));
        assert!(!frame.fire_go);
        assert!(cd.tick(5000).fire_go);
    }

    #[test]
    fn test_clock_sync_keeps_least_delayed_sample() {
        let mut sync = ClockSync::new();
        assert_eq!(sync.server_now(100), 100);

        sync.observe(10_000, 9_000); // offset 1000, 0 delay
        sync.observe(10_500, 9_800); // offset 700, delayed
        assert_eq!(sync.offset_ms(), 1000);
        assert_eq!(sync.server_now(9_900), 10_900);
    }

    /// Follows tokio's (pausable) clock
    struct FixedOffsetClock(tokio::time::Instant, i64);

    impl Clock for FixedOffsetClock {
        fn now_ms(&self) -> i64 {
            self.1 + self.0.elapsed().as_millis() as i64
        }
    }

    async fn until_go(rx: &mut mpsc::Receiver<CountdownEvent>) -> Vec<CountdownEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
            if event == CountdownEvent::Go {
                break;
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_countdown_emits_single_go() {
        let clock = Arc::new(FixedOffsetClock(tokio::time::Instant::now(), 0));
        let (update_tx, update_rx) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(64);
        let task = spawn_countdown(counting(Some(300), Some(1)), clock, 0, update_rx, tx);

        let events = until_go(&mut rx).await;
        assert_eq!(events.first(), Some(&CountdownEvent::Display(CountdownDisplay::Seconds(1))));
        assert_eq!(events.last(), Some(&CountdownEvent::Go));

        // The same countdown re-delivered and re-rendered never fires again
        update_tx.send(counting(Some(300), None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(update_tx);
        task.await.unwrap();

        let mut rest = Vec::new();
        while let Some(event) = rx.recv().await {
            rest.push(event);
        }
        assert!(!rest.contains(&CountdownEvent::Go));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_countdown_follows_new_snapshots() {
        let clock = Arc::new(FixedOffsetClock(tokio::time::Instant::now(), 0));
        let (update_tx, update_rx) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(64);
        let waiting = CountdownInput {
            countdown_value: None,
            start_time: None,
            status: RaceStatus::Waiting,
        };
        let task = spawn_countdown(waiting, clock, 0, update_rx, tx);

        assert_eq!(
            rx.recv().await,
            Some(CountdownEvent::Display(CountdownDisplay::Hidden))
        );

        // The countdown starts in a later snapshot
        update_tx.send(counting(Some(2000), Some(2))).await.unwrap();
        let events = until_go(&mut rx).await;
        assert_eq!(events[0], CountdownEvent::Display(CountdownDisplay::Seconds(2)));
        assert!(events.contains(&CountdownEvent::Display(CountdownDisplay::Seconds(1))));
        assert_eq!(events.iter().filter(|e| **e == CountdownEvent::Go).count(), 1);

        drop(update_tx);
        task.await.unwrap();
    }

    #[test]
    fn test_extreme_start_time_saturates() {
        assert_eq!(seconds_remaining(-5), 0);
        assert_eq!(seconds_remaining(1), 1);
        assert_eq!(seconds_remaining(i64::MAX), u32::MAX);

        let mut cd = Countdown::new(counting(Some(i64::MAX), None), 0);
        assert_eq!(cd.tick(i64::MIN).display, CountdownDisplay::Seconds(u32::MAX));
        assert!(!cd.tick(0).fire_go);
    }
}
