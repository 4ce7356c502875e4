//! Race rooms: one task per active race, owning all of its state
//!
//! Gateways talk to a room only through its `RoomHandle`, which pushes
//! commands onto the room's queue. The room task processes them one at a
//! time, so "read counter then write rank" style races cannot happen.

pub mod policy;
pub mod progress;
pub mod ranking;
pub mod state;

use chrono::Utc;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::Identity;
use crate::broadcast::{encode, Broadcaster, Frame, Subscriber};
use crate::config::RaceConfig;
use crate::error::{RaceError, RoomResult};
use crate::protocol::ServerMessage;
use crate::store::RaceStore;
use crate::types::*;

use policy::StartPolicy;
pub use ranking::FinishOutcome;
use state::RaceState;

/// Timing knobs every room shares
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub queue_capacity: usize,
    pub idle_grace: Duration,
    pub countdown_ceiling: Duration,
    pub max_countdown_seconds: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        RoomSettings::from(&RaceConfig::default())
    }
}

impl From<&RaceConfig> for RoomSettings {
    fn from(config: &RaceConfig) -> Self {
        Self {
            queue_capacity: config.room_queue_capacity,
            idle_grace: config.idle_grace,
            countdown_ceiling: config.countdown_ceiling,
            max_countdown_seconds: config.max_countdown_seconds,
        }
    }
}

/// Collaborators handed to every room
#[derive(Clone)]
pub struct RoomContext {
    pub store: Arc<dyn RaceStore>,
    pub policy: Arc<dyn StartPolicy>,
    pub settings: RoomSettings,
}

#[derive(Debug)]
pub enum RoomCommand {
    Subscribe {
        conn_id: ConnectionId,
        identity: Identity,
        requested: Role,
        tx: mpsc::Sender<Frame>,
        reply: oneshot::Sender<RoomResult<Role>>,
    },
    Unsubscribe {
        conn_id: ConnectionId,
    },
    Progress {
        user_id: UserId,
        challenge_index: usize,
        wpm: f64,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    Finish {
        user_id: UserId,
        wpm: f64,
        accuracy: f64,
        reply: oneshot::Sender<RoomResult<FinishOutcome>>,
    },
    StartCountdown {
        identity: Identity,
        duration_seconds: u32,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    ForceEnd {
        identity: Identity,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<RaceStateSnapshot>,
    },
    /// Stop the room if nobody is bound and it is finished or idle too long
    Retire {
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Clone)]
pub struct RoomHandle {
    race_id: RaceId,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn race_id(&self) -> &RaceId {
        &self.race_id
    }

    /// True once the room task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Both handles address the same room task
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> RoomResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RaceError::RoomClosed)?;
        rx.await.map_err(|_| {
            if self.tx.is_closed() {
                RaceError::RoomClosed
            } else {
                RaceError::Internal("room failed to process the request".to_string())
            }
        })
    }

    pub async fn subscribe(
        &self,
        conn_id: ConnectionId,
        identity: Identity,
        requested: Role,
        tx: mpsc::Sender<Frame>,
    ) -> RoomResult<Role> {
        self.request(|reply| RoomCommand::Subscribe {
            conn_id,
            identity,
            requested,
            tx,
            reply,
        })
        .await?
    }

    /// Fire-and-forget unbind. Safe to call from `Drop`.
    pub fn unsubscribe(&self, conn_id: ConnectionId) {
        let cmd = RoomCommand::Unsubscribe { conn_id };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                // Queue is busy; cleanup must still happen
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(rt) => {
                        rt.spawn(async move {
                            let _ = tx.send(cmd).await;
                        });
                    }
                    Err(_) => tracing::error!(race_id = %self.race_id, "Unsubscribe lost: no runtime"),
                }
            }
        }
    }

    pub async fn progress(&self, user_id: UserId, challenge_index: usize, wpm: f64) -> RoomResult<()> {
        self.request(|reply| RoomCommand::Progress {
            user_id,
            challenge_index,
            wpm,
            reply,
        })
        .await?
    }

    pub async fn finish(&self, user_id: UserId, wpm: f64, accuracy: f64) -> RoomResult<FinishOutcome> {
        self.request(|reply| RoomCommand::Finish {
            user_id,
            wpm,
            accuracy,
            reply,
        })
        .await?
    }

    pub async fn start_countdown(&self, identity: Identity, duration_seconds: u32) -> RoomResult<()> {
        self.request(|reply| RoomCommand::StartCountdown {
            identity,
            duration_seconds,
            reply,
        })
        .await?
    }

    pub async fn force_end(&self, identity: Identity) -> RoomResult<()> {
        self.request(|reply| RoomCommand::ForceEnd { identity, reply })
            .await?
    }

    pub async fn snapshot(&self) -> RoomResult<RaceStateSnapshot> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Returns true if the room agreed to stop
    pub async fn retire(&self) -> bool {
        self.request(|reply| RoomCommand::Retire { reply })
            .await
            .unwrap_or(true)
    }
}

/// Start the owner task for one race. `state` is fresh from the race info,
/// or a finished race restored from its saved result.
pub fn spawn_room_with(state: RaceState, ctx: RoomContext) -> RoomHandle {
    let (room, handle) = RaceRoom::new(state, ctx);
    tokio::spawn(room.run());
    handle
}

/// A handle whose room never runs: commands queue up unanswered
#[cfg(test)]
pub(crate) fn detached(race_id: &str) -> (RoomHandle, mpsc::Receiver<RoomCommand>) {
    let (tx, rx) = mpsc::channel(1);
    let handle = RoomHandle {
        race_id: race_id.to_string(),
        tx,
    };
    (handle, rx)
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct RaceRoom {
    state: RaceState,
    broadcaster: Broadcaster,
    rx: mpsc::Receiver<RoomCommand>,
    ctx: RoomContext,
    go_live_at: Option<Instant>,
    /// Watchdog: a countdown still pending at this point is forced live
    countdown_ceiling_at: Option<Instant>,
    time_limit_at: Option<Instant>,
    /// Set while no socket is bound
    idle_since: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl RaceRoom {
    fn new(state: RaceState, ctx: RoomContext) -> (Self, RoomHandle) {
        let (tx, rx) = mpsc::channel(ctx.settings.queue_capacity.max(1));
        let handle = RoomHandle {
            race_id: state.race_id().clone(),
            tx,
        };
        let room = RaceRoom {
            state,
            broadcaster: Broadcaster::new(),
            rx,
            ctx,
            go_live_at: None,
            countdown_ceiling_at: None,
            time_limit_at: None,
            idle_since: Some(Instant::now()),
        };
        (room, handle)
    }

    async fn run(mut self) {
        tracing::info!(race_id = %self.state.race_id(), "Race room opened");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.dispatch(cmd) == Flow::Stop {
                        break;
                    }
                }
                _ = sleep_until_opt(self.go_live_at) => {
                    self.go_live("start time reached");
                }
                _ = sleep_until_opt(self.countdown_ceiling_at) => {
                    tracing::warn!(race_id = %self.state.race_id(), "Countdown overran its ceiling, forcing race live");
                    self.go_live("countdown ceiling");
                }
                _ = sleep_until_opt(self.time_limit_at) => {
                    self.end_race("time limit reached");
                }
            }
        }

        tracing::info!(race_id = %self.state.race_id(), status = %self.state.status(), "Race room closed");
    }

    /// One command, isolated: a panic while handling it is logged and the
    /// room keeps serving everyone else.
    fn dispatch(&mut self, cmd: RoomCommand) -> Flow {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.handle(cmd))) {
            Ok(flow) => flow,
            Err(panic) => {
                tracing::error!(
                    race_id = %self.state.race_id(),
                    "Room command panicked: {}",
                    panic_message(panic.as_ref())
                );
                Flow::Continue
            }
        }
    }

    fn handle(&mut self, cmd: RoomCommand) -> Flow {
        if self.state.countdown_elapsed(Utc::now()) {
            self.go_live("start time passed");
        }

        match cmd {
            RoomCommand::Subscribe {
                conn_id,
                identity,
                requested,
                tx,
                reply,
            } => {
                let _ = reply.send(self.subscribe(conn_id, identity, requested, tx));
            }
            RoomCommand::Unsubscribe { conn_id } => self.unsubscribe(&conn_id),
            RoomCommand::Progress {
                user_id,
                challenge_index,
                wpm,
                reply,
            } => {
                let result = self.state.apply_progress(&user_id, challenge_index, wpm);
                self.after_racer_update(&user_id, &result);
                let _ = reply.send(result);
            }
            RoomCommand::Finish {
                user_id,
                wpm,
                accuracy,
                reply,
            } => {
                let result = self
                    .state
                    .record_finish(&user_id, wpm, accuracy, Utc::now());
                if let Ok(outcome) = &result {
                    if outcome.race_finished {
                        self.on_race_finished();
                    }
                }
                self.after_racer_update(&user_id, &result);
                let _ = reply.send(result);
            }
            RoomCommand::StartCountdown {
                identity,
                duration_seconds,
                reply,
            } => {
                let _ = reply.send(self.start_countdown_for(&identity, duration_seconds));
            }
            RoomCommand::ForceEnd { identity, reply } => {
                let _ = reply.send(self.force_end_for(&identity));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Retire { reply } => {
                let retire = self.is_retirable();
                let _ = reply.send(retire);
                if retire {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    fn after_racer_update<T>(&mut self, user_id: &str, result: &RoomResult<T>) {
        match result {
            Ok(_) => self.publish(),
            Err(e) if e.is_silent() => {
                tracing::debug!(race_id = %self.state.race_id(), user_id, "Dropped update: {}", e);
            }
            Err(e) => {
                tracing::warn!(race_id = %self.state.race_id(), user_id, "Rejected update: {}", e);
            }
        }
    }

    fn subscribe(
        &mut self,
        conn_id: ConnectionId,
        identity: Identity,
        requested: Role,
        tx: mpsc::Sender<Frame>,
    ) -> RoomResult<Role> {
        let role = if requested == Role::Racer && self.state.is_racer(&identity.user_id) {
            self.state.attach(&identity.user_id)?;
            Role::Racer
        } else {
            Role::Spectator
        };

        tracing::info!(
            race_id = %self.state.race_id(),
            conn_id = %conn_id,
            user_id = %identity.user_id,
            ?role,
            "Socket bound"
        );
        self.broadcaster
            .bind(conn_id, Subscriber::new(identity.user_id, role, tx));
        self.idle_since = None;

        if role == Role::Racer {
            self.maybe_auto_start();
        }
        self.publish();
        Ok(role)
    }

    fn unsubscribe(&mut self, conn_id: &ConnectionId) {
        if let Some(subscriber) = self.broadcaster.unbind(conn_id) {
            tracing::info!(race_id = %self.state.race_id(), conn_id = %conn_id, user_id = %subscriber.user_id, "Socket unbound");
            self.on_unbound(subscriber);
            self.publish();
        }
    }

    fn on_unbound(&mut self, subscriber: Subscriber) {
        if subscriber.role == Role::Racer {
            self.state.detach(&subscriber.user_id);
        }
        if self.broadcaster.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn maybe_auto_start(&mut self) {
        if self.state.status() != RaceStatus::Waiting {
            return;
        }
        if let Some(seconds) = self.ctx.policy.auto_start(&self.state.lobby_view()) {
            let seconds = seconds.clamp(1, self.ctx.settings.max_countdown_seconds);
            tracing::info!(race_id = %self.state.race_id(), seconds, "Start policy triggered countdown");
            if let Err(e) = self.begin_countdown(seconds) {
                tracing::warn!(race_id = %self.state.race_id(), "Auto start failed: {}", e);
            }
        }
    }

    fn start_countdown_for(&mut self, identity: &Identity, duration_seconds: u32) -> RoomResult<()> {
        if !self.state.may_command(&identity.user_id, identity.admin) {
            return Err(RaceError::Forbidden("start the countdown"));
        }
        let max = self.ctx.settings.max_countdown_seconds;
        if duration_seconds == 0 || duration_seconds > max {
            return Err(RaceError::invalid_input(
                "durationSeconds",
                format!("must be between 1 and {}", max),
            ));
        }
        self.begin_countdown(duration_seconds)?;
        self.publish();
        Ok(())
    }

    fn begin_countdown(&mut self, duration_seconds: u32) -> RoomResult<()> {
        self.state.start_countdown(duration_seconds, Utc::now())?;
        let go_live_at = Instant::now() + Duration::from_secs(u64::from(duration_seconds));
        self.go_live_at = Some(go_live_at);
        self.countdown_ceiling_at = Some(go_live_at + self.ctx.settings.countdown_ceiling);
        Ok(())
    }

    fn go_live(&mut self, reason: &str) {
        self.go_live_at = None;
        self.countdown_ceiling_at = None;
        if self.state.begin().is_err() {
            return;
        }
        tracing::info!(race_id = %self.state.race_id(), reason, "Race is live");
        if let Some(limit) = self.state.info().time_limit_seconds {
            self.time_limit_at = Some(Instant::now() + Duration::from_secs(u64::from(limit)));
        }
        self.publish();
    }

    fn force_end_for(&mut self, identity: &Identity) -> RoomResult<()> {
        if !self.state.may_command(&identity.user_id, identity.admin) {
            return Err(RaceError::Forbidden("end the race"));
        }
        self.state.force_end(Utc::now())?;
        tracing::info!(race_id = %self.state.race_id(), user_id = %identity.user_id, "Race force-ended");
        self.on_race_finished();
        self.publish();
        Ok(())
    }

    fn end_race(&mut self, reason: &str) {
        self.time_limit_at = None;
        if self.state.force_end(Utc::now()).is_ok() {
            tracing::info!(race_id = %self.state.race_id(), reason, "Race ended");
            self.on_race_finished();
            self.publish();
        }
    }

    /// Hand final standings to the store without blocking the room
    fn on_race_finished(&mut self) {
        self.time_limit_at = None;
        let Some(result) = self.state.result() else {
            return;
        };
        let store = self.ctx.store.clone();
        tokio::spawn(async move {
            let race_id = result.race_id.clone();
            if let Err(e) = store.save_result(result).await {
                tracing::error!(race_id = %race_id, "Failed to save race result: {}", e);
            }
        });
    }

    fn snapshot(&self) -> RaceStateSnapshot {
        self.state
            .snapshot(self.broadcaster.spectator_count(), Utc::now())
    }

    /// Send the current snapshot to every bound socket. Evicting a slow
    /// socket changes the state (connection flags, spectator count), so
    /// repeat until a round goes out cleanly.
    fn publish(&mut self) {
        loop {
            let Some(frame) = encode(&ServerMessage::RaceState(self.snapshot())) else {
                return;
            };
            let evicted = self.broadcaster.broadcast(&frame);
            if evicted.is_empty() {
                return;
            }
            for e in evicted {
                self.on_unbound(e.subscriber);
            }
        }
    }

    fn is_retirable(&self) -> bool {
        if !self.broadcaster.is_empty() {
            return false;
        }
        self.state.status() == RaceStatus::Finished
            || self
                .idle_since
                .is_some_and(|since| since.elapsed() >= self.ctx.settings.idle_grace)
    }
}
