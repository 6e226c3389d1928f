//! Event-driven sync loop.
//!
//! Timer ticks, reconnect notifications and manual requests all post to one
//! channel. Triggers that pile up while a cycle runs are drained together and
//! served by a single cycle.

use crate::coordinator::{OutcomeKind, SyncCoordinator};
use crate::transport::SyncTransport;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

const TRIGGER_CAPACITY: usize = 16;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The periodic timer fired.
    Timer,
    /// Connectivity came back.
    Reconnect,
    /// The application asked for a sync.
    Manual,
}

#[derive(Debug)]
enum Command {
    Run(Trigger),
    Shutdown,
}

/// Posts triggers to a running sync loop.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Command>,
}

impl TriggerHandle {
    /// Requests a cycle. Returns false once the loop has stopped.
    ///
    /// A full channel already guarantees a pending cycle, so the trigger is
    /// folded into it.
    pub fn post(&self, trigger: Trigger) -> bool {
        match self.tx.try_send(Command::Run(trigger)) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Requests a manual cycle.
    pub fn sync_now(&self) -> bool {
        self.post(Trigger::Manual)
    }

    /// Reports that the network is reachable again.
    pub fn reconnected(&self) -> bool {
        self.post(Trigger::Reconnect)
    }
}

/// Reported after each cycle the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEvent {
    /// Trigger that started the cycle.
    pub trigger: Trigger,
    /// How the cycle ended.
    pub outcome: OutcomeKind,
    /// Number of cycles this loop has run, this one included.
    pub cycle: u64,
}

/// A spawned sync loop.
pub struct SyncLoop {
    handle: TriggerHandle,
    events: watch::Receiver<Option<LoopEvent>>,
    task: JoinHandle<()>,
}

impl SyncLoop {
    /// Returns a handle for posting triggers.
    pub fn handle(&self) -> TriggerHandle {
        self.handle.clone()
    }

    /// Subscribes to cycle reports.
    pub fn events(&self) -> watch::Receiver<Option<LoopEvent>> {
        self.events.clone()
    }

    /// Stops the loop after the running cycle, if any, finishes.
    pub async fn shutdown(self) {
        if self.handle.tx.send(Command::Shutdown).await.is_err() {
            debug!("sync loop already stopped");
        }
        if let Err(e) = self.task.await {
            debug!(error = %e, "sync loop task ended abnormally");
        }
    }
}

/// Spawns a loop that runs a cycle for every trigger burst.
///
/// With a configured `sync_interval` the loop also posts [`Trigger::Timer`]
/// on that period. Must be called inside a tokio runtime.
pub fn spawn_sync_loop<T>(coordinator: Arc<SyncCoordinator<T>>) -> SyncLoop
where
    T: SyncTransport + 'static,
{
    let (tx, mut rx) = mpsc::channel(TRIGGER_CAPACITY);
    let (event_tx, events) = watch::channel(None);

    let mut ticker = coordinator.config().sync_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    let task = tokio::spawn(async move {
        let mut cycles = 0u64;
        loop {
            let trigger = tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Run(trigger)) => trigger,
                    Some(Command::Shutdown) | None => break,
                },
                () = tick(&mut ticker) => Trigger::Timer,
            };

            let mut coalesced = 0usize;
            let mut shutdown = false;
            while let Ok(command) = rx.try_recv() {
                match command {
                    Command::Run(_) => coalesced += 1,
                    Command::Shutdown => shutdown = true,
                }
            }
            if shutdown {
                break;
            }

            debug!(?trigger, coalesced, "sync triggered");
            let outcome = coordinator.run_cycle().await;
            cycles += 1;
            event_tx.send_replace(Some(LoopEvent {
                trigger,
                outcome: outcome.kind(),
                cycle: cycles,
            }));
        }
        debug!(cycles, "sync loop stopped");
    });

    SyncLoop {
        handle: TriggerHandle { tx },
        events,
        task,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
