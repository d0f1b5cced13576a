//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors (the only cross-thread entry)
//! - `Supervisor` for spawning, tracking and stopping actors

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop, whether it asked to stop or
    /// was cancelled.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Message counter.
    pub messages_processed: u64,

    /// True once the loop ended because of a shutdown signal rather than a
    /// request from the actor itself.
    pub cancelled: bool,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
            cancelled: false,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::Sender<M>,

    /// Actor ID for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Returns true once the actor's mailbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

/// Receiving side of a mailbox, handed to [`Supervisor::spawn_with_mailbox`].
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    actor_id: String,
}

/// Create a mailbox before the actor exists, so the actor can be built with
/// a handle to itself.
pub fn mailbox<M: Message>(name: &str, size: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let actor_id = format!("{}_{}", name, generate_actor_id());
    let (tx, rx) = mpsc::channel(size);
    (
        ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        },
        Mailbox { rx, actor_id },
    )
}

/// Type-erased actor reference for supervision.
struct ActorRef {
    /// Task handle.
    task_handle: tokio::task::JoinHandle<()>,

    /// Shutdown sender.
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Supervisor for managing actor lifecycles.
pub struct Supervisor {
    /// Supervised actors.
    children: HashMap<String, ActorRef>,

    /// Global shutdown signal, observed by every child.
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Spawn and supervise an actor on a mailbox created with [`mailbox`].
    pub fn spawn_with_mailbox<A>(&mut self, actor: A, mailbox: Mailbox<A::Message>) -> String
    where
        A: Actor,
    {
        let Mailbox { rx, actor_id } = mailbox;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor_type = actor.name().to_string();
        let task_handle = tokio::spawn(run_actor_loop(
            actor,
            rx,
            shutdown_rx,
            self.shutdown.clone(),
            actor_id.clone(),
        ));

        self.children.insert(
            actor_id.clone(),
            ActorRef {
                task_handle,
                shutdown_tx,
            },
        );

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");
        actor_id
    }

    /// Signal one actor to stop and forget it.
    pub fn stop(&mut self, actor_id: &str) -> bool {
        match self.children.remove(actor_id) {
            Some(child) => {
                child.stop();
                true
            }
            None => false,
        }
    }

    /// Forget actors whose task has finished.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain(|_, child| child.is_running());
        before - self.children.len()
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        // Wait for all to finish with timeout
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Force abort any remaining
        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
///
/// Messages are handled strictly one at a time in mailbox order. Shutdown is
/// cooperative: it is only observed between messages.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    mut global_shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    ctx.cancelled = true;
                    break;
                }
            }

            changed = global_shutdown.changed() => {
                if changed.is_err() || *global_shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received global shutdown signal");
                    ctx.cancelled = true;
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;

                        match actor.handle(msg, &mut ctx).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(actor_id = %actor_id, "Actor requested stop");
                                break;
                            }
                            Err(e) => {
                                error!(actor_id = %actor_id, error = %e, "Actor failed");
                                break;
                            }
                        }
                    }
                    None => {
                        debug!(actor_id = %actor_id, "Actor mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
