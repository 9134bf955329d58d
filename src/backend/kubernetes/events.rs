//! Pod Event Manager: one shared pod watch, demultiplexed by pod name.
//!
//! A single dispatch task drains [`ClusterClient::watch_pods`] and invokes the
//! callbacks registered for the pod each event is about. Callbacks run on the
//! dispatch task, one after another, so they must not block; the wait helpers
//! in the engine hand events over with a non-blocking `try_send`.
//!
//! The dispatch task caches the latest snapshot of every pod it has seen. A
//! new subscriber is handed the cached snapshot once, unless a live event for
//! its pod reaches it first, and every resync period the cached snapshots of
//! subscribed pods are delivered again. A waiter that subscribes after the pod
//! already changed still observes its state.
//!
//! When the watch relists, snapshots of pods missing from the new listing are
//! evicted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::client::{ClusterClient, PodEventKind, PodEventStream};

/// Interval at which cached snapshots are re-delivered to subscribers.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(5);

/// Callback invoked for every change of a subscribed pod.
///
/// The argument is `None` when the event payload could not be decoded.
pub type PodCallback = Arc<dyn Fn(Option<&Pod>) + Send + Sync>;

/// Errors raised by the event manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// `start` was called on a running manager.
    #[error("pod event manager already started")]
    AlreadyStarted,
    /// An operation requires a started manager.
    #[error("pod event manager not started")]
    NotStarted,
    /// The manager has been stopped.
    #[error("pod event manager stopped")]
    Stopped,
    /// The handle does not name a live subscription.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

/// Opaque registration handle returned by [`PodEventManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Numeric id, for logging.
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_pod: HashMap<String, Vec<(u64, PodCallback)>>,
    owners: HashMap<u64, String>,
    /// Subscriptions still owed the cached snapshot.
    awaiting_replay: HashSet<u64>,
}

impl Registry {
    /// Callbacks of `pod`. Their pending replays are settled by this delivery.
    fn deliveries_for(&mut self, pod: &str) -> Vec<PodCallback> {
        let Some(entries) = self.by_pod.get(pod) else {
            return Vec::new();
        };
        for (id, _) in entries {
            self.awaiting_replay.remove(id);
        }
        entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    fn claim_replay(&mut self, id: u64) -> Option<PodCallback> {
        if !self.awaiting_replay.remove(&id) {
            return None;
        }
        let pod = self.owners.get(&id)?;
        self.by_pod
            .get(pod)?
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, cb)| Arc::clone(cb))
    }
}

enum Control {
    Replay { id: u64, pod: String },
}

enum Lifecycle {
    Idle,
    Running {
        control: mpsc::UnboundedSender<Control>,
    },
    Stopped,
}

/// Shared pod watch with per-pod subscriptions.
pub struct PodEventManager {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    resync: Duration,
    registry: Arc<Mutex<Registry>>,
    lifecycle: Mutex<Lifecycle>,
    stop: CancellationToken,
}

impl PodEventManager {
    /// Manager for pods in `namespace`, with the default resync period.
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self::with_resync(client, namespace, DEFAULT_RESYNC)
    }

    /// Manager with an explicit resync period.
    pub fn with_resync(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        resync: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            resync,
            registry: Arc::new(Mutex::new(Registry::default())),
            lifecycle: Mutex::new(Lifecycle::Idle),
            stop: CancellationToken::new(),
        }
    }

    /// Open the shared watch and spawn the dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<(), EventError> {
        let mut lifecycle = lock(&self.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(EventError::AlreadyStarted);
        }

        let events = self.client.watch_pods(&self.namespace);
        let (control, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch(
            events,
            control_rx,
            Arc::clone(&self.registry),
            self.resync,
            self.stop.clone(),
        ));
        debug!(namespace = %self.namespace, "pod event manager started");

        *lifecycle = Lifecycle::Running { control };
        Ok(())
    }

    /// Register `callback` for changes of the pod named `pod`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] before [`start`](Self::start) and
    /// [`EventError::Stopped`] after [`stop`](Self::stop).
    pub fn subscribe(
        &self,
        pod: &str,
        callback: PodCallback,
    ) -> Result<SubscriptionHandle, EventError> {
        let lifecycle = lock(&self.lifecycle);
        let control = match &*lifecycle {
            Lifecycle::Idle => return Err(EventError::NotStarted),
            Lifecycle::Stopped => return Err(EventError::Stopped),
            Lifecycle::Running { control, .. } => control,
        };

        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id = registry.next_id.saturating_add(1);
            registry
                .by_pod
                .entry(pod.to_owned())
                .or_default()
                .push((id, callback));
            registry.owners.insert(id, pod.to_owned());
            registry.awaiting_replay.insert(id);
            id
        };

        // The dispatch task may already be gone; the subscription is still
        // valid and can be released normally.
        let _ = control.send(Control::Replay {
            id,
            pod: pod.to_owned(),
        });
        Ok(SubscriptionHandle(id))
    }

    /// Register `callback` and release the subscription when the guard drops.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn subscribe_guarded(
        &self,
        pod: &str,
        callback: PodCallback,
    ) -> Result<SubscriptionGuard<'_>, EventError> {
        let handle = self.subscribe(pod, callback)?;
        Ok(SubscriptionGuard {
            manager: self,
            handle,
        })
    }

    /// Release a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownSubscription`] if the handle was never
    /// issued or has already been released.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), EventError> {
        let mut registry = lock(&self.registry);
        let pod = registry
            .owners
            .remove(&handle.0)
            .ok_or(EventError::UnknownSubscription(handle.0))?;
        registry.awaiting_replay.remove(&handle.0);

        if let Some(entries) = registry.by_pod.get_mut(&pod) {
            entries.retain(|(id, _)| *id != handle.0);
            if entries.is_empty() {
                registry.by_pod.remove(&pod);
            }
        }
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.registry).owners.len()
    }

    /// Terminate the shared watch. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] before [`start`](Self::start).
    pub fn stop(&self) -> Result<(), EventError> {
        let mut lifecycle = lock(&self.lifecycle);
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                Err(EventError::NotStarted)
            }
            Lifecycle::Running { .. } => {
                self.stop.cancel();
                debug!(namespace = %self.namespace, "pod event manager stopped");
                Ok(())
            }
            Lifecycle::Stopped => Ok(()),
        }
    }

    /// Resolves once [`stop`](Self::stop) has terminated the watch.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}

/// Releases its subscription on drop.
pub struct SubscriptionGuard<'a> {
    manager: &'a PodEventManager,
    handle: SubscriptionHandle,
}

impl SubscriptionGuard<'_> {
    /// Handle of the guarded subscription.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unsubscribe(self.handle) {
            warn!(subscription = self.handle.0, error = %e, "failed to release pod subscription");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invoke(callbacks: &[PodCallback], pod: Option<&Pod>) {
    for callback in callbacks {
        callback(pod);
    }
}

async fn dispatch(
    mut events: PodEventStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    registry: Arc<Mutex<Registry>>,
    resync: Duration,
    stop: CancellationToken,
) {
    let mut cache: HashMap<String, Pod> = HashMap::new();
    // Names listed since the watch began relisting.
    let mut relisted: Option<HashSet<String>> = None;
    let mut ticker = tokio::time::interval(resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut watching = true;

    loop {
        // Replays queued by subscribe are served before later watch events.
        tokio::select! {
            biased;

            () = stop.cancelled() => break,

            Some(command) = control.recv() => match command {
                Control::Replay { id, pod } => {
                    let callback = lock(&registry).claim_replay(id);
                    if let (Some(callback), Some(snapshot)) = (callback, cache.get(&pod)) {
                        callback(Some(snapshot));
                    }
                }
            },

            event = events.next(), if watching => match event {
                Some(Ok(event)) => match event.kind {
                    PodEventKind::Relisting => {
                        relisted = Some(HashSet::new());
                    }
                    PodEventKind::Relisted => {
                        if let Some(present) = relisted.take() {
                            let before = cache.len();
                            cache.retain(|name, _| present.contains(name));
                            let evicted = before.saturating_sub(cache.len());
                            if evicted > 0 {
                                debug!(evicted, "dropped snapshots of pods gone after relist");
                            }
                        }
                    }
                    PodEventKind::Applied | PodEventKind::Deleted => {
                        if event.kind == PodEventKind::Deleted {
                            cache.remove(&event.name);
                        } else {
                            if let Some(present) = relisted.as_mut() {
                                present.insert(event.name.clone());
                            }
                            if let Some(pod) = &event.pod {
                                cache.insert(event.name.clone(), pod.clone());
                            }
                        }
                        let callbacks = lock(&registry).deliveries_for(&event.name);
                        invoke(&callbacks, event.pod.as_ref());
                    }
                },
                Some(Err(e)) => {
                    error!(error = %e, "pod watch error");
                }
                None => {
                    warn!("pod watch stream ended");
                    watching = false;
                }
            },

            _ = ticker.tick() => {
                let subscribed: Vec<(String, Vec<PodCallback>)> = {
                    let mut registry = lock(&registry);
                    let pods: Vec<String> = registry
                        .by_pod
                        .keys()
                        .filter(|pod| cache.contains_key(*pod))
                        .cloned()
                        .collect();
                    pods.into_iter()
                        .map(|pod| {
                            let callbacks = registry.deliveries_for(&pod);
                            (pod, callbacks)
                        })
                        .collect()
                };
                for (pod, callbacks) in subscribed {
                    if let Some(snapshot) = cache.get(&pod) {
                        invoke(&callbacks, Some(snapshot));
                    }
                }
            }
        }
    }
}
