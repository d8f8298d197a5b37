//! Simulated recovery channel
//!
//! Every donor follows a [`DonorScript`] that decides what its channel
//! threads do once started. Thread events are delivered from a spawned task
//! after a configurable delay, the way real channel threads report back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::lock;
use crate::channel::{
    ChannelObserver, ChannelThreadId, Endpoint, ReplicationChannel, TransportOptions, UntilCondition,
};
use crate::error::{Error, Result};
use crate::position::PositionSet;

/// Behaviour of a donor once the channel threads start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonorScript {
    /// Refuse to start the channel threads
    Refuse,
    /// Stream everything and stop at the until condition
    Complete,
    /// The receiver thread stops early
    DropReceiver,
    /// The applier thread stops on an error
    FailApplier,
    /// Threads keep running without reaching the until condition
    Stall,
}

type ConnectionHook = Box<dyn FnOnce(Uuid) + Send>;
type ViewChangeHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Threads {
    endpoint: Option<Endpoint>,
    receiver: Option<ChannelThreadId>,
    applier: Option<ChannelThreadId>,
    receiver_running: bool,
    applier_running: bool,
    task: Option<JoinHandle<()>>,
}

struct ChannelState {
    default_script: DonorScript,
    delay: Duration,
    scripts: Mutex<HashMap<Uuid, DonorScript>>,
    threads: Mutex<Threads>,
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
    applied: Mutex<PositionSet>,
    attempts: Mutex<Vec<Uuid>>,
    first_connection: Mutex<Option<ConnectionHook>>,
    view_change: Mutex<Option<ViewChangeHook>>,
    purges: AtomicUsize,
    next_thread: AtomicU64,
}

impl ChannelState {
    fn observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        lock(&self.observer).clone()
    }

    fn script_for(&self, donor: &Uuid) -> DonorScript {
        lock(&self.scripts).get(donor).copied().unwrap_or(self.default_script)
    }

    fn stop_receiver(&self) -> Option<ChannelThreadId> {
        let mut threads = lock(&self.threads);
        threads.receiver_running = false;
        threads.receiver
    }

    fn stop_applier(&self) -> Option<ChannelThreadId> {
        let mut threads = lock(&self.threads);
        threads.applier_running = false;
        threads.applier
    }

    /// Body of the channel threads
    async fn run_script(self: Arc<Self>, script: DonorScript, until: UntilCondition) {
        tokio::time::sleep(self.delay).await;

        match script {
            DonorScript::Complete => match until {
                UntilCondition::Positions(target) => {
                    lock(&self.applied).union(&target);
                    if let Some(thread) = self.stop_applier() {
                        if let Some(observer) = self.observer() {
                            observer.on_applier_stop(thread, false);
                        }
                    }
                }
                UntilCondition::ViewChange { view_id } => {
                    tracing::debug!("Simulated channel applied view change {}", view_id);
                    if let Some(hook) = lock(&self.view_change).as_ref() {
                        hook();
                    }
                }
            },
            DonorScript::DropReceiver => {
                if let Some(thread) = self.stop_receiver() {
                    if let Some(observer) = self.observer() {
                        observer.on_receiver_stop(thread);
                    }
                }
            }
            DonorScript::FailApplier => {
                if let Some(thread) = self.stop_applier() {
                    if let Some(observer) = self.observer() {
                        observer.on_applier_stop(thread, true);
                    }
                }
            }
            DonorScript::Stall | DonorScript::Refuse => {}
        }
    }
}

/// Scripted replication channel
pub struct SimChannel {
    state: Arc<ChannelState>,
}

impl SimChannel {
    /// Create a channel where every donor follows `default_script`, with
    /// thread events delivered `delay` after the threads start
    pub fn new(default_script: DonorScript, delay: Duration) -> Self {
        Self {
            state: Arc::new(ChannelState {
                default_script,
                delay,
                scripts: Mutex::new(HashMap::new()),
                threads: Mutex::new(Threads::default()),
                observer: Mutex::new(None),
                applied: Mutex::new(PositionSet::new()),
                attempts: Mutex::new(Vec::new()),
                first_connection: Mutex::new(None),
                view_change: Mutex::new(None),
                purges: AtomicUsize::new(0),
                next_thread: AtomicU64::new(1),
            }),
        }
    }

    /// Override the script of one donor
    pub fn set_script(&self, donor: Uuid, script: DonorScript) {
        lock(&self.state.scripts).insert(donor, script);
    }

    /// Run `hook` with the donor uuid on the first connection attempt
    pub fn on_first_connection(&self, hook: impl FnOnce(Uuid) + Send + 'static) {
        *lock(&self.state.first_connection) = Some(Box::new(hook));
    }

    /// Run `hook` whenever a donor following [`DonorScript::Complete`]
    /// applies the target view change
    pub fn set_view_change_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *lock(&self.state.view_change) = Some(hook);
    }

    /// Donors the channel was pointed at, in order
    pub fn connection_attempts(&self) -> Vec<Uuid> {
        lock(&self.state.attempts).clone()
    }

    /// Number of relay log purges
    pub fn purge_count(&self) -> usize {
        self.state.purges.load(Ordering::SeqCst)
    }

    /// Positions applied through the channel
    pub fn applied_positions(&self) -> PositionSet {
        lock(&self.state.applied).clone()
    }

    fn next_thread_id(&self) -> ChannelThreadId {
        ChannelThreadId(self.state.next_thread.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl ReplicationChannel for SimChannel {
    async fn initialize(&self, endpoint: &Endpoint, options: &TransportOptions) -> Result<()> {
        tracing::debug!(
            "Simulated channel pointed at {} (tls: {}, compression: {:?})",
            endpoint,
            options.ssl.is_some(),
            options.compression_algorithms
        );
        lock(&self.state.attempts).push(endpoint.donor);
        lock(&self.state.threads).endpoint = Some(endpoint.clone());

        let hook = lock(&self.state.first_connection).take();
        if let Some(hook) = hook {
            hook(endpoint.donor);
        }
        Ok(())
    }

    async fn start_threads(&self, until: &UntilCondition) -> Result<()> {
        let donor = lock(&self.state.threads)
            .endpoint
            .as_ref()
            .map(|e| e.donor)
            .ok_or_else(|| Error::Channel("channel was not initialized".into()))?;

        let script = self.state.script_for(&donor);
        if script == DonorScript::Refuse {
            return Err(Error::Channel(format!("donor {} refused the connection", donor)));
        }

        let receiver = self.next_thread_id();
        let applier = self.next_thread_id();
        let task = tokio::spawn(Arc::clone(&self.state).run_script(script, until.clone()));

        {
            let mut threads = lock(&self.state.threads);
            threads.receiver = Some(receiver);
            threads.applier = Some(applier);
            threads.receiver_running = true;
            threads.applier_running = true;
            if let Some(previous) = threads.task.replace(task) {
                previous.abort();
            }
        }

        if let Some(observer) = self.state.observer() {
            observer.on_thread_start(receiver);
            observer.on_thread_start(applier);
        }
        Ok(())
    }

    async fn stop_threads(&self) -> Result<()> {
        let (task, receiver, applier) = {
            let mut threads = lock(&self.state.threads);
            let receiver = threads.receiver_running.then_some(threads.receiver).flatten();
            let applier = threads.applier_running.then_some(threads.applier).flatten();
            threads.receiver_running = false;
            threads.applier_running = false;
            (threads.task.take(), receiver, applier)
        };

        if let Some(task) = task {
            task.abort();
        }

        if let Some(observer) = self.state.observer() {
            if let Some(thread) = receiver {
                observer.on_receiver_stop(thread);
            }
            if let Some(thread) = applier {
                observer.on_applier_stop(thread, false);
            }
        }
        Ok(())
    }

    async fn purge_logs(&self) -> Result<()> {
        self.state.purges.fetch_add(1, Ordering::SeqCst);
        if let Some(observer) = self.state.observer() {
            observer.on_reset();
        }
        Ok(())
    }

    fn is_receiver_running(&self) -> bool {
        lock(&self.state.threads).receiver_running
    }

    fn is_applier_running(&self) -> bool {
        lock(&self.state.threads).applier_running
    }

    fn owns_thread(&self, thread: ChannelThreadId) -> bool {
        let threads = lock(&self.state.threads);
        threads.receiver == Some(thread) || threads.applier == Some(thread)
    }

    fn applied_positions_cover(&self, target: &PositionSet) -> bool {
        lock(&self.state.applied).is_superset_of(target)
    }

    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *lock(&self.state.observer) = Some(observer);
    }

    fn unregister_observer(&self) {
        lock(&self.state.observer).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        receiver_stops: AtomicUsize,
        applier_stops: Mutex<Vec<bool>>,
    }

    impl ChannelObserver for Recorder {
        fn on_thread_start(&self, _thread: ChannelThreadId) {}

        fn on_receiver_stop(&self, _thread: ChannelThreadId) {
            self.receiver_stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on_applier_stop(&self, _thread: ChannelThreadId, aborted: bool) {
            lock(&self.applier_stops).push(aborted);
        }

        fn on_reset(&self) {}
    }

    fn endpoint(n: u128) -> Endpoint {
        Endpoint {
            donor: Uuid::from_u128(n),
            host: format!("donor-{}", n),
            port: 3306,
        }
    }

    fn target() -> UntilCondition {
        let mut set = PositionSet::new();
        set.add_interval(Uuid::from_u128(50), 1, 20);
        UntilCondition::Positions(set)
    }

    #[tokio::test]
    async fn test_complete_applies_target() {
        let channel = SimChannel::new(DonorScript::Complete, Duration::from_millis(5));
        let recorder = Arc::new(Recorder::default());
        channel.register_observer(recorder.clone());

        channel.initialize(&endpoint(2), &TransportOptions::default()).await.unwrap();
        channel.start_threads(&target()).await.unwrap();
        assert!(channel.is_receiver_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*lock(&recorder.applier_stops), vec![false]);
        assert!(!channel.is_applier_running());
        assert!(channel.applied_positions_cover(target().positions().unwrap()));
    }

    #[tokio::test]
    async fn test_refusing_donor() {
        let channel = SimChannel::new(DonorScript::Complete, Duration::from_millis(5));
        channel.set_script(Uuid::from_u128(3), DonorScript::Refuse);

        channel.initialize(&endpoint(3), &TransportOptions::default()).await.unwrap();
        assert!(matches!(channel.start_threads(&target()).await, Err(Error::Channel(_))));
        assert!(!channel.is_receiver_running());
        assert_eq!(channel.connection_attempts(), vec![Uuid::from_u128(3)]);
    }

    #[tokio::test]
    async fn test_thread_ownership_survives_stop() {
        let channel = SimChannel::new(DonorScript::Stall, Duration::from_millis(5));
        let recorder = Arc::new(Recorder::default());
        channel.register_observer(recorder.clone());

        channel.initialize(&endpoint(2), &TransportOptions::default()).await.unwrap();
        channel.start_threads(&target()).await.unwrap();
        channel.stop_threads().await.unwrap();

        assert_eq!(recorder.receiver_stops.load(Ordering::SeqCst), 1);
        assert!(channel.owns_thread(ChannelThreadId(1)));
        assert!(channel.owns_thread(ChannelThreadId(2)));
        assert!(!channel.owns_thread(ChannelThreadId(3)));
    }

    #[tokio::test]
    async fn test_view_change_hook() {
        let channel = SimChannel::new(DonorScript::Complete, Duration::from_millis(5));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        channel.set_view_change_hook(Box::new(move || flag.store(true, Ordering::SeqCst)));

        channel.initialize(&endpoint(2), &TransportOptions::default()).await.unwrap();
        channel
            .start_threads(&UntilCondition::ViewChange { view_id: "1:2".into() })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
