//! Recovery Module
//!
//! Coordinates the distributed recovery of a member joining the group:
//! suspend the group applier, decide whether a state transfer is needed,
//! wait for recovery metadata when the session completes on a position set,
//! transfer the missing data from a donor, resume the applier, wait for its
//! backlog to drain and finally announce the member as ONLINE.
//!
//! One background task runs per session. Callers talk to it only through
//! the session signals, the metadata waiter and the state transfer.

mod donor;
mod metadata;
mod signals;
mod transfer;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::applier::{ApplierControl, ApplierStatus, SuspendOutcome};
use crate::certifier::CertificationSink;
use crate::channel::{ChannelThreadId, ReplicationChannel, UntilCondition};
use crate::config::{CompletionPolicy, RecoveryConfig};
use crate::error::{Error, Result};
use crate::group::{GroupMembership, GroupMessage, GroupMessenger, MemberVersion};

pub use donor::DonorSelector;
pub use metadata::{RecoveryMetadata, RecoveryMetadataWaiter};
pub use signals::{SessionEvent, SessionSignals};
pub use transfer::{StateTransfer, TransferState};

/// Interval at which a pending stop re-signals the recovery task
const STOP_RESIGNAL_INTERVAL: Duration = Duration::from_secs(1);

/// Longest single wait for the applier to execute its backlog
const EXECUTION_WAIT_SLICE: Duration = Duration::from_secs(1);

/// State of the recovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    Created,
    Starting,
    SuspendingApplier,
    AloneInGroup,
    AwaitingMetadata,
    Transferring,
    ResumingApplier,
    WaitingApplierDrain,
    AnnouncingOnline,
    Done,
    Aborted,
    FatalError,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::Created => "CREATED",
            RecoveryState::Starting => "STARTING",
            RecoveryState::SuspendingApplier => "SUSPENDING_APPLIER",
            RecoveryState::AloneInGroup => "ALONE_IN_GROUP",
            RecoveryState::AwaitingMetadata => "AWAITING_METADATA",
            RecoveryState::Transferring => "TRANSFERRING",
            RecoveryState::ResumingApplier => "RESUMING_APPLIER",
            RecoveryState::WaitingApplierDrain => "WAITING_APPLIER_DRAIN",
            RecoveryState::AnnouncingOnline => "ANNOUNCING_ONLINE",
            RecoveryState::Done => "DONE",
            RecoveryState::Aborted => "ABORTED",
            RecoveryState::FatalError => "FATAL_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// How a session decides the joiner has caught up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCondition {
    /// Transfer ends when the view change `view_id` is applied
    View { view_id: String },
    /// Transfer ends when the watermark from recovery metadata is applied
    PositionSet { view_id: String },
}

impl CompletionCondition {
    /// View the session was started for
    pub fn view_id(&self) -> &str {
        match self {
            CompletionCondition::View { view_id } | CompletionCondition::PositionSet { view_id } => view_id,
        }
    }
}

/// Final outcome of a recovery session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The member is ONLINE
    Online,
    /// The caller stopped the session
    Stopped,
    /// The session ended without asking to leave the group
    Aborted { reason: String },
    /// The session failed and the member asked to leave the group
    Failed { reason: String },
}

/// Snapshot of the recovery module for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub state: RecoveryState,
    pub group: Option<String>,
    pub donor: Option<Uuid>,
    pub donor_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub outcome: Option<RecoveryOutcome>,
}

/// External collaborators used by recovery
#[derive(Clone)]
pub struct RecoveryServices {
    pub membership: Arc<dyn GroupMembership>,
    pub messenger: Arc<dyn GroupMessenger>,
    pub applier: Arc<dyn ApplierControl>,
    pub certifier: Arc<dyn CertificationSink>,
    pub channel: Arc<dyn ReplicationChannel>,
}

/// Why a session ended early
enum SessionFailure {
    /// End without leaving the group
    Aborted(String),
    /// End and leave the group
    Fatal(Error),
}

impl From<Error> for SessionFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::Aborted => SessionFailure::Aborted("recovery aborted".into()),
            other => SessionFailure::Fatal(other),
        }
    }
}

/// State of one recovery session
struct RecoverySession {
    group_name: String,
    condition: CompletionCondition,
    started_at: DateTime<Utc>,
    signals: SessionSignals,
    metadata: RecoveryMetadataWaiter,
    transfer: StateTransfer,
    stop_requested: AtomicBool,
    finished: AtomicBool,
}

impl RecoverySession {
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.signals.abort();
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }
}

struct Shared {
    config: Arc<RecoveryConfig>,
    local_uuid: Uuid,
    local_version: MemberVersion,
    services: RecoveryServices,
    session: Mutex<Option<Arc<RecoverySession>>>,
    state: watch::Sender<RecoveryState>,
    /// Outcome of the latest session, `None` while it runs
    outcome: watch::Sender<Option<RecoveryOutcome>>,
}

impl Shared {
    fn set_state(&self, state: RecoveryState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Recovery state: {} -> {}", previous, state);
        }
    }

    fn current_session(&self) -> Option<Arc<RecoverySession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn running_session(&self) -> Option<Arc<RecoverySession>> {
        self.current_session().filter(|s| s.is_running())
    }
}

/// Distributed recovery coordinator
pub struct RecoveryModule {
    shared: Arc<Shared>,
    task: tokio::sync::Mutex<Option<JoinHandle<RecoveryOutcome>>>,
}

impl RecoveryModule {
    /// Create a recovery module for the local member
    pub fn new(config: RecoveryConfig, services: RecoveryServices) -> Result<Self> {
        config.validate()?;
        let local_version = config.local_version()?;
        let local_uuid = config.member_uuid();
        let (state, _) = watch::channel(RecoveryState::Created);
        let (outcome, _) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                local_uuid,
                local_version,
                services,
                session: Mutex::new(None),
                state,
                outcome,
            }),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// Local member uuid
    pub fn member_uuid(&self) -> Uuid {
        self.shared.local_uuid
    }

    /// Current state of the state machine
    pub fn state(&self) -> RecoveryState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.shared.state.subscribe()
    }

    /// Check if a session is running
    pub fn is_running(&self) -> bool {
        self.shared.running_session().is_some()
    }

    /// Status snapshot
    pub fn status(&self) -> RecoveryStatus {
        let session = self.shared.current_session();
        RecoveryStatus {
            state: self.state(),
            group: session.as_ref().map(|s| s.group_name.clone()),
            donor: session.as_ref().and_then(|s| s.transfer.donor()),
            donor_attempts: session.as_ref().map(|s| s.transfer.attempts()).unwrap_or(0),
            started_at: session.as_ref().map(|s| s.started_at),
            outcome: self.shared.outcome.borrow().clone(),
        }
    }

    /// Start a recovery session in the background
    pub async fn start(&self, group_name: &str, condition: CompletionCondition) -> Result<()> {
        let mut task = self.task.lock().await;
        if self.shared.running_session().is_some() {
            return Err(Error::AlreadyRunning);
        }

        // The previous session is finished; its task only publishes the outcome
        if let Some(previous) = task.take() {
            if let Err(e) = previous.await {
                tracing::error!("Previous recovery task ended abnormally: {}", e);
            }
        }

        let signals = SessionSignals::new();
        let session = Arc::new(RecoverySession {
            group_name: group_name.to_string(),
            condition,
            started_at: Utc::now(),
            metadata: RecoveryMetadataWaiter::new(signals.cancel_token().clone()),
            transfer: StateTransfer::new(
                Arc::clone(&self.shared.config),
                self.shared.local_uuid,
                self.shared.local_version,
                Arc::clone(&self.shared.services.channel),
                Arc::clone(&self.shared.services.membership),
                signals.clone(),
            ),
            signals,
            stop_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        *self
            .shared
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&session));
        self.shared.outcome.send_replace(None);

        tracing::info!(
            "Starting distributed recovery of member {} in group {} ({:?})",
            self.shared.local_uuid,
            group_name,
            session.condition
        );

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(run_session(shared, session)));
        Ok(())
    }

    /// Stop the running session.
    ///
    /// With `wait_for_termination` the call blocks until the recovery task
    /// exits, re-signalling it periodically, and gives up with
    /// [`Error::StillRunning`] after the configured stop timeout.
    pub async fn stop(&self, wait_for_termination: bool) -> Result<()> {
        let session = self.shared.running_session();
        if let Some(session) = &session {
            tracing::info!("Stopping distributed recovery");
            session.request_stop();
        }
        self.shared.services.applier.interrupt_suspension_wait();

        if !wait_for_termination {
            return Ok(());
        }

        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };

        let timeout = self.shared.config.stop_timeout();
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::error!("Recovery task did not stop within {}ms", waited_ms);
                return Err(Error::StillRunning { waited_ms });
            }

            match tokio::time::timeout(remaining.min(STOP_RESIGNAL_INTERVAL), &mut *handle).await {
                Ok(joined) => {
                    if let Err(e) = joined {
                        tracing::error!("Recovery task ended abnormally: {}", e);
                        if let Some(session) = &session {
                            session.finished.store(true, Ordering::SeqCst);
                        }
                        self.shared.outcome.send_if_modified(|outcome| {
                            if outcome.is_some() {
                                return false;
                            }
                            *outcome = Some(RecoveryOutcome::Failed {
                                reason: format!("recovery task failed: {}", e),
                            });
                            true
                        });
                    }
                    task.take();
                    return Ok(());
                }
                Err(_) => {
                    if let Some(session) = &session {
                        session.request_stop();
                    }
                    self.shared.services.applier.interrupt_suspension_wait();
                }
            }
        }
    }

    /// Wait for the current session to end and return its outcome.
    ///
    /// The recovery task stays owned by the module, so `start` and `stop`
    /// keep seeing it while callers wait here.
    pub async fn wait_for_completion(&self) -> Result<RecoveryOutcome> {
        let mut rx = self.shared.outcome.subscribe();
        if rx.borrow().is_none() && self.shared.current_session().is_none() {
            return Err(Error::NotRunning);
        }

        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| Error::Internal("recovery module dropped".into()))?;
        outcome
            .clone()
            .ok_or_else(|| Error::Internal("recovery outcome missing".into()))
    }

    /// Hand the recovery metadata (or the reason it is missing) to the
    /// running session
    pub fn deliver_recovery_metadata(
        &self,
        delivery: std::result::Result<RecoveryMetadata, String>,
    ) -> Result<()> {
        let session = self.shared.running_session().ok_or(Error::NotRunning)?;
        session.metadata.deliver(delivery);
        Ok(())
    }

    /// Signal that the target view change was applied by the recovery channel
    pub fn finish_state_transfer(&self) {
        if let Some(session) = self.shared.running_session() {
            if session.signals.raise(SessionEvent::TransferFinished) {
                tracing::info!("State transfer reached its completion condition");
            }
        }
    }

    /// React to a group membership change
    pub async fn on_membership_changed(&self, members_left: bool, self_leaving: bool) {
        let Some(session) = self.shared.running_session() else {
            return;
        };

        if self_leaving {
            tracing::info!("Local member is leaving the group, stopping recovery");
            session.request_stop();
            self.shared.services.applier.interrupt_suspension_wait();
            return;
        }

        session.transfer.update_recovery_process(members_left).await;
    }

    /// Check if a thread belongs to the recovery channel
    pub fn is_own_channel_thread(&self, thread: ChannelThreadId) -> bool {
        self.shared.services.channel.owns_thread(thread)
    }

    /// Fail if any recovery channel thread is still running
    pub fn check_channel_threads_stopped(&self) -> Result<()> {
        let channel = &self.shared.services.channel;
        if channel.is_receiver_running() || channel.is_applier_running() {
            return Err(Error::ChannelThreadsRunning);
        }
        Ok(())
    }
}

/// Body of the recovery task
async fn run_session(shared: Arc<Shared>, session: Arc<RecoverySession>) -> RecoveryOutcome {
    let result = recover(&shared, &session).await;

    let outcome = match result {
        Ok(()) => {
            shared.set_state(RecoveryState::Done);
            tracing::info!("Distributed recovery finished, member is ONLINE");
            RecoveryOutcome::Online
        }
        Err(_) if session.stop_requested() => {
            shared.set_state(RecoveryState::Aborted);
            tracing::info!("Distributed recovery stopped on request");
            RecoveryOutcome::Stopped
        }
        Err(SessionFailure::Aborted(reason)) => {
            shared.set_state(RecoveryState::Aborted);
            tracing::warn!("Distributed recovery aborted: {}", reason);
            RecoveryOutcome::Aborted { reason }
        }
        Err(SessionFailure::Fatal(e)) => {
            shared.set_state(RecoveryState::FatalError);
            let reason = e.to_string();
            tracing::error!(
                "Fatal error during distributed recovery: {} (donor attempts: {}, last donor: {})",
                reason,
                session.transfer.attempts(),
                session
                    .transfer
                    .donor()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "none".into())
            );
            if e.requires_leave() {
                shared.services.messenger.request_leave(&reason).await;
            }
            RecoveryOutcome::Failed { reason }
        }
    };

    // Finished before the outcome is published so waiters may start again
    session.finished.store(true, Ordering::SeqCst);
    shared.outcome.send_replace(Some(outcome.clone()));
    outcome
}

async fn recover(shared: &Shared, session: &RecoverySession) -> std::result::Result<(), SessionFailure> {
    let services = &shared.services;
    shared.set_state(RecoveryState::Starting);

    // Decided once: later membership changes must not alter it
    let member_count = services.membership.member_count().await;

    shared.set_state(RecoveryState::SuspendingApplier);
    suspend_applier(services.applier.as_ref(), &session.signals).await?;

    let watermark = if member_count == 1 {
        shared.set_state(RecoveryState::AloneInGroup);
        tracing::info!("Only member in the group, no state transfer needed");
        None
    } else {
        let (until, watermark) = match &session.condition {
            CompletionCondition::View { view_id } => {
                (UntilCondition::ViewChange { view_id: view_id.clone() }, None)
            }
            CompletionCondition::PositionSet { view_id } => {
                shared.set_state(RecoveryState::AwaitingMetadata);
                let metadata = receive_metadata(shared, session).await?;
                if metadata.view_id != *view_id {
                    tracing::warn!(
                        "Recovery metadata was generated for view {} but the session joined view {}",
                        metadata.view_id,
                        view_id
                    );
                }

                services.certifier.apply_recovery_metadata(&metadata).await?;

                let watermark = metadata.watermark.clone();
                (UntilCondition::Positions(watermark.clone()), Some(watermark))
            }
        };

        shared.set_state(RecoveryState::Transferring);
        session.transfer.run(until).await?;
        watermark
    };

    if let Some(watermark) = watermark {
        tracing::info!("Reinitializing certification from watermark [{}]", watermark);
        services.certifier.reinitialize_from_watermark(&watermark).await?;
    }

    if session.signals.is_aborted() {
        return Err(Error::Aborted.into());
    }

    shared.set_state(RecoveryState::ResumingApplier);
    services.applier.resume().await?;

    shared.set_state(RecoveryState::WaitingApplierDrain);
    wait_for_applier_drain(shared, &session.signals).await?;

    if session.signals.is_aborted() {
        return Err(Error::Aborted.into());
    }

    shared.set_state(RecoveryState::AnnouncingOnline);
    let message = GroupMessage::RecoveryEnd {
        member: shared.local_uuid,
        view_id: session.condition.view_id().to_string(),
    };
    if let Err(e) = services.messenger.broadcast(message).await {
        tracing::error!("Failed to announce the end of recovery to the group: {}", e);
    }

    Ok(())
}

async fn suspend_applier(
    applier: &dyn ApplierControl,
    signals: &SessionSignals,
) -> std::result::Result<(), SessionFailure> {
    if applier.status() == ApplierStatus::Error {
        return Err(SessionFailure::Aborted("group applier is in error state".into()));
    }

    let outcome = tokio::select! {
        biased;
        _ = signals.cancel_token().cancelled() => {
            applier.interrupt_suspension_wait();
            return Err(Error::Aborted.into());
        }
        outcome = applier.suspend() => outcome?,
    };

    match outcome {
        SuspendOutcome::Suspended => Ok(()),
        SuspendOutcome::Interrupted if signals.is_aborted() => Err(Error::Aborted.into()),
        SuspendOutcome::Interrupted if applier.status() == ApplierStatus::Error => {
            Err(SessionFailure::Aborted("group applier failed while suspending".into()))
        }
        SuspendOutcome::Interrupted => {
            Err(Error::Applier("applier suspension was interrupted".into()).into())
        }
    }
}

async fn receive_metadata(
    shared: &Shared,
    session: &RecoverySession,
) -> Result<Arc<RecoveryMetadata>> {
    let timeout = shared.config.metadata_timeout();
    tracing::info!("Waiting up to {}ms for recovery metadata", timeout.as_millis());

    let metadata = session.metadata.wait(timeout).await?;
    tracing::info!(
        "Received recovery metadata: {} bytes of certification info, watermark [{}] ({} transactions)",
        metadata.certification_info.len(),
        metadata.watermark,
        metadata.watermark.count()
    );
    Ok(metadata)
}

/// Wait until the applier has consumed the backlog it had when resumed
async fn wait_for_applier_drain(shared: &Shared, signals: &SessionSignals) -> Result<()> {
    let applier = shared.services.applier.as_ref();
    let poll = shared.config.applier_poll_interval();

    let backlog = applier.queue_depth() as u64;
    let applied_at_start = applier.applied_count();
    tracing::info!("Waiting for the applier to consume a backlog of {} transactions", backlog);

    loop {
        if signals.is_aborted() {
            return Err(Error::Aborted);
        }
        if applier.status() == ApplierStatus::Error {
            return Err(Error::Applier("applier failed while consuming its backlog".into()));
        }

        let applied = applier.applied_count().saturating_sub(applied_at_start);
        let queued = applier.queue_depth();
        if queued == 0 || applied >= backlog {
            break;
        }

        tracing::debug!("Applier backlog: {}/{} applied, {} queued", applied, backlog, queued);
        if !signals.sleep(poll).await {
            return Err(Error::Aborted);
        }
    }

    if shared.config.recovery.completion_policy == CompletionPolicy::Executed {
        tracing::info!("Waiting for the applier to execute its backlog");
        loop {
            let executed = tokio::select! {
                biased;
                _ = signals.cancel_token().cancelled() => return Err(Error::Aborted),
                executed = applier.wait_for_execution(EXECUTION_WAIT_SLICE) => executed?,
            };
            if executed {
                break;
            }
        }
    }

    Ok(())
}
