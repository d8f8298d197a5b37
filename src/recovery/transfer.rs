//! State Transfer
//!
//! Drives the recovery channel against one donor at a time until the joiner
//! has received everything it needs. A donor that leaves the group or a
//! channel thread that stops early triggers a failover to a new donor; the
//! session only fails once the donor retry budget is exhausted or no donor
//! exists at all.
//!
//! Locking: the selection lock guards the donor selector, the attempt
//! counter and every connect/disconnect of the channel. It is never held
//! while waiting on the session signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::donor::DonorSelector;
use super::signals::{SessionEvent, SessionSignals};
use crate::channel::{
    Endpoint, RecoveryChannelObserver, ReplicationChannel, TransportOptions, UntilCondition,
};
use crate::config::RecoveryConfig;
use crate::error::{Error, Result};
use crate::group::{GroupMembership, MemberInfo, MemberVersion};

/// Progress of the state transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    Connecting,
    ConnectedWaiting,
    TerminatedOk,
    TerminatedFailover,
    TerminatedChannelError,
    TerminatedAborted,
}

#[derive(Debug, Clone)]
struct TransferProgress {
    state: TransferState,
    donor: Option<Uuid>,
    attempts: u32,
}

/// State transfer of one recovery session
pub struct StateTransfer {
    config: Arc<RecoveryConfig>,
    channel: Arc<dyn ReplicationChannel>,
    membership: Arc<dyn GroupMembership>,
    signals: SessionSignals,
    transport: TransportOptions,
    /// Until condition, fixed once the transfer starts
    until: OnceLock<UntilCondition>,
    /// Selection lock
    selector: tokio::sync::Mutex<DonorSelector>,
    /// Set while channel threads run against a donor, written under the selection lock
    connected: AtomicBool,
    /// Progress snapshot for status queries
    progress: Mutex<TransferProgress>,
}

impl StateTransfer {
    /// Create the state transfer for a session
    pub fn new(
        config: Arc<RecoveryConfig>,
        local_uuid: Uuid,
        local_version: MemberVersion,
        channel: Arc<dyn ReplicationChannel>,
        membership: Arc<dyn GroupMembership>,
        signals: SessionSignals,
    ) -> Self {
        let selector = DonorSelector::new(
            local_uuid,
            local_version,
            config.recovery.allow_local_lower_version_join,
        );
        let transport = config.transport_options();

        Self {
            config,
            channel,
            membership,
            signals,
            transport,
            until: OnceLock::new(),
            selector: tokio::sync::Mutex::new(selector),
            connected: AtomicBool::new(false),
            progress: Mutex::new(TransferProgress {
                state: TransferState::Idle,
                donor: None,
                attempts: 0,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.progress().state
    }

    /// Donor used by the latest connection attempt
    pub fn donor(&self) -> Option<Uuid> {
        self.progress().donor
    }

    /// Donor connection attempts so far
    pub fn attempts(&self) -> u32 {
        self.progress().attempts
    }

    /// Check if channel threads currently run against a donor
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn progress(&self) -> TransferProgress {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_progress(&self, f: impl FnOnce(&mut TransferProgress)) {
        let mut progress = self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut progress);
    }

    fn set_state(&self, state: TransferState) {
        self.update_progress(|p| p.state = state);
    }

    /// Run the state transfer until the data has arrived, the session is
    /// aborted or no donor can be reached.
    pub async fn run(&self, until: UntilCondition) -> Result<()> {
        if self.until.set(until).is_err() {
            return Err(Error::Internal("state transfer already started".into()));
        }

        if self.signals.is_aborted() {
            self.set_state(TransferState::TerminatedAborted);
            return Err(Error::Aborted);
        }

        loop {
            if !self.is_connected() {
                if let Err(e) = self.establish_donor_connection().await {
                    if matches!(e, Error::Aborted) {
                        self.set_state(TransferState::TerminatedAborted);
                    }
                    return Err(e);
                }
            }

            match self.wait_for_termination().await {
                TransferState::TerminatedOk => return Ok(()),
                TransferState::TerminatedAborted => return Err(Error::Aborted),
                state => {
                    tracing::info!("Donor connection ended ({:?}), failing over to a new donor", state);
                }
            }
        }
    }

    /// Pick donors until one of them accepts the connection
    async fn establish_donor_connection(&self) -> Result<()> {
        let max_attempts = self.config.recovery.donor_retry_count;

        loop {
            if self.signals.is_aborted() {
                return Err(Error::Aborted);
            }

            let mut selector = self.selector.lock().await;

            let last_donor = selector.selected().map(|d| d.uuid.to_string());

            if self.membership.member_count().await <= 1 {
                tracing::error!("No donor exists: the local member is alone in the group");
                return Err(Error::NoAvailableDonor {
                    attempts: selector.attempts(),
                    last_donor,
                });
            }

            if selector.attempts() >= max_attempts {
                tracing::error!(
                    "Maximum number of donor connection attempts reached ({}), last donor: {}",
                    selector.attempts(),
                    last_donor.as_deref().unwrap_or("none")
                );
                return Err(Error::NoAvailableDonor {
                    attempts: selector.attempts(),
                    last_donor,
                });
            }

            if selector.is_empty() {
                let members = self.membership.list_members().await;
                selector.rebuild(&members);
            }

            let attempt = selector.record_attempt();
            self.set_state(TransferState::Connecting);

            let result = match selector.next() {
                Some(donor) => {
                    self.update_progress(|p| {
                        p.donor = Some(donor.uuid);
                        p.attempts = attempt;
                    });
                    tracing::info!(
                        "Establishing connection to donor {} at {} (attempt {}/{})",
                        donor.uuid,
                        donor.address(),
                        attempt,
                        max_attempts
                    );
                    self.connect(&donor).await
                }
                None => {
                    self.update_progress(|p| p.attempts = attempt);
                    Err(Error::Channel("no valid donor exists in the group".into()))
                }
            };

            match result {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.set_state(TransferState::ConnectedWaiting);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!("Recovery channel cannot be reused: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Donor connection attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );

                    let backoff = selector.is_empty() && attempt < max_attempts;
                    drop(selector);

                    if backoff {
                        let interval = self.config.reconnect_interval();
                        tracing::info!(
                            "All donors tried, retrying in {}ms",
                            interval.as_millis()
                        );
                        if !self.signals.sleep(interval).await {
                            return Err(Error::Aborted);
                        }
                    }
                }
            }
        }
    }

    /// Point the channel at a donor and start its threads.
    /// Called with the selection lock held.
    async fn connect(&self, donor: &MemberInfo) -> Result<()> {
        let until = self
            .until
            .get()
            .ok_or_else(|| Error::Internal("until condition not set".into()))?;

        // Never start a connection while the previous one still has threads
        if self.channel.is_receiver_running() || self.channel.is_applier_running() {
            self.channel.unregister_observer();
            self.channel.stop_threads().await?;
            if self.channel.is_receiver_running() || self.channel.is_applier_running() {
                return Err(Error::ChannelThreadsRunning);
            }
        }

        self.channel.purge_logs().await?;

        let endpoint = Endpoint {
            donor: donor.uuid,
            host: donor.host.clone(),
            port: donor.port,
        };
        let failed = |e: Error| Error::ConnectionFailed {
            donor: donor.uuid.to_string(),
            address: endpoint.to_string(),
            reason: e.to_string(),
        };

        self.channel
            .initialize(&endpoint, &self.transport)
            .await
            .map_err(failed)?;

        let observer = RecoveryChannelObserver::new(
            Arc::clone(&self.channel),
            self.signals.clone(),
            until.clone(),
        );
        self.channel.register_observer(Arc::new(observer));

        if let Err(e) = self.channel.start_threads(until).await {
            self.channel.unregister_observer();
            if let Err(stop_err) = self.channel.stop_threads().await {
                tracing::warn!("Failed to stop recovery channel after start failure: {}", stop_err);
            }
            return Err(failed(e));
        }

        tracing::info!("Connected to donor {} at {}, waiting for {}", donor.uuid, endpoint, until);
        Ok(())
    }

    /// Stop the channel threads of the current connection.
    /// Called with the selection lock held.
    async fn terminate_connection(&self, purge_logs: bool) -> Result<()> {
        // Unregister first so our own stop is not reported as a failure
        self.channel.unregister_observer();
        let stopped = self.channel.stop_threads().await;
        self.connected.store(false, Ordering::SeqCst);

        if let Err(e) = &stopped {
            tracing::error!("Failed to stop recovery channel threads: {}", e);
        }
        if purge_logs {
            self.channel.purge_logs().await?;
        }
        stopped
    }

    /// Wait for the current connection to end and clean it up
    async fn wait_for_termination(&self) -> TransferState {
        self.set_state(TransferState::ConnectedWaiting);
        let event = self.signals.wait().await;

        let selector = self.selector.lock().await;
        let state = match event {
            SessionEvent::Abort => {
                let _ = self.terminate_connection(false).await;
                TransferState::TerminatedAborted
            }
            SessionEvent::TransferFinished => {
                tracing::info!("State transfer finished, stopping recovery channel");
                if let Err(e) = self.terminate_connection(true).await {
                    tracing::warn!("Recovery channel cleanup after transfer failed: {}", e);
                }
                TransferState::TerminatedOk
            }
            SessionEvent::DonorFailover => {
                let _ = self.terminate_connection(false).await;
                TransferState::TerminatedFailover
            }
            SessionEvent::ChannelError | SessionEvent::None => {
                let _ = self.terminate_connection(false).await;
                TransferState::TerminatedChannelError
            }
        };
        self.signals.take_failover();
        drop(selector);

        self.set_state(state);
        state
    }

    /// React to a membership change: refresh the donor list and fail over
    /// if the selected donor left while connected.
    pub async fn update_recovery_process(&self, members_left: bool) {
        let mut selector = self.selector.lock().await;
        let members = self.membership.list_members().await;

        let had_donor = selector.selected().map(|d| d.uuid);
        let donor_present = selector.rebuild(&members).is_some();

        let Some(donor) = had_donor else {
            return;
        };
        if !members_left || donor_present {
            return;
        }

        if self.is_connected() {
            tracing::info!("Donor {} left the group, failing over to another donor", donor);
            self.signals.raise(SessionEvent::DonorFailover);
        } else {
            tracing::debug!("Donor {} left the group while not connected", donor);
            selector.clear_selected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::MemberStatus;
    use crate::position::PositionSet;
    use crate::sim::{DonorScript, SimChannel, SimGroup};
    use std::time::Duration;

    fn local() -> MemberInfo {
        MemberInfo::new(Uuid::from_u128(1), "joiner", 3306, MemberVersion::new(8, 0, 36))
    }

    fn donor(n: u128) -> MemberInfo {
        MemberInfo::new(Uuid::from_u128(n), format!("donor-{}", n), 3306, MemberVersion::new(8, 0, 36))
    }

    fn config(retries: u32) -> Arc<RecoveryConfig> {
        Arc::new(
            RecoveryConfig::default()
                .with_donor_retry_count(retries)
                .with_reconnect_interval(Duration::from_millis(10)),
        )
    }

    async fn group_of(size: u128) -> Arc<SimGroup> {
        let group = Arc::new(SimGroup::new(local()));
        for n in 2..=size {
            group.add_member(donor(n)).await;
        }
        group
    }

    fn transfer(
        config: Arc<RecoveryConfig>,
        channel: &Arc<SimChannel>,
        group: &Arc<SimGroup>,
        signals: &SessionSignals,
    ) -> Arc<StateTransfer> {
        Arc::new(StateTransfer::new(
            config,
            local().uuid,
            local().version,
            channel.clone(),
            group.clone(),
            signals.clone(),
        ))
    }

    fn target() -> UntilCondition {
        let mut set = PositionSet::new();
        set.add_interval(Uuid::from_u128(99), 1, 10);
        UntilCondition::Positions(set)
    }

    #[tokio::test]
    async fn test_aborted_session_never_connects() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Complete, Duration::from_millis(5)));
        let signals = SessionSignals::new();
        signals.abort();

        let st = transfer(config(5), &channel, &group, &signals);
        assert!(matches!(st.run(target()).await, Err(Error::Aborted)));
        assert_eq!(st.state(), TransferState::TerminatedAborted);
        assert!(channel.connection_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_completes_on_target_positions() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Complete, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        let st = transfer(config(5), &channel, &group, &signals);
        st.run(target()).await.unwrap();

        assert_eq!(st.state(), TransferState::TerminatedOk);
        assert_eq!(channel.connection_attempts().len(), 1);
        assert!(!channel.is_receiver_running());
        assert!(!channel.is_applier_running());
        assert!(signals.is_finished());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Refuse, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        let st = transfer(config(4), &channel, &group, &signals);
        match st.run(target()).await {
            Err(Error::NoAvailableDonor { attempts, last_donor }) => {
                assert_eq!(attempts, 4);
                assert!(last_donor.is_some());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(channel.connection_attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_alone_in_group_is_fatal() {
        let group = group_of(1).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Complete, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        let st = transfer(config(5), &channel, &group, &signals);
        assert!(matches!(
            st.run(target()).await,
            Err(Error::NoAvailableDonor { attempts: 0, last_donor: None })
        ));
        assert!(channel.connection_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_no_compatible_donor_exhausts_retries() {
        let group = group_of(3).await;
        for n in 2..=3 {
            group.update_member(&Uuid::from_u128(n), |m| m.status = MemberStatus::Recovering).await;
        }
        let channel = Arc::new(SimChannel::new(DonorScript::Complete, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        let st = transfer(config(3), &channel, &group, &signals);
        assert!(matches!(st.run(target()).await, Err(Error::NoAvailableDonor { attempts: 3, .. })));
        assert!(channel.connection_attempts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_when_receiver_stops() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::DropReceiver, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        // Whichever donor is picked first drops, the second completes
        let first = Arc::clone(&channel);
        channel.on_first_connection(move |uuid| {
            for n in 2..=3 {
                let other = Uuid::from_u128(n);
                if other != uuid {
                    first.set_script(other, DonorScript::Complete);
                }
            }
        });

        let st = transfer(config(5), &channel, &group, &signals);
        st.run(target()).await.unwrap();

        let attempts = channel.connection_attempts();
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0], attempts[1]);
        assert_eq!(st.attempts(), 2);
        assert_eq!(st.state(), TransferState::TerminatedOk);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_when_applier_fails() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::FailApplier, Duration::from_millis(5)));
        let signals = SessionSignals::new();

        // The first donor's applier stops on an error before the target is applied
        let first = Arc::clone(&channel);
        channel.on_first_connection(move |uuid| {
            for n in 2..=3 {
                let other = Uuid::from_u128(n);
                if other != uuid {
                    first.set_script(other, DonorScript::Complete);
                }
            }
        });

        let st = transfer(config(5), &channel, &group, &signals);
        st.run(target()).await.unwrap();

        let attempts = channel.connection_attempts();
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0], attempts[1]);
        assert_eq!(st.attempts(), 2);
        assert_eq!(st.state(), TransferState::TerminatedOk);
        assert!(channel.applied_positions().is_superset_of(target().positions().unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_when_donor_leaves() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Stall, Duration::from_millis(5)));
        let signals = SessionSignals::new();
        let st = transfer(config(5), &channel, &group, &signals);

        let runner = {
            let st = Arc::clone(&st);
            tokio::spawn(async move { st.run(target()).await })
        };

        while !st.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let first = st.donor().unwrap();
        for n in 2..=3 {
            channel.set_script(Uuid::from_u128(n), DonorScript::Complete);
        }
        group.remove_member(&first).await;
        st.update_recovery_process(true).await;

        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();
        let attempts = channel.connection_attempts();
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[1], first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finished_wins_over_failover() {
        let group = group_of(3).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Stall, Duration::from_millis(5)));
        let signals = SessionSignals::new();
        let st = transfer(config(5), &channel, &group, &signals);

        let runner = {
            let st = Arc::clone(&st);
            tokio::spawn(async move {
                st.run(UntilCondition::ViewChange { view_id: "1:2".into() }).await
            })
        };
        while !st.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        signals.raise(SessionEvent::TransferFinished);
        signals.raise(SessionEvent::DonorFailover);

        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();
        assert_eq!(channel.connection_attempts().len(), 1);
        assert!(channel.purge_count() >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_during_backoff() {
        let group = group_of(2).await;
        let channel = Arc::new(SimChannel::new(DonorScript::Refuse, Duration::from_millis(5)));
        let signals = SessionSignals::new();
        let config = Arc::new(
            RecoveryConfig::default()
                .with_donor_retry_count(10)
                .with_reconnect_interval(Duration::from_secs(60)),
        );
        let st = transfer(config, &channel, &group, &signals);

        let runner = {
            let st = Arc::clone(&st);
            tokio::spawn(async move { st.run(target()).await })
        };
        while channel.connection_attempts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        signals.abort();

        let result = tokio::time::timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
        assert_eq!(channel.connection_attempts().len(), 1);
    }
}
