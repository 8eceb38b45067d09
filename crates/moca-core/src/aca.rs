// ── Automated Channel Assessment controller ──
//
// One session per interface. The whole session (config, state and result)
// lives in a single `watch` value; every transition is one
// `send_if_modified` closure, so readers always see a state and a result
// from the same session.
//
// Each accepted `start` bumps `AcaStatus::session`. Gateway replies carry
// the session they were issued for and are dropped if it has moved on,
// which is how a late acknowledgement after `cancel` is discarded.
//
// Writes to the gateway's ACA engine (start, configure, and the abort
// after a local failure) hold the writer lock, so a config write and a
// session start never interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelRange, ControllerConfig};
use crate::error::{CoreError, InvalidArgument};
use crate::gateway::{self, DriverError, DriverGateway};
use crate::model::{
    AcaConfig, AcaFailure, AcaProgress, AcaReport, AcaState, AcaStatus, IfIndex, PowerProfile,
    ScModStats,
};

/// Timing and range settings taken from [`ControllerConfig`].
#[derive(Debug, Clone, Copy)]
struct AcaSettings {
    gateway_timeout: Duration,
    ack_timeout: Duration,
    cancel_timeout: Duration,
    poll_interval: Duration,
    deadline: Duration,
    poll_retries: u32,
    channels: ChannelRange,
}

impl From<&ControllerConfig> for AcaSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            gateway_timeout: config.gateway_timeout,
            ack_timeout: config.aca_ack_timeout,
            cancel_timeout: config.aca_cancel_timeout,
            poll_interval: config.aca_poll_interval.max(Duration::from_millis(1)),
            deadline: config.aca_deadline,
            poll_retries: config.aca_poll_retries.max(1),
            channels: config.aca_channels,
        }
    }
}

/// Serialises assessment sessions on one interface.
///
/// Cheaply cloneable; clones share the session.
#[derive(Clone)]
pub struct AcaController {
    inner: Arc<AcaInner>,
}

struct AcaInner {
    if_index: IfIndex,
    gateway: Arc<dyn DriverGateway>,
    settings: AcaSettings,
    status: watch::Sender<AcaStatus>,
    /// Held across every write to the gateway's ACA engine.
    writer: Mutex<()>,
    /// Stops every poll task spawned by this controller.
    cancel: CancellationToken,
}

impl AcaController {
    pub fn new(
        if_index: IfIndex,
        gateway: Arc<dyn DriverGateway>,
        config: &ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(AcaStatus::default());
        Self {
            inner: Arc::new(AcaInner {
                if_index,
                gateway,
                settings: AcaSettings::from(config),
                status,
                writer: Mutex::new(()),
                cancel,
            }),
        }
    }

    // ── Session control ──────────────────────────────────────────────

    /// Begin a new assessment.
    ///
    /// Refused with [`CoreError::AlreadyInProgress`] while a session is
    /// `Configuring` or `Running`. Otherwise the previous result is cleared,
    /// the session enters `Configuring` and the request is sent to the
    /// gateway. A positive acknowledgement within the ack timeout moves it
    /// to `Running` and starts status polling; a rejection or timeout fails
    /// the session and is returned.
    ///
    /// If the session is cancelled while waiting, a late acknowledgement is
    /// discarded and `Ok(())` is returned with the state left `Cancelled`.
    ///
    /// A config with `start == false` is only written to the gateway and
    /// recorded; no session is started. Either kind of request is refused
    /// with `AlreadyInProgress` while another is still being written.
    pub async fn start(&self, config: AcaConfig) -> Result<(), CoreError> {
        self.validate(&config)?;

        let Ok(_writer) = self.inner.writer.try_lock() else {
            debug!(if_index = %self.inner.if_index, "ACA start refused: gateway write in progress");
            return Err(CoreError::AlreadyInProgress);
        };

        if !config.start {
            return self.configure_only(config).await;
        }

        let session = self.begin(config)?;
        info!(
            if_index = %self.inner.if_index,
            session,
            node = %config.node_id,
            probe = %config.probe,
            channel = config.channel,
            report_nodes = config.report_nodes,
            "ACA session configuring"
        );

        let ack = tokio::time::timeout(
            self.inner.settings.ack_timeout,
            self.inner.gateway.start_aca(self.inner.if_index, config),
        )
        .await;

        match ack {
            Ok(Ok(())) => {
                if self.advance(session, &AcaState::Configuring, AcaState::Running) {
                    info!(if_index = %self.inner.if_index, session, "ACA session running");
                    self.spawn_poller(session);
                } else {
                    debug!(
                        if_index = %self.inner.if_index,
                        session,
                        "acknowledgement for superseded ACA session discarded"
                    );
                }
                Ok(())
            }
            Ok(Err(err)) => {
                let failure = failure_for(&err);
                if self.advance(session, &AcaState::Configuring, AcaState::Failed(failure)) {
                    warn!(if_index = %self.inner.if_index, session, error = %err, "ACA start rejected");
                }
                Err(CoreError::from_driver("start_aca", err))
            }
            Err(_) => {
                let after = self.inner.settings.ack_timeout;
                if self
                    .fail_and_abort(session, &AcaState::Configuring, AcaFailure::Timeout)
                    .await
                {
                    warn!(
                        if_index = %self.inner.if_index,
                        session,
                        after_ms = after.as_millis(),
                        "ACA start not acknowledged"
                    );
                }
                Err(CoreError::timeout("start_aca", after))
            }
        }
    }

    /// Cancel the in-flight session, if any.
    ///
    /// Exactly one caller moves a `Configuring` or `Running` session to
    /// `Cancelled` and asks the gateway to abort; every other call is a
    /// no-op. The local transition stands even if the abort times out.
    pub async fn cancel(&self) -> Result<(), CoreError> {
        // Taken when free so no start is written ahead of the abort. A start
        // still waiting for its acknowledgement keeps the lock; its late
        // acknowledgement is discarded.
        let _writer = self.inner.writer.try_lock().ok();

        let mut cancelled = None;
        self.inner.status.send_if_modified(|status| {
            if !status.state.is_in_flight() {
                return false;
            }
            status.state = AcaState::Cancelled;
            cancelled = Some(status.session);
            true
        });

        let Some(session) = cancelled else {
            debug!(if_index = %self.inner.if_index, "cancel with no ACA session in flight");
            return Ok(());
        };
        info!(if_index = %self.inner.if_index, session, "ACA session cancelled");

        let limit = self.inner.settings.cancel_timeout;
        match tokio::time::timeout(limit, self.inner.gateway.cancel_aca(self.inner.if_index)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(if_index = %self.inner.if_index, session, error = %err, "ACA abort failed");
                Err(CoreError::from_driver("cancel_aca", err))
            }
            Err(_) => {
                warn!(
                    if_index = %self.inner.if_index,
                    session,
                    after_ms = limit.as_millis(),
                    "ACA abort not acknowledged; session stays cancelled"
                );
                Ok(())
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────

    /// Consistent snapshot of the current or most recent session.
    pub fn status(&self) -> AcaStatus {
        self.inner.status.borrow().clone()
    }

    /// Config of the current or most recent session. Never touches hardware.
    pub fn config(&self) -> Option<AcaConfig> {
        self.inner.status.borrow().config
    }

    pub fn state(&self) -> AcaState {
        self.inner.status.borrow().state.clone()
    }

    /// Notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<AcaStatus> {
        self.inner.status.subscribe()
    }

    /// Perform one status poll for the running session and apply the
    /// result. Returns the state afterwards; outside `Running` this returns
    /// the current state without calling the gateway.
    pub async fn poll_once(&self) -> Result<AcaState, CoreError> {
        let (session, running) = {
            let status = self.inner.status.borrow();
            (status.session, status.state == AcaState::Running)
        };
        if !running {
            return Ok(self.state());
        }
        self.poll_session(session).await
    }

    /// Per node-pair subcarrier figures for the completed session, sorted by
    /// `(tx_node, rx_node, channel)`.
    pub async fn subcarrier_stats(&self) -> Result<Vec<ScModStats>, CoreError> {
        let session = {
            let status = self.inner.status.borrow();
            if !status.result_ready() {
                debug!(
                    if_index = %self.inner.if_index,
                    state = %status.state,
                    "subcarrier stats requested before ACA completed"
                );
                return Err(CoreError::NotReady { what: "ACA result" });
            }
            status.session
        };

        let mut rows = gateway::bounded(
            "read_scmod_stats",
            self.inner.settings.gateway_timeout,
            self.inner.gateway.read_scmod_stats(self.inner.if_index),
        )
        .await?;

        if let Some(row) = rows.iter().find(|row| !row.is_complete()) {
            let message = format!(
                "read_scmod_stats: incomplete row for {} -> {} on channel {}",
                row.tx_node, row.rx_node, row.channel
            );
            error!(if_index = %self.inner.if_index, "{message}");
            return Err(CoreError::Internal(message));
        }

        // A new session started while reading: the rows may be its data.
        if self.inner.status.borrow().session != session {
            return Err(CoreError::NotReady { what: "ACA result" });
        }

        rows.sort_by_key(ScModStats::key);
        Ok(rows)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn validate(&self, config: &AcaConfig) -> Result<(), InvalidArgument> {
        let channels = self.inner.settings.channels;
        if !channels.contains(config.channel) {
            return Err(InvalidArgument::Channel {
                channel: config.channel,
                min: channels.min,
                max: channels.max,
            });
        }
        Ok(())
    }

    /// Claim the session slot: `Configuring` with a fresh generation and a
    /// cleared result, or `AlreadyInProgress`.
    fn begin(&self, config: AcaConfig) -> Result<u64, CoreError> {
        let mut claimed = None;
        self.inner.status.send_if_modified(|status| {
            if status.state.is_in_flight() {
                return false;
            }
            *status = AcaStatus {
                config: Some(config),
                state: AcaState::Configuring,
                rx_power: 0,
                power_profile: PowerProfile::empty(),
                trap_completed: false,
                session: status.session + 1,
            };
            claimed = Some(status.session);
            true
        });

        claimed.ok_or_else(|| {
            debug!(if_index = %self.inner.if_index, "ACA start refused: session in flight");
            CoreError::AlreadyInProgress
        })
    }

    /// Write `config` without starting a session. The caller holds the
    /// writer lock, so no session can begin before the config is recorded.
    async fn configure_only(&self, config: AcaConfig) -> Result<(), CoreError> {
        if self.inner.status.borrow().state.is_in_flight() {
            debug!(if_index = %self.inner.if_index, "ACA configure refused: session in flight");
            return Err(CoreError::AlreadyInProgress);
        }

        gateway::bounded(
            "start_aca",
            self.inner.settings.gateway_timeout,
            self.inner.gateway.start_aca(self.inner.if_index, config),
        )
        .await?;

        self.inner.status.send_modify(|status| status.config = Some(config));
        debug!(if_index = %self.inner.if_index, channel = config.channel, "ACA configured without start");
        Ok(())
    }

    /// Move `session` from `from` to `to`. No-op if the session has been
    /// superseded or is no longer in `from`.
    fn advance(&self, session: u64, from: &AcaState, to: AcaState) -> bool {
        self.inner.status.send_if_modified(|status| {
            if status.session != session || status.state != *from {
                return false;
            }
            status.state = to;
            true
        })
    }

    fn is_current(&self, session: u64, state: &AcaState) -> bool {
        let status = self.inner.status.borrow();
        status.session == session && status.state == *state
    }

    /// Fail `session` if it is still in `from`, aborting the hardware first
    /// so the next `start` finds the engine idle. The caller holds the
    /// writer lock.
    async fn fail_and_abort(&self, session: u64, from: &AcaState, failure: AcaFailure) -> bool {
        if !self.is_current(session, from) {
            return false;
        }
        self.abort_hardware(session).await;
        self.advance(session, from, AcaState::Failed(failure))
    }

    /// Best-effort abort after a local failure. Errors are logged only.
    async fn abort_hardware(&self, session: u64) {
        let if_index = self.inner.if_index;
        let limit = self.inner.settings.cancel_timeout;
        match tokio::time::timeout(limit, self.inner.gateway.cancel_aca(if_index)).await {
            Ok(Ok(())) => debug!(%if_index, session, "ACA hardware session aborted"),
            Ok(Err(err)) => {
                warn!(%if_index, session, error = %err, "ACA abort after local failure failed");
            }
            Err(_) => {
                warn!(
                    %if_index,
                    session,
                    after_ms = limit.as_millis(),
                    "ACA abort after local failure not acknowledged"
                );
            }
        }
    }

    async fn poll_session(&self, session: u64) -> Result<AcaState, CoreError> {
        let report = gateway::bounded(
            "poll_aca_status",
            self.inner.settings.gateway_timeout,
            self.inner.gateway.poll_aca_status(self.inner.if_index),
        )
        .await?;
        Ok(self.apply_report(session, report))
    }

    /// Fold one status report into the session and return the resulting
    /// state. Result fields and `Completed` are written together.
    fn apply_report(&self, session: u64, report: AcaReport) -> AcaState {
        let mut after = None;
        let changed = self.inner.status.send_if_modified(|status| {
            if status.session != session || status.state != AcaState::Running {
                after = Some(status.state.clone());
                return false;
            }
            let next = match report.progress {
                AcaProgress::Success if report.trap_completed => {
                    status.rx_power = report.rx_power;
                    status.power_profile = report.power_profile;
                    status.trap_completed = true;
                    AcaState::Completed
                }
                AcaProgress::Success | AcaProgress::InProgress => {
                    after = Some(AcaState::Running);
                    return false;
                }
                AcaProgress::BadChannel => AcaState::Failed(AcaFailure::BadChannel),
                AcaProgress::NoEvmProbe => AcaState::Failed(AcaFailure::NoEvmProbe),
                AcaProgress::Fail => AcaState::Failed(AcaFailure::Hardware),
            };
            status.state = next.clone();
            after = Some(next);
            true
        });

        let state = after.unwrap_or_default();
        if changed {
            match &state {
                AcaState::Completed => {
                    info!(if_index = %self.inner.if_index, session, "ACA session completed");
                }
                other => {
                    warn!(if_index = %self.inner.if_index, session, state = %other, "ACA session failed");
                }
            }
        }
        state
    }

    fn spawn_poller(&self, session: u64) {
        let controller = self.clone();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(poll_task(controller, session, cancel));
    }
}

impl std::fmt::Debug for AcaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.status.borrow();
        f.debug_struct("AcaController")
            .field("if_index", &self.inner.if_index)
            .field("state", &status.state)
            .field("session", &status.session)
            .finish_non_exhaustive()
    }
}

/// Classify a start failure for the session record.
fn failure_for(err: &DriverError) -> AcaFailure {
    match err {
        DriverError::Rejected(reason) => AcaFailure::Rejected(reason.clone()),
        DriverError::InProgress
        | DriverError::NoSuchNode(_)
        | DriverError::InvalidProbe(_)
        | DriverError::InvalidChannel(_) => AcaFailure::Rejected(err.to_string()),
        DriverError::Unavailable(_) | DriverError::Failure(_) | DriverError::Malformed(_) => {
            AcaFailure::Driver(err.to_string())
        }
    }
}

// ── Background status polling ────────────────────────────────────────

/// Poll the gateway while `session` is `Running`.
///
/// Ends when the session leaves `Running`, when it is superseded, on
/// cancellation, or by failing the session once the deadline passes or
/// the consecutive-failure budget is spent.
async fn poll_task(controller: AcaController, session: u64, cancel: CancellationToken) {
    let settings = controller.inner.settings;
    let if_index = controller.inner.if_index;

    let deadline = tokio::time::sleep(settings.deadline);
    tokio::pin!(deadline);

    let mut interval = tokio::time::interval(settings.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = &mut deadline => {
                let _writer = controller.inner.writer.lock().await;
                if controller
                    .fail_and_abort(session, &AcaState::Running, AcaFailure::Timeout)
                    .await
                {
                    warn!(
                        %if_index,
                        session,
                        deadline_secs = settings.deadline.as_secs(),
                        "ACA session exceeded its deadline"
                    );
                }
                break;
            }
            _ = interval.tick() => {
                if !controller.is_current(session, &AcaState::Running) {
                    break;
                }
                match controller.poll_session(session).await {
                    Ok(AcaState::Running) => failures = 0,
                    Ok(_) => break,
                    Err(e) => {
                        failures += 1;
                        warn!(%if_index, session, failures, error = %e, "ACA status poll failed");
                        if failures >= settings.poll_retries {
                            let _writer = controller.inner.writer.lock().await;
                            controller
                                .fail_and_abort(
                                    session,
                                    &AcaState::Running,
                                    AcaFailure::Driver(e.to_string()),
                                )
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(%if_index, session, "ACA poll task stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{NodeId, ProbeType};
    use crate::sim::SimGateway;

    fn controller(sim: &Arc<SimGateway>) -> AcaController {
        let config = ControllerConfig {
            aca_poll_interval: Duration::from_secs(3600),
            ..ControllerConfig::default()
        };
        AcaController::new(
            IfIndex::SINGLE,
            Arc::clone(sim) as Arc<dyn DriverGateway>,
            &config,
            CancellationToken::new(),
        )
    }

    fn evm_config() -> AcaConfig {
        AcaConfig::new(NodeId::new(2).unwrap(), ProbeType::Evm, 5, 0x0005)
    }

    #[tokio::test]
    async fn channel_out_of_range_is_rejected_before_any_call() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        let mut config = evm_config();
        config.channel = 64;

        let err = aca.start(config).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidArgument(InvalidArgument::Channel { channel: 64, .. })
        ));
        assert_eq!(aca.state(), AcaState::Idle);
        assert_eq!(sim.aca_start_calls(IfIndex::SINGLE), 0);
    }

    #[tokio::test]
    async fn ack_moves_session_to_running() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        aca.start(evm_config()).await.unwrap();

        let status = aca.status();
        assert_eq!(status.state, AcaState::Running);
        assert_eq!(status.session, 1);
        assert_eq!(status.config, Some(evm_config()));
    }

    #[tokio::test]
    async fn rejected_start_fails_session() {
        let sim = Arc::new(SimGateway::new());
        sim.reject_next_aca(IfIndex::SINGLE, "busy");
        let aca = controller(&sim);

        let err = aca.start(evm_config()).await.unwrap_err();
        assert!(matches!(err, CoreError::Driver { .. }));
        assert_eq!(
            aca.state(),
            AcaState::Failed(AcaFailure::Rejected("busy".into()))
        );
    }

    #[tokio::test]
    async fn poll_applies_result_atomically() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        aca.start(evm_config()).await.unwrap();

        assert_eq!(aca.poll_once().await.unwrap(), AcaState::Running);
        sim.complete_aca(IfIndex::SINGLE, -42);
        assert_eq!(aca.poll_once().await.unwrap(), AcaState::Completed);

        let status = aca.status();
        assert!(status.result_ready());
        assert_eq!(status.rx_power, -42);
        assert_eq!(status.power_profile.len(), crate::model::limits::PROFILE_LEN);
    }

    #[tokio::test]
    async fn hardware_failure_codes_fail_session() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        aca.start(evm_config()).await.unwrap();

        sim.finish_aca(IfIndex::SINGLE, AcaProgress::BadChannel);
        assert_eq!(
            aca.poll_once().await.unwrap(),
            AcaState::Failed(AcaFailure::BadChannel)
        );
        assert!(!aca.status().trap_completed);
    }

    #[tokio::test]
    async fn subcarrier_stats_not_ready_until_completed() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        assert_eq!(
            aca.subcarrier_stats().await.unwrap_err(),
            CoreError::NotReady { what: "ACA result" }
        );

        aca.start(evm_config()).await.unwrap();
        assert!(aca.subcarrier_stats().await.is_err());
    }

    #[tokio::test]
    async fn configure_only_records_config_without_session() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        let mut config = evm_config();
        config.start = false;

        aca.start(config).await.unwrap();
        let status = aca.status();
        assert_eq!(status.state, AcaState::Idle);
        assert_eq!(status.session, 0);
        assert_eq!(status.config, Some(config));
    }

    #[tokio::test]
    async fn configure_refused_while_start_awaits_ack() {
        let sim = Arc::new(SimGateway::new());
        sim.hold_aca_ack(IfIndex::SINGLE);
        let aca = controller(&sim);

        let start = tokio::spawn({
            let aca = aca.clone();
            async move { aca.start(evm_config()).await }
        });
        let mut rx = aca.subscribe();
        rx.wait_for(|s| s.state == AcaState::Configuring).await.unwrap();

        let mut config = evm_config();
        config.start = false;
        config.channel = 9;
        assert_eq!(aca.start(config).await, Err(CoreError::AlreadyInProgress));
        assert_eq!(sim.aca_start_calls(IfIndex::SINGLE), 1);

        sim.release_aca_ack(IfIndex::SINGLE);
        start.await.unwrap().unwrap();
        assert_eq!(aca.config(), Some(evm_config()));
        assert_eq!(aca.state(), AcaState::Running);
    }

    #[tokio::test]
    async fn cancel_without_session_is_noop() {
        let sim = Arc::new(SimGateway::new());
        let aca = controller(&sim);
        aca.cancel().await.unwrap();
        assert_eq!(aca.state(), AcaState::Idle);
        assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 0);
    }
}
