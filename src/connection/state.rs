//! Connection lifecycle as an explicit transition table.
//!
//! [`ConnectionMachine`] holds no IO and no timers. Every input returns the
//! list of [`Effect`]s the owner has to carry out, in order.

use std::time::Duration;

use serde::Serialize;

use crate::reconnect::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    /// Lost or never established while still wanted; a retry is scheduled
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start establishing a link
    Connect,
    ScheduleRetry { attempt: u32, delay: Duration },
    CancelRetry,
    ScheduleTeardown(Duration),
    CancelTeardown,
    /// Re-issue wire subscriptions for topics with live listeners
    Resubscribe,
    /// Forget wire subscription ids of the lost link
    InvalidateSubscriptions,
    /// Close the link and complete every topic
    Teardown,
    EmitStatus(bool),
    ReportExhausted { attempt: u32 },
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    references: u32,
    attempt: u32,
    teardown_pending: bool,
    retry_pending: bool,
    grace_period: Duration,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy, grace_period: Duration) -> Self {
        Self {
            state: ConnectionState::Closed,
            references: 0,
            attempt: 0,
            teardown_pending: false,
            retry_pending: false,
            grace_period,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn teardown_pending(&self) -> bool {
        self.teardown_pending
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// A consumer wants the connection
    pub fn request(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.teardown_pending {
            self.teardown_pending = false;
            effects.push(Effect::CancelTeardown);
        }

        self.references = self.references.saturating_add(1);

        if matches!(self.state, ConnectionState::Closed | ConnectionState::Failed) {
            self.begin_connect(&mut effects);
        }

        effects
    }

    /// A consumer no longer needs the connection. Extra releases are absorbed.
    pub fn release(&mut self) -> Vec<Effect> {
        self.references = self.references.saturating_sub(1);

        if self.references > 0 {
            return Vec::new();
        }

        // Restarted on every release at zero
        self.teardown_pending = true;
        vec![Effect::ScheduleTeardown(self.grace_period)]
    }

    pub fn teardown_elapsed(&mut self) -> Vec<Effect> {
        self.teardown_pending = false;

        if self.references > 0 {
            return Vec::new();
        }

        self.close_all()
    }

    pub fn connected(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        self.state = ConnectionState::Open;
        self.attempt = 0;
        vec![Effect::EmitStatus(true), Effect::Resubscribe]
    }

    /// A connect attempt failed or an open link went away
    pub fn link_failed(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        match self.state {
            ConnectionState::Open => effects.push(Effect::InvalidateSubscriptions),
            ConnectionState::Connecting => {}
            // Nothing to fail
            ConnectionState::Closed | ConnectionState::Failed => return effects,
        }

        effects.push(Effect::EmitStatus(false));

        if self.references == 0 {
            self.state = ConnectionState::Closed;
            return effects;
        }

        self.state = ConnectionState::Failed;
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.is_exhausted(self.attempt) {
            effects.push(Effect::ReportExhausted {
                attempt: self.attempt,
            });
        }
        self.retry_pending = true;
        effects.push(Effect::ScheduleRetry {
            attempt: self.attempt,
            delay: self.policy.jittered_delay(self.attempt),
        });

        effects
    }

    pub fn retry_elapsed(&mut self) -> Vec<Effect> {
        self.retry_pending = false;

        if self.state != ConnectionState::Failed || self.references == 0 {
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.begin_connect(&mut effects);
        effects
    }

    /// The host came back to the foreground: reconnect now if wanted
    pub fn foreground(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.references > 0
            && matches!(self.state, ConnectionState::Closed | ConnectionState::Failed)
        {
            self.begin_connect(&mut effects);
        }

        effects
    }

    /// Immediate teardown regardless of references
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.teardown_pending {
            self.teardown_pending = false;
            effects.push(Effect::CancelTeardown);
        }
        self.references = 0;
        effects.extend(self.close_all());

        effects
    }

    fn begin_connect(&mut self, effects: &mut Vec<Effect>) {
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
        self.state = ConnectionState::Connecting;
        effects.push(Effect::Connect);
    }

    fn close_all(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
        self.state = ConnectionState::Closed;
        self.attempt = 0;
        effects.push(Effect::Teardown);
        effects.push(Effect::EmitStatus(false));

        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(5);

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::new(), GRACE)
    }

    #[test]
    fn test_first_request_connects() {
        let mut m = machine();
        assert_eq!(m.request(), vec![Effect::Connect]);
        assert_eq!(m.state(), ConnectionState::Connecting);

        // Second request piggybacks on the pending connect
        assert!(m.request().is_empty());
        assert_eq!(m.references(), 2);
    }

    #[test]
    fn test_reference_count_is_floored_running_sum() {
        let mut m = machine();
        let ops = [1i32, 1, -1, -1, -1, 1, -1, -1, 1, 1, 1, -1];
        let mut expected = 0i32;

        for op in ops {
            let effects = if op > 0 { m.request() } else { m.release() };
            expected = (expected + op).max(0);
            assert_eq!(m.references() as i32, expected);

            // Teardown scheduled iff the count is zero
            assert_eq!(m.teardown_pending(), expected == 0);
            if op < 0 {
                assert_eq!(
                    effects.contains(&Effect::ScheduleTeardown(GRACE)),
                    expected == 0
                );
            }
        }
    }

    #[test]
    fn test_request_during_grace_cancels_teardown() {
        let mut m = machine();
        m.request();
        m.connected();
        assert_eq!(m.release(), vec![Effect::ScheduleTeardown(GRACE)]);

        assert_eq!(m.request(), vec![Effect::CancelTeardown]);
        assert!(m.is_connected());
        assert!(m.teardown_elapsed().is_empty());
    }

    #[test]
    fn test_teardown_closes_everything() {
        let mut m = machine();
        m.request();
        m.connected();
        m.release();

        assert_eq!(
            m.teardown_elapsed(),
            vec![Effect::Teardown, Effect::EmitStatus(false)]
        );
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_connected_resets_attempts_and_resubscribes() {
        let mut m = machine();
        m.request();
        m.link_failed();
        m.retry_elapsed();
        assert_eq!(m.attempt(), 1);

        assert_eq!(
            m.connected(),
            vec![Effect::EmitStatus(true), Effect::Resubscribe]
        );
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_failures_walk_the_backoff_table() {
        let mut m = machine();
        m.request();

        let mut delays = Vec::new();
        for _ in 0..6 {
            for effect in m.link_failed() {
                if let Effect::ScheduleRetry { delay, .. } = effect {
                    delays.push(delay.as_millis() as u64);
                }
            }
            assert_eq!(m.retry_elapsed(), vec![Effect::Connect]);
        }

        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 16_000, 16_000]);
    }

    #[test]
    fn test_exhaustion_is_reported_but_retries_continue() {
        let mut m = machine();
        m.request();
        for _ in 0..5 {
            let effects = m.link_failed();
            assert!(!effects
                .iter()
                .any(|e| matches!(e, Effect::ReportExhausted { .. })));
            m.retry_elapsed();
        }

        let effects = m.link_failed();
        assert!(effects.contains(&Effect::ReportExhausted { attempt: 6 }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleRetry { attempt: 6, .. })));
    }

    #[test]
    fn test_lost_open_link_invalidates_subscriptions() {
        let mut m = machine();
        m.request();
        m.connected();

        let effects = m.link_failed();
        assert_eq!(effects[0], Effect::InvalidateSubscriptions);
        assert_eq!(effects[1], Effect::EmitStatus(false));
        assert_eq!(m.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_failure_without_references_does_not_retry() {
        let mut m = machine();
        m.request();
        m.release();

        assert_eq!(m.link_failed(), vec![Effect::EmitStatus(false)]);
        assert_eq!(m.state(), ConnectionState::Closed);
        assert!(!m.retry_pending());
    }

    #[test]
    fn test_request_while_failed_brings_retry_forward() {
        let mut m = machine();
        m.request();
        m.link_failed();
        assert!(m.retry_pending());

        assert_eq!(m.request(), vec![Effect::CancelRetry, Effect::Connect]);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_foreground_reconnects_only_when_wanted() {
        let mut m = machine();
        assert!(m.foreground().is_empty());

        m.request();
        // Already connecting
        assert!(m.foreground().is_empty());

        m.link_failed();
        assert_eq!(m.foreground(), vec![Effect::CancelRetry, Effect::Connect]);
        // Backoff counter is kept
        assert_eq!(m.attempt(), 1);

        m.connected();
        assert!(m.foreground().is_empty());
    }

    #[test]
    fn test_stale_retry_is_ignored() {
        let mut m = machine();
        m.request();
        m.link_failed();
        m.request();
        m.connected();

        assert!(m.retry_elapsed().is_empty());
        assert!(m.is_connected());
    }

    #[test]
    fn test_shutdown_drops_all_references() {
        let mut m = machine();
        m.request();
        m.request();
        m.link_failed();

        assert_eq!(
            m.shutdown(),
            vec![Effect::CancelRetry, Effect::Teardown, Effect::EmitStatus(false)]
        );
        assert_eq!(m.references(), 0);
        assert_eq!(m.state(), ConnectionState::Closed);
    }
}
