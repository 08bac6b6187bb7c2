//! Session configuration and the handle state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timezone used for inbound message timestamps unless configured.
pub const DEFAULT_TIMEZONE: chrono_tz::Tz = chrono_tz::America::Hermosillo;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration shared by every handle a registry spawns.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Validity window of minted access tokens.
    pub token_ttl: Duration,

    /// Whether a fresh token is minted on every `Ready`.
    pub token_refresh: TokenRefresh,

    /// Backoff and ceiling for replacing a disconnected adapter.
    pub reconnect: ReconnectPolicy,

    /// Timezone inbound message timestamps are rendered in.
    pub timezone: chrono_tz::Tz,

    /// Capacity of the observer broadcast channel. Observers lagging by
    /// more than this many events skip ahead.
    pub event_capacity: usize,

    /// Bound of each handle's command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            token_refresh: TokenRefresh::default(),
            reconnect: ReconnectPolicy::default(),
            timezone: DEFAULT_TIMEZONE,
            event_capacity: 256,
            command_buffer: 32,
        }
    }
}

/// When a handle mints a new access token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRefresh {
    /// Every `Ready` transition mints a new token, including re-authentication
    /// after a reconnect. Earlier tokens keep working until they expire.
    #[default]
    OnEveryReady,

    /// Keep the current token across reconnects while it is unexpired.
    KeepWhileValid,
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff between adapter replacements.
///
/// The first attempt waits `initial_delay`, each following attempt doubles
/// it, capped at `max_delay`. With `max_attempts` set, a handle that fails
/// that many consecutive attempts terminates itself. A successful `Ready`
/// resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect right away, forever.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Returns `true` if another attempt may follow `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }

    /// The next attempt number after `attempts_made` and the delay before
    /// it, or `None` once the ceiling is reached. The count saturates.
    pub fn schedule(&self, attempts_made: u32) -> Option<(u32, Duration)> {
        if !self.allows_another(attempts_made) {
            return None;
        }
        let attempt = attempts_made.saturating_add(1);
        Some((attempt, self.delay_for(attempt)))
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a session handle.
///
/// ```text
/// Initializing → AwaitingChallenge → Ready → Disconnected → Initializing …
///       └──────────────────────────────┘            any → Terminated
/// ```
///
/// - **Initializing**: an adapter is being built and started.
/// - **AwaitingChallenge**: the protocol wants the user to complete a
///   challenge (scan a QR code). Re-issued challenges keep this state.
/// - **Ready**: authenticated; messages flow and a token is valid.
/// - **Disconnected**: the adapter dropped; a replacement is scheduled.
/// - **Terminated**: closed or abandoned. Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    AwaitingChallenge,
    Ready,
    Disconnected,
    Terminated,
}

impl SessionStatus {
    /// Returns `true` until the handle is terminated.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Terminated)
    }

    /// Returns `true` if outbound messages are accepted.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        use SessionStatus::*;

        match (self, target) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Initializing, AwaitingChallenge | Ready | Disconnected) => true,
            (AwaitingChallenge, AwaitingChallenge | Ready | Disconnected) => true,
            (Ready, Disconnected) => true,
            (Disconnected, Initializing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::AwaitingChallenge => write!(f, "AwaitingChallenge"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_happy_path_transitions() {
        use SessionStatus::*;

        assert!(Initializing.can_transition_to(AwaitingChallenge));
        assert!(AwaitingChallenge.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Initializing));
    }

    #[test]
    fn test_session_status_resume_skips_challenge() {
        assert!(SessionStatus::Initializing.can_transition_to(SessionStatus::Ready));
    }

    #[test]
    fn test_session_status_challenge_can_repeat() {
        assert!(
            SessionStatus::AwaitingChallenge.can_transition_to(SessionStatus::AwaitingChallenge)
        );
    }

    #[test]
    fn test_session_status_rejects_invalid_transitions() {
        use SessionStatus::*;

        assert!(!Ready.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(AwaitingChallenge));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Initializing.can_transition_to(Initializing));
    }

    #[test]
    fn test_session_status_terminated_is_terminal() {
        use SessionStatus::*;

        for target in [Initializing, AwaitingChallenge, Ready, Disconnected, Terminated] {
            assert!(!Terminated.can_transition_to(target));
        }
        for from in [Initializing, AwaitingChallenge, Ready, Disconnected] {
            assert!(from.can_transition_to(Terminated));
        }
    }

    #[test]
    fn test_session_status_helpers() {
        assert!(SessionStatus::Disconnected.is_live());
        assert!(!SessionStatus::Terminated.is_live());
        assert!(SessionStatus::Ready.is_ready());
        assert!(!SessionStatus::AwaitingChallenge.is_ready());
        assert_eq!(SessionStatus::AwaitingChallenge.to_string(), "AwaitingChallenge");
    }

    #[test]
    fn test_reconnect_policy_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(64), Duration::from_millis(500));
    }

    #[test]
    fn test_reconnect_policy_ceiling() {
        let unbounded = ReconnectPolicy::immediate();
        assert!(unbounded.allows_another(u32::MAX - 1));

        let bounded = ReconnectPolicy::immediate().with_max_attempts(2);
        assert!(bounded.allows_another(0));
        assert!(bounded.allows_another(1));
        assert!(!bounded.allows_another(2));
    }

    #[test]
    fn test_reconnect_policy_schedule_saturates_attempt_count() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.schedule(0), Some((1, Duration::from_millis(500))));
        assert_eq!(policy.schedule(u32::MAX), Some((u32::MAX, policy.max_delay)));

        let bounded = ReconnectPolicy::immediate().with_max_attempts(u32::MAX);
        assert_eq!(bounded.schedule(u32::MAX - 1), Some((u32::MAX, Duration::ZERO)));
        assert_eq!(bounded.schedule(u32::MAX), None);
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.token_refresh, TokenRefresh::OnEveryReady);
        assert_eq!(config.timezone, chrono_tz::America::Hermosillo);
        assert_eq!(config.event_capacity, 256);
    }
}
