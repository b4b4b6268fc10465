use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// When to re-dial a dropped push channel.
///
/// The delay is a function of the 1-based attempt number. The reference
/// policy is a fixed delay with no cap; tests inject zero-delay or capped
/// variants.
#[derive(Clone)]
pub struct ReconnectPolicy {
    delay: DelayFn,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::from_fn(move |_| delay)
    }

    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn from_fn(delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            delay: Arc::new(delay),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before `attempt`, or `None` once the cap is exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some((self.delay)(attempt)),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(crate::config::DEFAULT_RETRY_DELAY_MS))
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("first_delay", &(self.delay)(1))
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Connected,
    Retrying { attempt: u32 },
}

/// Outcome of reporting a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Arm a timer for `attempt` after `delay`.
    Schedule { attempt: u32, delay: Duration },
    /// A retry is already armed; nothing to do.
    AlreadyPending,
    /// The policy cap was reached after `attempts` retries.
    GiveUp { attempts: u32 },
}

struct PendingRetry {
    attempt: u32,
    timer: JoinHandle<()>,
}

/// Reconnect state machine. At most one retry is pending at a time.
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ReconnectState,
    failures: u32,
    pending: Option<PendingRetry>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::Idle,
            failures: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn pending_attempt(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.attempt)
    }

    pub fn on_open(&mut self) {
        self.clear_pending();
        self.failures = 0;
        self.state = ReconnectState::Connected;
    }

    pub fn on_disconnect(&mut self) -> RetryDecision {
        if self.pending.is_some() {
            return RetryDecision::AlreadyPending;
        }
        self.failures += 1;
        match self.policy.delay_for(self.failures) {
            Some(delay) => {
                self.state = ReconnectState::Retrying {
                    attempt: self.failures,
                };
                RetryDecision::Schedule {
                    attempt: self.failures,
                    delay,
                }
            }
            None => {
                self.state = ReconnectState::Idle;
                RetryDecision::GiveUp {
                    attempts: self.failures - 1,
                }
            }
        }
    }

    /// Record the timer armed for a `Schedule` decision.
    pub fn arm(&mut self, attempt: u32, timer: JoinHandle<()>) {
        self.clear_pending();
        self.pending = Some(PendingRetry { attempt, timer });
    }

    /// Claim a fired timer. Returns false for timers that were cancelled or superseded.
    pub fn take_due(&mut self, attempt: u32) -> bool {
        match &self.pending {
            Some(p) if p.attempt == attempt => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Back to idle, aborting any armed timer. Used on logout.
    pub fn cancel(&mut self) {
        self.clear_pending();
        self.failures = 0;
        self.state = ReconnectState::Idle;
    }

    fn clear_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            p.timer.abort();
        }
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.clear_pending();
    }
}
