pub mod relay;

use anyhow::{Result, bail};
use relaychat::transport::Dialer;
use relaychat::{ClientRuntime, Notification, RelayApi};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default wait used by flow tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Drive `rt` one event at a time until `done` holds, or timeout.
pub async fn step_until<A, D>(
    rt: &mut ClientRuntime<A, D>,
    timeout: Duration,
    mut done: impl FnMut(&ClientRuntime<A, D>) -> bool,
) -> Result<()>
where
    A: RelayApi,
    D: Dialer,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !done(&*rt) {
        match tokio::time::timeout_at(deadline, rt.next_event()).await {
            Ok(event) => rt.handle(event),
            Err(_) => bail!("condition not reached within {timeout:?}"),
        }
    }
    Ok(())
}

/// Keep the runtime stepping for `period`, applying whatever arrives.
pub async fn step_for<A, D>(rt: &mut ClientRuntime<A, D>, period: Duration)
where
    A: RelayApi,
    D: Dialer,
{
    let deadline = tokio::time::Instant::now() + period;
    while let Ok(event) = tokio::time::timeout_at(deadline, rt.next_event()).await {
        rt.handle(event);
    }
}

/// Receive notifications until one matches `pred`, or timeout.
pub async fn wait_for_notification(
    notes: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
    mut pred: impl FnMut(&Notification) -> bool,
) -> Result<Notification> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, notes.recv()).await {
            Ok(Some(n)) if pred(&n) => return Ok(n),
            Ok(Some(_)) => continue,
            Ok(None) => bail!("notification channel closed"),
            Err(_) => bail!("notification not received within {timeout:?}"),
        }
    }
}

/// Poll `check` until it returns true, or timeout.
pub async fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("relaychat=debug,relaychat_tests=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
