//! OS termination signals.

use std::future::Future;
use std::pin::Pin;

use strum::Display;

/// A signal that can trigger a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C.
    #[strum(serialize = "SIGINT")]
    Interrupt,
    /// SIGTERM.
    #[strum(serialize = "SIGTERM")]
    Terminate,
    /// SIGHUP.
    #[strum(serialize = "SIGHUP")]
    Hangup,
    /// SIGQUIT.
    #[strum(serialize = "SIGQUIT")]
    Quit,
}

/// Signals used when the caller names none.
pub const DEFAULT_SIGNALS: [ShutdownSignal; 2] = [ShutdownSignal::Interrupt, ShutdownSignal::Terminate];

type SignalFuture = Pin<Box<dyn Future<Output = ShutdownSignal> + Send>>;

#[cfg(unix)]
fn listen(signal: ShutdownSignal) -> std::io::Result<SignalFuture> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let kind = match signal {
        ShutdownSignal::Interrupt => SignalKind::interrupt(),
        ShutdownSignal::Terminate => SignalKind::terminate(),
        ShutdownSignal::Hangup => SignalKind::hangup(),
        ShutdownSignal::Quit => SignalKind::quit(),
    };
    let mut stream = unix_signal(kind)?;
    Ok(Box::pin(async move {
        stream.recv().await;
        signal
    }))
}

#[cfg(not(unix))]
fn listen(signal: ShutdownSignal) -> std::io::Result<SignalFuture> {
    let wait: SignalFuture = match signal {
        ShutdownSignal::Interrupt => Box::pin(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal
        }),
        _ => Box::pin(std::future::pending()),
    };
    Ok(wait)
}

/// Wait until one of `signals` arrives. An empty list means
/// [`DEFAULT_SIGNALS`].
///
/// Handlers are installed before the returned future is first polled, so a
/// signal arriving after this call returns is not missed.
pub fn wait_for(
    signals: &[ShutdownSignal],
) -> std::io::Result<impl Future<Output = ShutdownSignal> + Send> {
    let signals = if signals.is_empty() {
        &DEFAULT_SIGNALS[..]
    } else {
        signals
    };
    let waits = signals
        .iter()
        .map(|s| listen(*s))
        .collect::<std::io::Result<Vec<_>>>()?;

    Ok(async move {
        let (signal, _, _) = futures::future::select_all(waits).await;
        signal
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolves_with_the_signal_that_arrived() {
        let wait = wait_for(&[ShutdownSignal::Hangup]).unwrap();
        let pid = std::process::id();
        std::process::Command::new("kill")
            .args(["-HUP", &pid.to_string()])
            .status()
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), wait)
            .await
            .unwrap();
        assert_eq!(received, ShutdownSignal::Hangup);
    }
}
