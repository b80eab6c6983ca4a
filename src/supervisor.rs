//! Termination handling.
//!
//! The first SIGINT/SIGTERM cancels the graceful token: crawlers and the
//! enqueuer stop promptly while an in-flight fetch is allowed to finish.
//! The second cancels the critical token, interrupting the fetch. The third
//! exits the process immediately.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct Signals {
    pub graceful: CancellationToken,
    pub critical: CancellationToken,
}

/// Install the signal listener and hand out the two shutdown tokens.
pub fn install() -> std::io::Result<Signals> {
    let graceful = CancellationToken::new();
    let critical = CancellationToken::new();

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let graceful_out = graceful.clone();
    let critical_out = critical.clone();
    tokio::spawn(async move {
        let mut count = 0u32;
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }

            match count {
                0 => {
                    warn!("graceful termination, send again to interrupt the running fetch");
                    graceful_out.cancel();
                }
                1 => {
                    warn!("hard termination, one more signal exits immediately");
                    critical_out.cancel();
                }
                _ => {
                    warn!("forced termination");
                    std::process::exit(1);
                }
            }
            count += 1;
        }
    });

    Ok(Signals { graceful, critical })
}
