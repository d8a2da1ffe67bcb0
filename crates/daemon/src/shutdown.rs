// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Signal handling.
//!
//! The first SIGINT/SIGTERM cancels the returned token so the engine can
//! return in-flight items to the queue. A second signal exits at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for a forced exit, as for an interrupted process.
const FORCED_EXIT_CODE: i32 = 130;

pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    None
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                let term = async {
                    match sigterm.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    r = tokio::signal::ctrl_c() => {
                        if let Err(e) = r {
                            warn!(error = %e, "failed to listen for Ctrl+C");
                            return;
                        }
                    }
                    _ = term => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
            }

            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                info!("shutdown requested; returning in-flight work to the queue");
                handler_token.cancel();
            } else {
                warn!("second signal, exiting immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    });

    token
}
