//! The readiness multiplexer driving all armed connections of one call.
//!
//! One step waits for any armed connection's socket to become ready for the
//! operation its state needs, then advances every connection that reported
//! an event. The one-second tick bounds the wait so deadline checks and host
//! cancellation polls run even when no socket is active.

use std::time::Duration;

use futures_util::future::{self, FutureExt};
use tokio::time;

use crate::conn::{CallCtx, PartitionConnection};
use crate::error::{Error, Result};

pub(crate) const POLL_TICK: Duration = Duration::from_secs(1);

/// Runs one poll-loop iteration over the armed connections.
pub(crate) async fn poll_step(
    conns: &mut [PartitionConnection],
    ctx: &CallCtx<'_>,
) -> Result<()> {
    let ready = {
        let mut waiters = Vec::new();
        for (idx, conn) in conns.iter().enumerate() {
            if !conn.armed() {
                continue;
            }
            let Some(interest) = conn.interest() else {
                continue;
            };
            let Some(stream) = conn.stream() else {
                continue;
            };
            waiters.push(async move { stream.ready(interest).await.map(|_| idx) }.boxed());
        }

        if waiters.is_empty() {
            // Nothing pollable; sleep one tick so the caller still gets its
            // cancellation and deadline pass.
            time::sleep(POLL_TICK).await;
            Vec::new()
        } else {
            tokio::select! {
                () = time::sleep(POLL_TICK) => Vec::new(),
                (first, _, rest) = future::select_all(waiters) => {
                    let mut ready = vec![first.map_err(Error::from)?];
                    for waiter in rest {
                        if let Some(outcome) = waiter.now_or_never() {
                            ready.push(outcome.map_err(Error::from)?);
                        }
                    }
                    ready
                }
            }
        }
    };

    for idx in ready {
        let label = conns[idx].label();
        conns[idx].advance(ctx).map_err(|e| e.with_partition(label))?;
    }
    Ok(())
}
