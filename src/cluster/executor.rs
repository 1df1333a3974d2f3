//! Per-call orchestration.
//!
//! One call flows reset → tag → bind → prime and submit → drive → validate.
//! Any failure aborts the whole call: in-flight backends get a best-effort
//! remote cancel, per-call state is cleared, and the error is re-raised to
//! the host.

use std::time::{Duration, Instant};

use tokio::time;
use tracing::{debug, warn};

use crate::cluster::{binder, poll_loop, tagger, Cluster, ClusterResults, PartitionResult};
use crate::conn::{protocol, CallCtx, ConnState};
use crate::error::{Error, Result};
use crate::function::ProxyFunction;
use crate::host::HashSource;
use crate::types::PgValue;

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

impl Cluster {
    /// Executes one fanned-out call and returns the union of its results.
    ///
    /// `hash` is required for functions that route by hash; it is the host's
    /// prepared-statement cache over the routing queries. The cluster is
    /// busy for exactly the duration of this method, and re-entry through
    /// the host while a call is in progress fails fast.
    pub async fn execute(
        &mut self,
        func: &ProxyFunction,
        args: &[PgValue],
        hash: Option<&mut dyn HashSource>,
    ) -> Result<ClusterResults> {
        func.validate(args.len())?;
        if self.busy {
            return Err(Error::busy(self.name.clone()));
        }
        self.busy = true;
        let outcome = self.execute_inner(func, args, hash).await;
        if let Err(cause) = &outcome {
            self.cancel_and_clean(cause).await;
        }
        self.busy = false;
        outcome
    }

    async fn execute_inner(
        &mut self,
        func: &ProxyFunction,
        args: &[PgValue],
        hash: Option<&mut dyn HashSource>,
    ) -> Result<ClusterResults> {
        let arg_count = func.arg_count();
        let param_count = func.query.param_count();
        for conn in &mut self.conn_list {
            conn.reset_call_state(arg_count, param_count);
        }

        tagger::tag_partitions(self, func, args, hash)?;
        binder::bind_params(self, func, args)?;

        let binary_results = !self.options.disable_binary && func.ret_type.binary_recv_ok();
        let name = self.name.clone();
        let Cluster {
            ref mut conn_list,
            ref options,
            ref hooks,
            ..
        } = *self;
        let ctx = CallCtx {
            func,
            options,
            hooks: hooks.as_ref(),
            binary_results,
        };

        let now = Instant::now();
        let mut armed = 0usize;
        for conn in conn_list.iter_mut().filter(|c| c.armed()) {
            armed += 1;
            conn.prepare(&ctx, now)?;
            if conn.state == ConnState::Ready && !conn.submitted {
                conn.submit_query(&ctx)?;
            }
        }
        debug!(cluster = %name, function = %func.name, armed, "executing");

        while conn_list
            .iter()
            .any(|c| c.armed() && c.state != ConnState::Done)
        {
            if ctx.hooks.is_canceled() {
                return Err(Error::canceled());
            }
            poll_loop::poll_step(conn_list, &ctx).await?;

            let now = Instant::now();
            for conn in conn_list.iter_mut().filter(|c| c.armed()) {
                // A connection falling back to Ready here finished its
                // tuning round trip and still owes this call its query.
                if conn.state == ConnState::Ready && !conn.submitted {
                    conn.submit_query(&ctx)?;
                }
                conn.check_timeouts(ctx.options, now)?;
            }
        }

        let mut partitions = Vec::with_capacity(armed);
        let mut ret_total = 0u64;
        for (ci, conn) in conn_list.iter_mut().enumerate() {
            if conn.armed() {
                if conn.state != ConnState::Done {
                    return Err(Error::internal("armed connection did not finish")
                        .with_partition(conn.label()));
                }
                let result = conn.take_result().ok_or_else(|| {
                    Error::internal("armed connection produced no result")
                        .with_partition(conn.label())
                })?;
                ret_total += result.row_count() as u64;
                partitions.push(PartitionResult {
                    connection: ci,
                    result,
                });
            } else if conn.has_result() {
                return Err(Error::internal("result on an unarmed connection")
                    .with_partition(conn.label()));
            }
            conn.clear_call_state();
        }

        debug!(cluster = %name, function = %func.name, ret_total, "call complete");
        Ok(ClusterResults {
            ret_total,
            partitions,
        })
    }

    /// Abort path: cancel whatever is still in flight, then clear every
    /// connection's per-call state so the next call starts clean.
    async fn cancel_and_clean(&mut self, cause: &Error) {
        for conn in &mut self.conn_list {
            if conn.in_flight() {
                if let Some((addr, pid, key)) = conn.cancel_target() {
                    match time::timeout(CANCEL_TIMEOUT, protocol::send_cancel(addr, pid, key))
                        .await
                    {
                        Ok(Ok(())) => {
                            debug!(partition = %conn.connstr(), "sent remote cancel")
                        }
                        Ok(Err(e)) => {
                            warn!(partition = %conn.connstr(), error = %e, "remote cancel failed")
                        }
                        Err(_) => {
                            warn!(partition = %conn.connstr(), "remote cancel timed out")
                        }
                    }
                }
            }
            conn.clear_call_state();
        }
        debug!(cluster = %self.name, error = %cause, "call aborted");
    }
}
