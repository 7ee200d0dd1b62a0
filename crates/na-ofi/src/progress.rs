//! Progress and cancellation: the timed harvest loop over a context's CQ,
//! and the cancel path with its CQ wakeup.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ofi::FabricError;

use crate::context::Context;
use crate::error::Error;
use crate::op::{OpId, OpKind, OP_CANCELED};
use crate::provider::ProvFlags;
use crate::{CQ_EVENT_NUM, MAX_EINTR_RETRY};

impl Context {
    /// Harvest completions for up to `timeout_ms` milliseconds. Returns
    /// `Ok` once at least one event was processed, `Err(Timeout)` when the
    /// deadline elapsed without one. A zero timeout never blocks.
    pub fn progress(&self, timeout_ms: u32) -> Result<(), Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if timeout_ms > 0 {
                // Sleep in the wait set when the provider has one; fd and
                // no-wait providers poll the CQ directly.
                if let Some(wait_set) = &self.res.wait {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let mut retries = 0;
                    loop {
                        match wait_set.wait(remaining) {
                            Ok(true) => break,
                            Ok(false) => return Err(Error::Timeout),
                            Err(FabricError::Interrupted) if retries < MAX_EINTR_RETRY => {
                                retries += 1;
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }

            let events = self.cq_read(CQ_EVENT_NUM)?;
            if events.is_empty() {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                continue;
            }
            for (entry, src, err_addr) in &events {
                self.process_event(entry, *src, err_addr.as_deref())?;
            }
            return Ok(());
        }
    }

    /// Request cancellation of an outstanding operation. Idempotent: ops
    /// that already completed (or were never posted) are left untouched
    /// and the call succeeds.
    pub fn cancel(&self, op: &OpId) -> Result<(), Error> {
        if op
            .inner
            .status
            .compare_exchange(0, OP_CANCELED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        tracing::debug!(cookie = op.inner.cookie, "canceling operation");

        let is_recv = {
            let state = op.inner.state.lock().unwrap();
            match state.kind {
                OpKind::Lookup(_) | OpKind::Idle => {
                    return Err(Error::InvalidArg("operation type cannot be canceled"))
                }
                ref kind => kind.is_recv(),
            }
        };
        let ep = if is_recv { &self.rx } else { &self.tx };

        // Asynchronous: either a canceled event is generated or the
        // operation still completes through the regular path.
        {
            let _guard = self.class.inner.domain.lock_domain();
            if let Err(err) = ep.cancel(op.inner.cookie) {
                tracing::debug!(cookie = op.inner.cookie, %err, "fabric cancel");
            }
        }

        // Wake a blocked progress so the cancel event is observed.
        if !self
            .class
            .inner
            .domain
            .spec
            .flags
            .contains(ProvFlags::SKIP_SIGNAL)
        {
            self.res.cq.signal();
        }
        Ok(())
    }

    /// A pollable descriptor for the context's CQ, when the provider can
    /// produce one.
    pub fn poll_get_fd(&self) -> Option<RawFd> {
        let inner = &self.class.inner;
        if inner.no_wait || inner.domain.spec.flags.contains(ProvFlags::WAIT_SET) {
            return None;
        }
        self.res.cq.wait_fd()
    }

    /// Whether it is safe to block on the descriptor returned by
    /// `poll_get_fd`.
    pub fn poll_try_wait(&self) -> bool {
        let inner = &self.class.inner;
        if inner.no_wait {
            return false;
        }
        let flags = inner.domain.spec.flags;
        if flags.intersects(ProvFlags::WAIT_SET | ProvFlags::TRYWAIT_SAFE) {
            return true;
        }
        match inner.domain.fabric.try_wait(&[self.res.cq.clone()]) {
            Ok(safe) => safe,
            Err(err) => {
                tracing::warn!(%err, "fabric try-wait failed");
                false
            }
        }
    }
}
