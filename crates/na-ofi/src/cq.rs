//! The completion engine: harvests tagged CQ events (or error entries),
//! routes them to per-operation completion, learns unknown source
//! addresses, and posts completions to the consumer's queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ofi::{CqEntry, CqError, CqErrorKind, CqRead, EntryFlags, FiAddr, Format};

use crate::addr::Addr;
use crate::codec::SIN_ADDRLEN;
use crate::context::Context;
use crate::error::Error;
use crate::op::{OpInner, OpKind, OP_CANCELED, OP_COMPLETED};
use crate::{
    Completion, CompletionInfo, Tag, CQ_MAX_ERR_DATA, EXPECTED_TAG_FLAG, MAX_TAG,
    UNEXPECTED_TAG_IGNORE,
};

/// One harvested event: the entry, its attributed source, and the native
/// source bytes recovered from an error completion, if any.
pub(crate) type Harvested = (CqEntry, FiAddr, Option<Vec<u8>>);

impl Context {
    /// Read up to `max` events from the context's CQ, triaging any pending
    /// error entry first.
    pub(crate) fn cq_read(&self, max: usize) -> Result<Vec<Harvested>, Error> {
        match self.res.cq.read_from(max) {
            Ok(CqRead::Events(events)) => Ok(events
                .into_iter()
                .map(|(entry, src)| (entry, src, None))
                .collect()),
            Ok(CqRead::Empty) => Ok(Vec::new()),
            Ok(CqRead::ErrAvail) => {
                let err = self.res.cq.read_err().map_err(Error::from)?;
                self.triage_cq_error(err)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn triage_cq_error(&self, err: CqError) -> Result<Vec<Harvested>, Error> {
        match err.kind {
            CqErrorKind::Canceled => {
                let op = self
                    .res
                    .inflight
                    .lock()
                    .unwrap()
                    .get(&err.entry.cookie)
                    .cloned();
                let op = match op {
                    Some(op) => op,
                    None => {
                        tracing::warn!(
                            cookie = err.entry.cookie,
                            "canceled event for unknown operation"
                        );
                        return Ok(Vec::new());
                    }
                };
                let status = op.status();
                if status & OP_COMPLETED != 0 {
                    return Err(Error::Fault("canceled operation already completed"));
                }
                if status & OP_CANCELED == 0 {
                    return Err(Error::Fault("cancel event without a cancel request"));
                }
                tracing::debug!(cookie = op.cookie, "harvested cancel event");
                let unexpected_recv =
                    matches!(op.state.lock().unwrap().kind, OpKind::RecvUnexpected { .. });
                if unexpected_recv {
                    self.res.unexpected.remove(op.cookie);
                }
                self.complete(op, Err(Error::Canceled));
                Ok(Vec::new())
            }
            CqErrorKind::AddrNotAvail => {
                // An unexpected message arrived from a peer the AV does not
                // know. Learn the address from the error data and fold the
                // entry back into the regular dispatch path.
                let mut err_data = err.err_data;
                err_data.truncate(CQ_MAX_ERR_DATA);
                let fi_addr = self.class.inner.domain.av_insert_direct(&err_data)?;
                Ok(vec![(err.entry, fi_addr, Some(err_data))])
            }
            CqErrorKind::Io => Err(Error::Protocol(
                "fabric reported an I/O error completion".to_string(),
            )),
            CqErrorKind::Other(code) => {
                // The affected operation, if any, reports through another
                // path or was aborted.
                tracing::warn!(code, "ignoring unhandled fabric error completion");
                Ok(Vec::new())
            }
        }
    }

    /// Dispatch one harvested event to its operation and complete it.
    pub(crate) fn process_event(
        &self,
        entry: &CqEntry,
        src: FiAddr,
        err_addr: Option<&[u8]>,
    ) -> Result<(), Error> {
        let op = self
            .res
            .inflight
            .lock()
            .unwrap()
            .get(&entry.cookie)
            .cloned()
            .ok_or(Error::Fault("completion for unknown operation"))?;
        if op.status() & OP_COMPLETED != 0 {
            return Err(Error::Fault("operation already completed"));
        }

        if entry.flags.contains(EntryFlags::SEND) {
            self.process_send(&op)?;
        } else if entry.flags.contains(EntryFlags::RECV) {
            if entry.tag & !UNEXPECTED_TAG_IGNORE != 0 {
                self.process_recv_expected(&op, entry)?;
            } else {
                self.process_recv_unexpected(&op, entry, src, err_addr)?;
            }
        } else if entry.flags.contains(EntryFlags::RMA) {
            self.process_rma(&op)?;
        } else {
            return Err(Error::ProtocolNotSupported(
                "unsupported CQ entry flags".to_string(),
            ));
        }

        self.complete(op, Ok(()));
        Ok(())
    }

    fn process_send(&self, op: &Arc<OpInner>) -> Result<(), Error> {
        let state = op.state.lock().unwrap();
        match state.kind {
            OpKind::SendUnexpected | OpKind::SendExpected => Ok(()),
            _ => Err(Error::Protocol(format!(
                "send completion for a {} operation",
                state.kind.name()
            ))),
        }
    }

    fn process_recv_expected(&self, op: &Arc<OpInner>, entry: &CqEntry) -> Result<(), Error> {
        let mut state = op.state.lock().unwrap();
        match &mut state.kind {
            OpKind::RecvExpected { msg_size, tag, .. } => {
                if *tag as u64 != entry.tag & !EXPECTED_TAG_FLAG {
                    return Err(Error::InvalidArg("tag mismatch on expected receive"));
                }
                *msg_size = entry.len;
                Ok(())
            }
            _ => Err(Error::InvalidArg(
                "expected-receive completion for another operation type",
            )),
        }
    }

    fn process_recv_unexpected(
        &self,
        op: &Arc<OpInner>,
        entry: &CqEntry,
        src: FiAddr,
        err_addr: Option<&[u8]>,
    ) -> Result<(), Error> {
        if entry.tag > MAX_TAG as u64 {
            return Err(Error::Overflow);
        }

        // Capture the receive-buffer view before any blocking resolution.
        let (buf_ptr, buf_size) = {
            let state = op.state.lock().unwrap();
            match &state.kind {
                OpKind::RecvUnexpected { buf, buf_size, .. } => (buf.0, *buf_size),
                _ => {
                    return Err(Error::InvalidArg(
                        "unexpected-receive completion for another operation type",
                    ))
                }
            }
        };
        if entry.len > buf_size {
            return Err(Error::Overflow);
        }

        let domain = &self.class.inner.domain;
        let source = if !src.is_unspec() {
            // The AV attributed the sender; native bytes can be recovered
            // lazily when needed.
            Addr::alloc(domain.clone(), src, 0, None, None, false)
        } else if let Some(bytes) = err_addr {
            let (fi_addr, key) = domain.cache_lookup(domain.spec.format, bytes)?;
            Addr::alloc(domain.clone(), fi_addr, key, None, None, false)
        } else if domain.with_msg_hdr() {
            // The sender stamped its socket address into the message head.
            if entry.len < SIN_ADDRLEN {
                return Err(Error::ProtocolNotSupported(
                    "unexpected message too short for its address header".to_string(),
                ));
            }
            let blob = unsafe { std::slice::from_raw_parts(buf_ptr, SIN_ADDRLEN) }.to_vec();
            let (fi_addr, key) = domain.cache_lookup(Format::Sin, &blob)?;
            Addr::alloc(domain.clone(), fi_addr, key, None, None, false)
        } else {
            return Err(Error::ProtocolNotSupported(
                "insufficient source address information".to_string(),
            ));
        };

        {
            let mut state = op.state.lock().unwrap();
            if let OpKind::RecvUnexpected { msg_size, tag, .. } = &mut state.kind {
                *msg_size = entry.len;
                *tag = entry.tag as Tag;
            }
            state.addr = Some(source);
        }
        self.res.unexpected.remove(op.cookie);
        Ok(())
    }

    fn process_rma(&self, op: &Arc<OpInner>) -> Result<(), Error> {
        let state = op.state.lock().unwrap();
        match state.kind {
            OpKind::Put | OpKind::Get => Ok(()),
            _ => Err(Error::Protocol(format!(
                "RMA completion for a {} operation",
                state.kind.name()
            ))),
        }
    }

    /// Mark the operation completed and post its completion to the
    /// consumer queue. The canceled bit, when set, overrides a successful
    /// result.
    pub(crate) fn complete(&self, op: Arc<OpInner>, result: Result<(), Error>) {
        self.res.inflight.lock().unwrap().remove(&op.cookie);

        let prev = op.status.fetch_or(OP_COMPLETED, Ordering::SeqCst);
        let canceled = prev & OP_CANCELED != 0;
        let mut result = if canceled && result.is_ok() {
            Err(Error::Canceled)
        } else {
            result
        };

        let (kind, callback, addr) = {
            let mut state = op.state.lock().unwrap();
            (
                std::mem::replace(&mut state.kind, OpKind::Idle),
                state.callback.take(),
                state.addr.take(),
            )
        };

        // For operations with a peer (sends, expected receives, RMA) the
        // reference taken at post time is released below; unexpected
        // receives hand their source to the consumer instead.
        let mut release_peer = addr;

        let info = match kind {
            OpKind::Idle => {
                tracing::warn!(cookie = op.cookie, "dropping completion of idle operation");
                return;
            }
            OpKind::Lookup(looked_up) => match looked_up {
                Some(addr) => CompletionInfo::Lookup { addr },
                None => {
                    tracing::warn!(cookie = op.cookie, "dropping unresolved lookup completion");
                    return;
                }
            },
            OpKind::SendUnexpected => CompletionInfo::SendUnexpected,
            OpKind::SendExpected => CompletionInfo::SendExpected,
            OpKind::RecvUnexpected { msg_size, tag, .. } => CompletionInfo::RecvUnexpected {
                source: release_peer.take(),
                tag,
                actual_size: msg_size,
            },
            OpKind::RecvExpected {
                buf_size, msg_size, ..
            } => {
                if msg_size > buf_size && result.is_ok() {
                    result = Err(Error::MsgSize);
                }
                CompletionInfo::RecvExpected {
                    actual_size: msg_size,
                }
            }
            OpKind::Put => CompletionInfo::Put,
            OpKind::Get => CompletionInfo::Get,
        };
        drop(release_peer);

        self.completions.push(Completion {
            result,
            info,
            callback,
            _op: op,
        });
    }
}
