//! Two-sided messaging: unexpected and expected sends/receives over the
//! shared tag space, plus the message-size/header surface.
//!
//! Posted buffers must not be touched until the operation's completion is
//! harvested; pool blocks stay allocated for the life of the plugin, so a
//! violation corrupts data rather than memory.

use ofi::{FabricError, FiAddr};

use crate::addr::Addr;
use crate::context::Context;
use crate::error::Error;
use crate::mem::MsgBuf;
use crate::op::{OpId, OpKind, RawBuf, OP_COMPLETED};
use crate::{
    Callback, Class, Tag, EXPECTED_TAG_FLAG, MAX_TAG, SEP_RX_CTX_BITS, UNEXPECTED_SIZE,
    UNEXPECTED_TAG_IGNORE,
};

impl Class {
    pub fn msg_get_max_unexpected_size(&self) -> usize {
        UNEXPECTED_SIZE
    }

    pub fn msg_get_max_expected_size(&self) -> usize {
        UNEXPECTED_SIZE
    }

    /// Bytes reserved at the head of unexpected messages for providers
    /// that piggyback the source address.
    pub fn msg_get_unexpected_header_size(&self) -> usize {
        if self.inner.domain.with_msg_hdr() {
            crate::codec::SIN_ADDRLEN
        } else {
            0
        }
    }

    pub fn msg_get_max_tag(&self) -> Tag {
        MAX_TAG
    }

    /// Stamp the source-address header into an unexpected-message buffer.
    /// Callers place their payload after `msg_get_unexpected_header_size`
    /// bytes.
    pub fn msg_init_unexpected(&self, buf: &mut MsgBuf) -> Result<(), Error> {
        if !self.inner.domain.with_msg_hdr() {
            return Ok(());
        }
        let header = self.inner.endpoint.src_addr.ensure_native()?;
        if buf.size() <= header.len() {
            return Err(Error::Overflow);
        }
        buf[..header.len()].copy_from_slice(&header);
        Ok(())
    }
}

impl Context {
    /// Install the per-post state on an op and publish it to the in-flight
    /// table. The caller contract requires the op to be COMPLETED.
    pub(crate) fn post_begin(
        &self,
        op: &OpId,
        kind: OpKind,
        callback: Callback,
        peer: Option<&Addr>,
    ) -> Result<(), Error> {
        if op.inner.status() & OP_COMPLETED == 0 {
            return Err(Error::Busy);
        }
        {
            let mut state = op.inner.state.lock().unwrap();
            state.kind = kind;
            state.callback = Some(callback);
            state.addr = peer.cloned();
        }
        op.inner
            .status
            .store(0, std::sync::atomic::Ordering::SeqCst);
        self.res
            .inflight
            .lock()
            .unwrap()
            .insert(op.inner.cookie, op.inner.clone());
        Ok(())
    }

    /// Undo `post_begin` after a failed post: every refcount and status
    /// change is reverted so the error leaves external state unchanged.
    pub(crate) fn post_abort(&self, op: &OpId) {
        self.res.inflight.lock().unwrap().remove(&op.inner.cookie);
        {
            let mut state = op.inner.state.lock().unwrap();
            state.kind = OpKind::Idle;
            state.callback = None;
            state.addr = None;
        }
        op.inner
            .status
            .store(OP_COMPLETED, std::sync::atomic::Ordering::SeqCst);
    }

    /// Drive the post until the fabric stops reporting back-pressure,
    /// running a zero-timeout progress tick between attempts.
    pub(crate) fn post_retry(
        &self,
        mut post: impl FnMut() -> ofi::Result<()>,
    ) -> Result<(), Error> {
        loop {
            match post() {
                Ok(()) => return Ok(()),
                Err(FabricError::Again) => match self.progress(0) {
                    Ok(()) | Err(Error::Timeout) => {}
                    Err(err) => return Err(err),
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send an unexpected (eagerly matched) message of `size` bytes from
    /// `buf` to `dest`.
    pub fn msg_send_unexpected(
        &self,
        op: &OpId,
        callback: Callback,
        buf: &MsgBuf,
        size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<(), Error> {
        if size > self.class.msg_get_max_unexpected_size() {
            return Err(Error::MsgSize);
        }
        if size > buf.size() {
            return Err(Error::Overflow);
        }
        if tag > MAX_TAG {
            return Err(Error::InvalidArg("tag exceeds the tag space"));
        }
        if dest.fi_addr().is_unspec() {
            return Err(Error::InvalidArg("destination address is unresolved"));
        }

        self.post_begin(op, OpKind::SendUnexpected, callback, Some(dest))?;
        let fi_addr = ofi::rx_addr(dest.fi_addr(), dest_id, SEP_RX_CTX_BITS);
        let ptr = buf.as_ptr();
        let cookie = op.inner.cookie;
        let result =
            self.post_retry(|| unsafe { self.tx.tsend(ptr, size, fi_addr, tag as u64, cookie) });
        if let Err(err) = result {
            self.post_abort(op);
            return Err(err);
        }
        Ok(())
    }

    /// Post a receive for the next unexpected message from any peer.
    pub fn msg_recv_unexpected(
        &self,
        op: &OpId,
        callback: Callback,
        buf: &mut MsgBuf,
    ) -> Result<(), Error> {
        let buf_size = buf.size();
        let ptr = buf.as_mut_ptr();
        self.post_begin(
            op,
            OpKind::RecvUnexpected {
                buf: RawBuf(ptr),
                buf_size,
                msg_size: 0,
                tag: 0,
            },
            callback,
            None,
        )?;
        self.res.unexpected.push(op.inner.clone());

        let cookie = op.inner.cookie;
        // Tag value 1 is arbitrary: any low bit distinguishes unexpected
        // posts from expected ones, and the ignore mask drops the rest.
        let result = self.post_retry(|| unsafe {
            self.rx
                .trecv(ptr, buf_size, FiAddr::UNSPEC, 1, UNEXPECTED_TAG_IGNORE, cookie)
        });
        if let Err(err) = result {
            self.res.unexpected.remove(op.inner.cookie);
            self.post_abort(op);
            return Err(err);
        }
        Ok(())
    }

    /// Send an expected (pre-posted match) message with the given tag.
    pub fn msg_send_expected(
        &self,
        op: &OpId,
        callback: Callback,
        buf: &MsgBuf,
        size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<(), Error> {
        if size > self.class.msg_get_max_expected_size() {
            return Err(Error::MsgSize);
        }
        if size > buf.size() {
            return Err(Error::Overflow);
        }
        if tag > MAX_TAG {
            return Err(Error::InvalidArg("tag exceeds the tag space"));
        }
        if dest.fi_addr().is_unspec() {
            return Err(Error::InvalidArg("destination address is unresolved"));
        }

        self.post_begin(op, OpKind::SendExpected, callback, Some(dest))?;
        let fi_addr = ofi::rx_addr(dest.fi_addr(), dest_id, SEP_RX_CTX_BITS);
        let ptr = buf.as_ptr();
        let cookie = op.inner.cookie;
        let result = self.post_retry(|| unsafe {
            self.tx
                .tsend(ptr, size, fi_addr, EXPECTED_TAG_FLAG | tag as u64, cookie)
        });
        if let Err(err) = result {
            self.post_abort(op);
            return Err(err);
        }
        Ok(())
    }

    /// Post a receive matching only messages from `source` with exactly
    /// `tag`.
    pub fn msg_recv_expected(
        &self,
        op: &OpId,
        callback: Callback,
        buf: &mut MsgBuf,
        source: &Addr,
        source_id: u8,
        tag: Tag,
    ) -> Result<(), Error> {
        if tag > MAX_TAG {
            return Err(Error::InvalidArg("tag exceeds the tag space"));
        }
        if source.fi_addr().is_unspec() {
            return Err(Error::InvalidArg("source address is unresolved"));
        }

        let buf_size = buf.size();
        let ptr = buf.as_mut_ptr();
        self.post_begin(
            op,
            OpKind::RecvExpected {
                buf_size,
                msg_size: 0,
                tag,
            },
            callback,
            Some(source),
        )?;
        let fi_addr = ofi::rx_addr(source.fi_addr(), source_id, SEP_RX_CTX_BITS);
        let cookie = op.inner.cookie;
        let result = self.post_retry(|| unsafe {
            self.rx
                .trecv(ptr, buf_size, fi_addr, EXPECTED_TAG_FLAG | tag as u64, 0, cookie)
        });
        if let Err(err) = result {
            self.post_abort(op);
            return Err(err);
        }
        Ok(())
    }
}
