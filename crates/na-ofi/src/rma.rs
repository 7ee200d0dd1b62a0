//! One-sided transfers between registered regions. Writes request
//! delivery-complete so remote visibility is guaranteed at completion;
//! reads complete on local arrival.

use ofi::{PostFlags, RmaMsg};

use crate::addr::Addr;
use crate::context::Context;
use crate::error::Error;
use crate::mem::MemHandle;
use crate::op::{OpId, OpKind};
use crate::{Callback, SEP_RX_CTX_BITS};

fn check_range(handle: &MemHandle, offset: u64, length: u64) -> Result<(), Error> {
    let end = offset.checked_add(length).ok_or(Error::Overflow)?;
    if end > handle.size() {
        return Err(Error::Overflow);
    }
    Ok(())
}

impl Context {
    fn rma_post(
        &self,
        op: &OpId,
        callback: Callback,
        kind: OpKind,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        remote_addr: &Addr,
        remote_id: u8,
        flags: PostFlags,
    ) -> Result<(), Error> {
        if local.mr().is_none() {
            return Err(Error::InvalidArg("local memory handle is not registered"));
        }
        check_range(local, local_offset, length)?;
        check_range(remote, remote_offset, length)?;
        if remote_addr.fi_addr().is_unspec() {
            return Err(Error::InvalidArg("remote address is unresolved"));
        }

        let write = matches!(kind, OpKind::Put);
        self.post_begin(op, kind, callback, Some(remote_addr))?;
        let msg = RmaMsg {
            local_addr: (local.base() + local_offset) as *mut u8,
            len: length as usize,
            addr: ofi::rx_addr(remote_addr.fi_addr(), remote_id, SEP_RX_CTX_BITS),
            remote_addr: remote.base() + remote_offset,
            remote_key: remote.key(),
            cookie: op.inner.cookie,
        };
        let result = self.post_retry(|| unsafe {
            if write {
                self.tx.writemsg(&msg, flags)
            } else {
                self.tx.readmsg(&msg, flags)
            }
        });
        if let Err(err) = result {
            self.post_abort(op);
            return Err(err);
        }
        Ok(())
    }

    /// Write `length` bytes of the local region into the remote region.
    pub fn put(
        &self,
        op: &OpId,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        remote_addr: &Addr,
        remote_id: u8,
    ) -> Result<(), Error> {
        self.rma_post(
            op,
            callback,
            OpKind::Put,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            remote_id,
            // Delivery-complete: the data is visible at the target when
            // the completion fires.
            PostFlags::COMPLETION | PostFlags::DELIVERY_COMPLETE,
        )
    }

    /// Read `length` bytes of the remote region into the local region.
    pub fn get(
        &self,
        op: &OpId,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        remote_addr: &Addr,
        remote_id: u8,
    ) -> Result<(), Error> {
        self.rma_post(
            op,
            callback,
            OpKind::Get,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            remote_id,
            PostFlags::COMPLETION,
        )
    }
}
