//! Operation IDs: reference-counted per-operation state bundles carrying
//! the fabric context cookie, completion callback data and status bits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::Addr;
use crate::{Callback, Tag};

/// Completion has been delivered (or the op was never posted).
pub(crate) const OP_COMPLETED: u32 = 1 << 0;
/// Cancellation won the race against completion.
pub(crate) const OP_CANCELED: u32 = 1 << 1;

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// Raw receive-buffer pointer carried by an in-flight operation.
///
/// The posting contract guarantees the buffer outlives the operation, and
/// that nothing else touches it until the completion is harvested.
pub(crate) struct RawBuf(pub *mut u8);

unsafe impl Send for RawBuf {}

/// Type-tagged per-operation payload.
pub(crate) enum OpKind {
    Idle,
    Lookup(Option<Addr>),
    SendUnexpected,
    SendExpected,
    RecvUnexpected {
        buf: RawBuf,
        buf_size: usize,
        msg_size: usize,
        tag: Tag,
    },
    RecvExpected {
        buf_size: usize,
        msg_size: usize,
        tag: Tag,
    },
    Put,
    Get,
}

impl OpKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            OpKind::Idle => "idle",
            OpKind::Lookup(_) => "lookup",
            OpKind::SendUnexpected => "send_unexpected",
            OpKind::SendExpected => "send_expected",
            OpKind::RecvUnexpected { .. } => "recv_unexpected",
            OpKind::RecvExpected { .. } => "recv_expected",
            OpKind::Put => "put",
            OpKind::Get => "get",
        }
    }

    /// Whether completions for this op arrive on the receive path.
    pub(crate) fn is_recv(&self) -> bool {
        matches!(
            self,
            OpKind::RecvUnexpected { .. } | OpKind::RecvExpected { .. }
        )
    }
}

pub(crate) struct OpState {
    pub kind: OpKind,
    pub callback: Option<Callback>,
    pub addr: Option<Addr>,
}

pub(crate) struct OpInner {
    /// Fabric context cookie; constant across reuses of the op ID.
    pub cookie: u64,
    pub status: AtomicU32,
    pub state: Mutex<OpState>,
}

impl OpInner {
    pub(crate) fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }
}

/// Handle for one outstanding fabric operation, reusable across posts.
pub struct OpId {
    pub(crate) inner: Arc<OpInner>,
}

impl OpId {
    pub(crate) fn create() -> OpId {
        OpId {
            inner: Arc::new(OpInner {
                cookie: NEXT_COOKIE.fetch_add(1, Ordering::SeqCst),
                // Completed by default, ready for the first post.
                status: AtomicU32::new(OP_COMPLETED),
                state: Mutex::new(OpState {
                    kind: OpKind::Idle,
                    callback: None,
                    addr: None,
                }),
            }),
        }
    }

    /// Whether the most recent use of this op has completed.
    pub fn is_completed(&self) -> bool {
        self.inner.status() & OP_COMPLETED != 0
    }

    /// Whether cancellation was observed before completion.
    pub fn is_canceled(&self) -> bool {
        self.inner.status() & OP_CANCELED != 0
    }
}

/// Queue of posted-but-uncompleted unexpected receives.
#[derive(Default)]
pub(crate) struct OpQueue(Mutex<VecDeque<Arc<OpInner>>>);

impl OpQueue {
    pub(crate) fn push(&self, op: Arc<OpInner>) {
        self.0.lock().unwrap().push_back(op);
    }

    /// Remove the op with the given cookie; false if it was not queued.
    pub(crate) fn remove(&self, cookie: u64) -> bool {
        let mut queue = self.0.lock().unwrap();
        match queue.iter().position(|op| op.cookie == cookie) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ops_start_completed_with_unique_cookies() {
        let a = OpId::create();
        let b = OpId::create();
        assert!(a.is_completed());
        assert!(!a.is_canceled());
        assert_ne!(a.inner.cookie, b.inner.cookie);
    }

    #[test]
    fn queue_removal_is_by_cookie() {
        let queue = OpQueue::default();
        let a = OpId::create();
        let b = OpId::create();
        queue.push(a.inner.clone());
        queue.push(b.inner.clone());

        assert!(queue.remove(a.inner.cookie));
        assert!(!queue.remove(a.inner.cookie));
        assert!(!queue.is_empty());
        assert!(queue.remove(b.inner.cookie));
        assert!(queue.is_empty());
    }
}
