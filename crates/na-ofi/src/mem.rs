//! Registered memory: the message-buffer pool (page-aligned, pre-registered
//! fixed-size blocks with a FIFO free list) and RMA memory handles with
//! their serializable descriptors.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use ofi::{Access, MrMode};

use crate::domain::Domain;
use crate::error::Error;
use crate::{Class, MEM_BLOCK_COUNT};

const PAGE_SIZE: usize = 4096;

/// Serialized descriptor layout: `[base: 8][size: 8][key: 8][access: 1]`.
pub(crate) const MEM_DESC_SIZE: usize = 25;

struct Slab {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The slab is only handed out in disjoint blocks guarded by the free list.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Drop for Slab {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Pool of registered fixed-size blocks. The block size never grows; a
/// request larger than the block size fails.
pub(crate) struct MemPool {
    pub(crate) block_size: usize,
    /// Slab-wide registration, held for the life of the pool.
    _mr: Option<Arc<dyn ofi::MemoryRegion>>,
    free: Mutex<VecDeque<usize>>,
    slab: Slab,
}

impl MemPool {
    pub(crate) fn create(
        domain: &Domain,
        block_size: usize,
        block_count: usize,
    ) -> Result<Arc<MemPool>, Error> {
        let total = block_size
            .checked_mul(block_count)
            .ok_or(Error::InvalidArg("pool size overflow"))?;
        let layout = Layout::from_size_align(total, PAGE_SIZE)
            .map_err(|_| Error::InvalidArg("bad pool layout"))?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(Error::NoMem)?;
        let slab = Slab { ptr, layout };

        // Register the whole slab once when the provider requires local
        // registration of transfer buffers.
        let mr = if domain.info.mr_mode.contains(MrMode::LOCAL) {
            Some(domain.raw.register(
                ptr.as_ptr() as u64,
                total as u64,
                Access::READ
                    | Access::WRITE
                    | Access::REMOTE_READ
                    | Access::REMOTE_WRITE
                    | Access::SEND
                    | Access::RECV,
                0,
            )?)
        } else {
            None
        };

        Ok(Arc::new(MemPool {
            block_size,
            _mr: mr,
            free: Mutex::new((0..block_count).collect()),
            slab,
        }))
    }

    pub(crate) fn has_free(&self) -> bool {
        !self.free.lock().unwrap().is_empty()
    }

    fn try_pop(&self) -> Option<usize> {
        self.free.lock().unwrap().pop_front()
    }

    fn push(&self, index: usize) {
        self.free.lock().unwrap().push_back(index);
    }

    fn block_ptr(&self, index: usize) -> NonNull<u8> {
        // Safe: index is bounded by the block count at construction.
        unsafe { NonNull::new_unchecked(self.slab.ptr.as_ptr().add(index * self.block_size)) }
    }
}

/// A message buffer borrowed from the pool. Returned to its pool's free
/// list when dropped; moving it into `msg_buf_free` makes double frees
/// unrepresentable.
pub struct MsgBuf {
    ptr: NonNull<u8>,
    size: usize,
    pool: Arc<MemPool>,
    index: usize,
}

unsafe impl Send for MsgBuf {}

impl MsgBuf {
    /// Usable capacity of the buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for MsgBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for MsgBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for MsgBuf {
    fn drop(&mut self) {
        self.pool.push(self.index);
    }
}

/// RMA access modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn to_u8(self) -> u8 {
        match self {
            AccessMode::ReadOnly => 1,
            AccessMode::WriteOnly => 2,
            AccessMode::ReadWrite => 3,
        }
    }

    fn from_u8(value: u8) -> Result<AccessMode, Error> {
        match value {
            1 => Ok(AccessMode::ReadOnly),
            2 => Ok(AccessMode::WriteOnly),
            3 => Ok(AccessMode::ReadWrite),
            _ => Err(Error::InvalidArg("bad access mode in descriptor")),
        }
    }
}

/// Local/remote RMA descriptor. Valid for transfers between `register`
/// and `deregister`; deserialized handles describe a remote region and
/// carry no local registration.
pub struct MemHandle {
    base: u64,
    size: u64,
    access: AccessMode,
    key: AtomicU64,
    mr: Mutex<Option<Arc<dyn ofi::MemoryRegion>>>,
}

impl MemHandle {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// The remote key, valid once registered (or deserialized).
    pub fn key(&self) -> u64 {
        self.key.load(Ordering::SeqCst)
    }

    pub(crate) fn mr(&self) -> Option<Arc<dyn ofi::MemoryRegion>> {
        self.mr.lock().unwrap().clone()
    }
}

impl Class {
    /// Borrow a registered message buffer from the pool, creating the
    /// first pool lazily.
    pub fn msg_buf_alloc(&self, size: usize) -> Result<MsgBuf, Error> {
        loop {
            let pool = {
                let mut pools = self.inner.pools.lock().unwrap();
                match pools.iter().find(|pool| pool.has_free()).cloned() {
                    Some(pool) => pool,
                    None => {
                        let pool = MemPool::create(
                            &self.inner.domain,
                            self.msg_get_max_unexpected_size(),
                            MEM_BLOCK_COUNT,
                        )?;
                        tracing::debug!(
                            block_size = pool.block_size,
                            blocks = MEM_BLOCK_COUNT,
                            "created message buffer pool"
                        );
                        pools.push(pool.clone());
                        pool
                    }
                }
            };
            if size > pool.block_size {
                return Err(Error::MsgSize);
            }
            // The free list may have drained since the scan; retry with a
            // fresh pool in that case.
            if let Some(index) = pool.try_pop() {
                return Ok(MsgBuf {
                    ptr: pool.block_ptr(index),
                    size: pool.block_size,
                    pool,
                    index,
                });
            }
        }
    }

    pub fn msg_buf_free(&self, buf: MsgBuf) {
        drop(buf);
    }

    /// Describe a local region for RMA.
    ///
    /// # Safety
    /// The region `base .. base + size` must stay valid (and exclusively
    /// owned for write access) until the handle is deregistered and all
    /// transfers naming it have completed.
    pub unsafe fn mem_handle_create(
        &self,
        base: *mut u8,
        size: usize,
        access: AccessMode,
    ) -> Result<MemHandle, Error> {
        if base.is_null() || size == 0 {
            return Err(Error::InvalidArg("empty memory region"));
        }
        Ok(MemHandle {
            base: base as u64,
            size: size as u64,
            access,
            key: AtomicU64::new(0),
            mr: Mutex::new(None),
        })
    }

    pub fn mem_handle_free(&self, handle: MemHandle) {
        drop(handle);
    }

    /// Register the handle's region. Providers without physically-backed
    /// registration adopt the domain's global registration and key.
    pub fn mem_register(&self, handle: &MemHandle) -> Result<(), Error> {
        let domain = &self.inner.domain;
        if !domain.info.mr_mode.contains(MrMode::ALLOCATED) {
            handle.key.store(domain.mr_key, Ordering::SeqCst);
            *handle.mr.lock().unwrap() = domain.global_mr.clone();
            return Ok(());
        }

        let access = match handle.access {
            AccessMode::ReadOnly => Access::REMOTE_READ | Access::WRITE,
            AccessMode::WriteOnly => Access::REMOTE_WRITE | Access::READ,
            AccessMode::ReadWrite => {
                Access::READ | Access::WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE
            }
        };
        let base = if domain.info.mr_mode.contains(MrMode::VIRT_ADDR) {
            handle.base
        } else {
            0
        };
        let mr = domain.raw.register(base, handle.size, access, 0)?;
        handle.key.store(mr.key(), Ordering::SeqCst);
        *handle.mr.lock().unwrap() = Some(mr);
        Ok(())
    }

    /// Drop the handle's registration. Only locally created registrations
    /// actually close; the domain's global registration stays shared.
    pub fn mem_deregister(&self, handle: &MemHandle) -> Result<(), Error> {
        handle.mr.lock().unwrap().take();
        Ok(())
    }

    pub fn mem_handle_get_serialize_size(&self, _handle: &MemHandle) -> usize {
        MEM_DESC_SIZE
    }

    pub fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<(), Error> {
        if buf.len() < MEM_DESC_SIZE {
            return Err(Error::Overflow);
        }
        LittleEndian::write_u64(&mut buf[0..8], handle.base);
        LittleEndian::write_u64(&mut buf[8..16], handle.size);
        LittleEndian::write_u64(&mut buf[16..24], handle.key());
        buf[24] = handle.access.to_u8();
        Ok(())
    }

    pub fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle, Error> {
        if buf.len() < MEM_DESC_SIZE {
            return Err(Error::Overflow);
        }
        Ok(MemHandle {
            base: LittleEndian::read_u64(&buf[0..8]),
            size: LittleEndian::read_u64(&buf[8..16]),
            key: AtomicU64::new(LittleEndian::read_u64(&buf[16..24])),
            access: AccessMode::from_u8(buf[24])?,
            mr: Mutex::new(None),
        })
    }
}
