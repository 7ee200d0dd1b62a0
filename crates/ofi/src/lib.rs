//! A vendor-neutral fabric interface: reliable-datagram endpoints with
//! tagged messaging and one-sided RMA, completion queues, address vectors
//! and memory registration.
//!
//! The trait surface mirrors what a libfabric-style library provides; the
//! [`loopback`] module implements it in-process for local development and
//! tests.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

mod types;
pub use types::*;

pub mod loopback;

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("operation canceled")]
    Canceled,
    #[error("address not available")]
    AddrNotAvail,
    #[error("buffer too small, {0} bytes required")]
    TooSmall(usize),
    #[error("input/output error")]
    Io,
    #[error("no such entry")]
    NoEntry,
    #[error("interrupted")]
    Interrupted,
    #[error("timed out")]
    TimedOut,
    #[error("not supported")]
    Unsupported,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;

/// Entry point of a loaded fabric library.
pub trait Interface: Send + Sync {
    /// Query providers matching the given hints.
    fn getinfo(&self, hints: &Hints) -> Result<Vec<Info>>;

    /// Open a fabric instance for a provider description.
    fn open_fabric(&self, info: &Info) -> Result<Arc<dyn Fabric>>;
}

pub trait Fabric: Send + Sync {
    fn open_domain(&self, info: &Info) -> Result<Arc<dyn Domain>>;

    fn open_wait_set(&self) -> Result<Arc<dyn WaitSet>>;

    /// Whether it is currently safe to block on the given queues.
    fn try_wait(&self, cqs: &[Arc<dyn CompletionQueue>]) -> Result<bool>;
}

pub trait Domain: Send + Sync {
    fn open_av(&self, attr: AvAttr) -> Result<Arc<dyn AddressVector>>;

    fn open_cq(&self, attr: CqAttr) -> Result<Arc<dyn CompletionQueue>>;

    fn open_endpoint(&self, info: &Info) -> Result<Arc<dyn Endpoint>>;

    fn open_scalable_endpoint(&self, info: &Info) -> Result<Arc<dyn Endpoint>>;

    /// Register `[base, base + len)` for the given access. A zero
    /// `requested_key` (or a provider that owns key selection) lets the
    /// provider choose the key.
    ///
    /// The region is deregistered when the returned handle is dropped.
    fn register(
        &self,
        base: u64,
        len: u64,
        access: Access,
        requested_key: u64,
    ) -> Result<Arc<dyn MemoryRegion>>;
}

pub trait AddressVector: Send + Sync {
    fn insert(&self, addr: &[u8]) -> Result<FiAddr>;

    fn remove(&self, addr: FiAddr) -> Result<()>;

    fn lookup(&self, addr: FiAddr) -> Result<Vec<u8>>;

    /// Render a native address as the provider's printable form.
    fn straddr(&self, addr: &[u8]) -> String;
}

pub trait MemoryRegion: Send + Sync {
    /// The remote key of the region.
    fn key(&self) -> u64;
}

pub trait WaitSet: Send + Sync {
    /// Returns false when the timeout elapsed with nothing to report.
    fn wait(&self, timeout: Duration) -> Result<bool>;
}

pub trait CompletionQueue: Send + Sync {
    fn read_from(&self, max: usize) -> Result<CqRead>;

    fn read_err(&self) -> Result<CqError>;

    /// Wake any thread blocked in `wait`.
    fn signal(&self);

    /// A pollable file descriptor, if the queue was opened with an fd
    /// wait object and the provider can produce one.
    fn wait_fd(&self) -> Option<RawFd>;

    /// Returns false when the timeout elapsed with nothing to report.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    /// Provider-internal downcasting support for bind operations.
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

pub trait Endpoint: Send + Sync {
    fn bind_cq(&self, cq: &Arc<dyn CompletionQueue>, tx: bool, rx: bool) -> Result<()>;

    fn bind_av(&self, av: &Arc<dyn AddressVector>) -> Result<()>;

    fn enable(&self) -> Result<()>;

    /// Copy the endpoint's native source address into `buf`, returning its
    /// length. Fails with `TooSmall(len)` when `buf` cannot hold it.
    fn getname(&self, buf: &mut [u8]) -> Result<usize>;

    /// Transmit subcontext of a scalable endpoint.
    fn tx_context(&self, index: u8) -> Result<Arc<dyn Endpoint>>;

    /// Receive subcontext of a scalable endpoint.
    fn rx_context(&self, index: u8) -> Result<Arc<dyn Endpoint>>;

    /// Request cancellation of the posted operation identified by
    /// `cookie`. Asynchronous: the outcome is reported through the CQ.
    fn cancel(&self, cookie: u64) -> Result<()>;

    /// Post a tagged send.
    ///
    /// # Safety
    /// `buf .. buf + len` must remain valid and untouched until the
    /// completion for `cookie` is harvested.
    unsafe fn tsend(
        &self,
        buf: *const u8,
        len: usize,
        dest: FiAddr,
        tag: u64,
        cookie: u64,
    ) -> Result<()>;

    /// Post a tagged receive matching `tag` under `ignore`.
    ///
    /// # Safety
    /// `buf .. buf + len` must remain valid and unaliased until the
    /// completion (or cancel event) for `cookie` is harvested.
    unsafe fn trecv(
        &self,
        buf: *mut u8,
        len: usize,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        cookie: u64,
    ) -> Result<()>;

    /// Post a one-sided write described by `msg`.
    ///
    /// # Safety
    /// The local buffer of `msg` must remain valid until the completion
    /// for `msg.cookie` is harvested.
    unsafe fn writemsg(&self, msg: &RmaMsg, flags: PostFlags) -> Result<()>;

    /// Post a one-sided read described by `msg`.
    ///
    /// # Safety
    /// The local buffer of `msg` must remain valid and unaliased until the
    /// completion for `msg.cookie` is harvested.
    unsafe fn readmsg(&self, msg: &RmaMsg, flags: PostFlags) -> Result<()>;
}
