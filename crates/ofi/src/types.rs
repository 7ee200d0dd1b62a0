use bitflags::bitflags;

/// Native address formats understood by fabric providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// IPv4 socket address.
    Sin,
    /// Intel PSM2 endpoint-id pair.
    Psm2,
    /// Cray GNI composite address.
    Gni,
}

/// Compact fabric-address handle produced by address-vector insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiAddr(pub u64);

impl FiAddr {
    /// Sentinel for "no address" / wildcard source.
    pub const UNSPEC: FiAddr = FiAddr(u64::MAX);

    pub fn is_unspec(self) -> bool {
        self == Self::UNSPEC
    }
}

/// Combine a base fabric address with a destination receive-context index,
/// using `rx_ctx_bits` high bits of the handle.
pub fn rx_addr(addr: FiAddr, rx_index: u8, rx_ctx_bits: u32) -> FiAddr {
    if addr.is_unspec() {
        return addr;
    }
    FiAddr(addr.0 | (rx_index as u64) << (64 - rx_ctx_bits))
}

/// Split an rx-context-encoded handle back into base handle and index.
pub fn rx_split(addr: FiAddr, rx_ctx_bits: u32) -> (FiAddr, u8) {
    if addr.is_unspec() {
        return (addr, 0);
    }
    let shift = 64 - rx_ctx_bits;
    (FiAddr(addr.0 & ((1 << shift) - 1)), (addr.0 >> shift) as u8)
}

bitflags! {
    /// Provider capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        const TAGGED        = 1 << 0;
        const RMA           = 1 << 1;
        const SOURCE        = 1 << 2;
        const SOURCE_ERR    = 1 << 3;
        const DIRECTED_RECV = 1 << 4;
    }
}

bitflags! {
    /// Memory-registration mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MrMode: u32 {
        /// RMA targets are addressed by virtual address.
        const VIRT_ADDR = 1 << 0;
        /// Registered memory must be backed by physical pages.
        const ALLOCATED = 1 << 1;
        /// The provider chooses MR keys.
        const PROV_KEY  = 1 << 2;
        /// Local buffers used in transfers must be registered.
        const LOCAL     = 1 << 3;
    }
}

bitflags! {
    /// Access rights for a registered memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Access: u32 {
        const READ         = 1 << 0;
        const WRITE        = 1 << 1;
        const REMOTE_READ  = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
        const SEND         = 1 << 4;
        const RECV         = 1 << 5;
    }
}

bitflags! {
    /// Per-post completion semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PostFlags: u32 {
        const COMPLETION        = 1 << 0;
        const DELIVERY_COMPLETE = 1 << 1;
        const INJECT_COMPLETE   = 1 << 2;
    }
}

bitflags! {
    /// Kind bits of a completion-queue entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const RMA  = 1 << 2;
    }
}

/// Progress model requested from / supported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Auto,
    Manual,
}

/// Endpoint types. Only reliable-datagram endpoints are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpType {
    Rdm,
}

/// Message-ordering hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOrder {
    None,
    /// Send-after-send: same-tag sends are transmitted in posting order.
    Sas,
}

/// Provider query filter. Unset fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub prov_name: Option<String>,
    pub domain: Option<String>,
    pub node: Option<String>,
    pub service: Option<String>,
    pub source: bool,
    pub caps: Caps,
    pub mr_mode: MrMode,
    pub msg_order: Option<MsgOrder>,
    pub progress: Option<Progress>,
    pub src_addr: Option<Vec<u8>>,
    pub tx_ctx_cnt: usize,
    pub rx_ctx_cnt: usize,
    pub auth_key: Option<Vec<u8>>,
}

/// One provider description returned by an info query.
#[derive(Debug, Clone)]
pub struct Info {
    pub prov_name: String,
    pub fabric_name: String,
    pub domain_name: String,
    pub format: Format,
    pub ep_type: EpType,
    pub caps: Caps,
    pub mr_mode: MrMode,
    pub progress: Progress,
    pub msg_order: MsgOrder,
    pub src_addr: Option<Vec<u8>>,
    pub src_addrlen: usize,
    pub dest_addr: Option<Vec<u8>>,
    pub tx_ctx_cnt: usize,
    pub rx_ctx_cnt: usize,
    pub max_msg_size: usize,
    pub auth_key: Option<Vec<u8>>,
}

/// Address-vector layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvType {
    Map,
}

#[derive(Debug, Clone, Copy)]
pub struct AvAttr {
    pub av_type: AvType,
    pub rx_ctx_bits: u32,
}

/// Wait object requested for a completion queue.
#[derive(Clone)]
pub enum WaitKind {
    None,
    Fd,
    Set(std::sync::Arc<dyn crate::WaitSet>),
}

#[derive(Clone)]
pub struct CqAttr {
    pub size: usize,
    pub wait: WaitKind,
}

/// One tagged-format completion entry.
#[derive(Debug, Clone)]
pub struct CqEntry {
    /// The context cookie supplied when the operation was posted.
    pub cookie: u64,
    pub flags: EntryFlags,
    pub len: usize,
    pub tag: u64,
}

/// Error-completion kinds surfaced through the error-read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqErrorKind {
    Canceled,
    AddrNotAvail,
    Io,
    Other(i32),
}

/// One error completion, including the embedded event and any
/// provider-supplied error data (the native source address for
/// `AddrNotAvail`).
#[derive(Debug, Clone)]
pub struct CqError {
    pub kind: CqErrorKind,
    pub entry: CqEntry,
    pub err_data: Vec<u8>,
}

/// Result of a completion-queue read.
pub enum CqRead {
    /// One or more events, each with its attributed source address
    /// (`FiAddr::UNSPEC` when the provider cannot name one).
    Events(Vec<(CqEntry, FiAddr)>),
    /// No events pending.
    Empty,
    /// An error entry is pending and must be drained with `read_err`.
    ErrAvail,
}

/// One-sided transfer descriptor for `writemsg` / `readmsg`.
pub struct RmaMsg {
    pub local_addr: *mut u8,
    pub len: usize,
    /// Destination fabric address (may be rx-context encoded).
    pub addr: FiAddr,
    pub remote_addr: u64,
    pub remote_key: u64,
    pub cookie: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rx_addr_round_trips_index() {
        let base = FiAddr(42);
        let combined = rx_addr(base, 7, 8);
        assert_eq!(rx_split(combined, 8), (base, 7));

        // Index zero leaves the handle unchanged.
        assert_eq!(rx_addr(base, 0, 8), base);

        // The wildcard address is never context-encoded.
        assert_eq!(rx_addr(FiAddr::UNSPEC, 3, 8), FiAddr::UNSPEC);
    }
}
