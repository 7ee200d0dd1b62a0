//! In-process fabric provider.
//!
//! Endpoints register themselves in a process-global port table keyed by
//! their IPv4 socket address; tagged sends and one-sided transfers are
//! routed through that table and delivered synchronously on the sender's
//! thread. The provider advertises the `sockets` and `tcp;ofi_rxm`
//! canonical names with IPv4 socket addressing.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::{
    Access, AvAttr, Caps, CompletionQueue, CqAttr, CqEntry, CqError, CqErrorKind, CqRead, Domain,
    Endpoint, EntryFlags, EpType, FabricError, FiAddr, Format, Hints, Info, Interface, MemoryRegion,
    MrMode, MsgOrder, PostFlags, Progress, Result, RmaMsg, WaitSet,
};

const SIN_ADDRLEN: usize = 8;
const DEFAULT_DOMAIN: &str = "lo";
const EPHEMERAL_BASE: u16 = 49152;
const RX_CTX_BITS: u32 = 8;

/// Canonical provider names served by this interface.
pub const PROV_NAMES: [&str; 2] = ["sockets", "tcp;ofi_rxm"];

fn sin_blob(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut blob = Vec::with_capacity(SIN_ADDRLEN);
    blob.extend_from_slice(&ip.octets());
    blob.extend_from_slice(&port.to_be_bytes());
    blob.extend_from_slice(&[0, 0]);
    blob
}

fn sin_key(blob: &[u8]) -> u64 {
    if blob.len() < 6 {
        return 0;
    }
    let ip = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let port = u16::from_be_bytes([blob[4], blob[5]]);
    ((ip as u64) << 32) | port as u64
}

fn sin_str(blob: &[u8]) -> String {
    if blob.len() < 6 {
        return String::from("<invalid>");
    }
    format!(
        "{}.{}.{}.{}:{}",
        blob[0],
        blob[1],
        blob[2],
        blob[3],
        u16::from_be_bytes([blob[4], blob[5]])
    )
}

fn parse_node_service(node: &str, service: Option<&str>) -> Result<Vec<u8>> {
    let ip: Ipv4Addr = node
        .parse()
        .map_err(|_| FabricError::Other(format!("cannot parse node address: {node}")))?;
    let port = match service {
        Some(s) => s
            .parse::<u16>()
            .map_err(|_| FabricError::Other(format!("cannot parse service: {s}")))?,
        None => 0,
    };
    Ok(sin_blob(ip, port))
}

lazy_static::lazy_static! {
    static ref NETWORK: Mutex<Network> = Mutex::new(Network {
        ports: HashMap::new(),
        next_port: EPHEMERAL_BASE,
    });

    // Wait sets observe a process-wide completion generation rather than
    // tracking individual queues.
    static ref WAIT_GEN: (Mutex<u64>, Condvar) = (Mutex::new(0), Condvar::new());
}

struct Network {
    ports: HashMap<u64, Weak<EpShared>>,
    next_port: u16,
}

impl Network {
    fn alloc_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_BASE);
            let key = sin_key(&sin_blob(Ipv4Addr::LOCALHOST, port));
            match self.ports.get(&key) {
                Some(w) if w.upgrade().is_some() => continue,
                _ => return port,
            }
        }
    }

    fn find(&self, key: u64) -> Option<Arc<EpShared>> {
        self.ports.get(&key).and_then(Weak::upgrade)
    }
}

fn bump_wait_gen() {
    let (lock, cv) = &*WAIT_GEN;
    *lock.lock().unwrap() += 1;
    cv.notify_all();
}

#[derive(Default)]
struct Counters {
    av_inserts: AtomicU64,
    av_removes: AtomicU64,
}

/// Interface handle. Options fixed at construction flow into every object
/// opened through it.
pub struct Loopback {
    source_error: bool,
    scalable_mr: bool,
    counters: Arc<Counters>,
}

impl Loopback {
    pub fn new() -> Arc<Loopback> {
        Arc::new(Loopback {
            source_error: false,
            scalable_mr: false,
            counters: Arc::default(),
        })
    }

    /// Report unknown senders through `AddrNotAvail` error completions
    /// carrying the raw source address, instead of unattributed events.
    pub fn with_source_error() -> Arc<Loopback> {
        Arc::new(Loopback {
            source_error: true,
            scalable_mr: false,
            counters: Arc::default(),
        })
    }

    /// Advertise an MR mode without the allocated bit, so consumers fall
    /// back to one whole-address-space registration.
    pub fn with_scalable_mr() -> Arc<Loopback> {
        Arc::new(Loopback {
            source_error: false,
            scalable_mr: true,
            counters: Arc::default(),
        })
    }

    /// Address-vector insertions performed through this interface.
    pub fn av_inserts(&self) -> u64 {
        self.counters.av_inserts.load(Ordering::SeqCst)
    }

    /// Address-vector removals performed through this interface.
    pub fn av_removes(&self) -> u64 {
        self.counters.av_removes.load(Ordering::SeqCst)
    }

    fn make_info(&self, prov_name: &str, hints: &Hints) -> Result<Info> {
        let src_addr = match (&hints.src_addr, &hints.node) {
            (Some(blob), _) => Some(blob.clone()),
            (None, Some(node)) if hints.source => {
                Some(parse_node_service(node, hints.service.as_deref())?)
            }
            _ => None,
        };
        // Destination resolution for node/service queries that are not
        // source bindings.
        let dest_addr = match (&hints.node, hints.source) {
            (Some(node), false) => Some(parse_node_service(node, hints.service.as_deref())?),
            _ => None,
        };

        let mut caps = Caps::TAGGED | Caps::RMA | Caps::DIRECTED_RECV;
        caps |= if self.source_error {
            Caps::SOURCE_ERR
        } else {
            Caps::SOURCE
        };

        let mr_mode = if self.scalable_mr {
            MrMode::empty()
        } else {
            MrMode::VIRT_ADDR | MrMode::ALLOCATED
        };

        Ok(Info {
            prov_name: prov_name.to_string(),
            fabric_name: "loopback".to_string(),
            domain_name: hints
                .domain
                .clone()
                .unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
            format: Format::Sin,
            ep_type: EpType::Rdm,
            caps,
            mr_mode,
            progress: Progress::Manual,
            msg_order: MsgOrder::Sas,
            src_addr,
            src_addrlen: SIN_ADDRLEN,
            dest_addr,
            tx_ctx_cnt: if hints.tx_ctx_cnt > 0 { hints.tx_ctx_cnt } else { 16 },
            rx_ctx_cnt: if hints.rx_ctx_cnt > 0 { hints.rx_ctx_cnt } else { 16 },
            max_msg_size: 1 << 24,
            auth_key: hints.auth_key.clone(),
        })
    }
}

impl Interface for Loopback {
    fn getinfo(&self, hints: &Hints) -> Result<Vec<Info>> {
        let mut infos = Vec::new();
        for name in PROV_NAMES {
            if let Some(ref want) = hints.prov_name {
                if want.as_str() != name {
                    continue;
                }
            }
            infos.push(self.make_info(name, hints)?);
        }
        if infos.is_empty() {
            return Err(FabricError::NoEntry);
        }
        Ok(infos)
    }

    fn open_fabric(&self, _info: &Info) -> Result<Arc<dyn crate::Fabric>> {
        Ok(Arc::new(LoopbackFabric {
            counters: self.counters.clone(),
        }))
    }
}

struct LoopbackFabric {
    counters: Arc<Counters>,
}

impl crate::Fabric for LoopbackFabric {
    fn open_domain(&self, info: &Info) -> Result<Arc<dyn Domain>> {
        Ok(Arc::new(LoopbackDomain {
            shared: Arc::new(DomainShared {
                av: Mutex::new(AvState::default()),
                regions: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(1),
                counters: self.counters.clone(),
                caps: info.caps,
            }),
        }))
    }

    fn open_wait_set(&self) -> Result<Arc<dyn WaitSet>> {
        let seen = *WAIT_GEN.0.lock().unwrap();
        Ok(Arc::new(LoopbackWaitSet {
            seen: Mutex::new(seen),
        }))
    }

    fn try_wait(&self, cqs: &[Arc<dyn CompletionQueue>]) -> Result<bool> {
        for cq in cqs {
            if let CqRead::Empty = cq.read_from(0)? {
                continue;
            }
            return Ok(false);
        }
        Ok(true)
    }
}

struct LoopbackWaitSet {
    seen: Mutex<u64>,
}

impl WaitSet for LoopbackWaitSet {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let (lock, cv) = &*WAIT_GEN;
        let mut seen = self.seen.lock().unwrap();
        let mut gen = lock.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while *gen == *seen {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return Ok(false),
            };
            let (guard, result) = cv.wait_timeout(gen, remaining).unwrap();
            gen = guard;
            if result.timed_out() && *gen == *seen {
                return Ok(false);
            }
        }
        *seen = *gen;
        Ok(true)
    }
}

#[derive(Default)]
struct AvState {
    forward: HashMap<u64, Vec<u8>>,
    reverse: HashMap<u64, u64>,
    next: u64,
}

struct Region {
    base: u64,
    len: u64,
    access: Access,
}

struct DomainShared {
    av: Mutex<AvState>,
    regions: Mutex<HashMap<u64, Region>>,
    next_key: AtomicU64,
    counters: Arc<Counters>,
    caps: Caps,
}

impl DomainShared {
    fn av_lookup(&self, fi: FiAddr) -> Option<Vec<u8>> {
        self.av.lock().unwrap().forward.get(&fi.0).cloned()
    }

    fn av_reverse(&self, key: u64) -> Option<FiAddr> {
        self.av.lock().unwrap().reverse.get(&key).copied().map(FiAddr)
    }
}

struct LoopbackDomain {
    shared: Arc<DomainShared>,
}

impl Domain for LoopbackDomain {
    fn open_av(&self, _attr: AvAttr) -> Result<Arc<dyn crate::AddressVector>> {
        Ok(Arc::new(LoopbackAv {
            dom: self.shared.clone(),
        }))
    }

    fn open_cq(&self, _attr: CqAttr) -> Result<Arc<dyn CompletionQueue>> {
        Ok(Arc::new(LoopbackCq {
            state: Mutex::new(CqState::default()),
            cv: Condvar::new(),
        }))
    }

    fn open_endpoint(&self, info: &Info) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(LoopbackEp {
            shared: Arc::new(EpShared {
                dom: self.shared.clone(),
                src: Mutex::new(info.src_addr.clone()),
                ctxs: Mutex::new(HashMap::new()),
            }),
            idx: 0,
        }))
    }

    fn open_scalable_endpoint(&self, info: &Info) -> Result<Arc<dyn Endpoint>> {
        // Subcontexts fan out from the shared state; the parent itself is
        // context zero.
        self.open_endpoint(info)
    }

    fn register(
        &self,
        base: u64,
        len: u64,
        access: Access,
        requested_key: u64,
    ) -> Result<Arc<dyn MemoryRegion>> {
        let mut regions = self.shared.regions.lock().unwrap();
        let key = if requested_key != 0 && !regions.contains_key(&requested_key) {
            requested_key
        } else {
            self.shared.next_key.fetch_add(1, Ordering::SeqCst)
        };
        regions.insert(key, Region { base, len, access });
        Ok(Arc::new(LoopbackMr {
            key,
            dom: Arc::downgrade(&self.shared),
        }))
    }
}

struct LoopbackMr {
    key: u64,
    dom: Weak<DomainShared>,
}

impl MemoryRegion for LoopbackMr {
    fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for LoopbackMr {
    fn drop(&mut self) {
        if let Some(dom) = self.dom.upgrade() {
            dom.regions.lock().unwrap().remove(&self.key);
        }
    }
}

struct LoopbackAv {
    dom: Arc<DomainShared>,
}

impl crate::AddressVector for LoopbackAv {
    fn insert(&self, addr: &[u8]) -> Result<FiAddr> {
        let key = sin_key(addr);
        if key == 0 {
            return Err(FabricError::Other("malformed native address".to_string()));
        }
        let mut av = self.dom.av.lock().unwrap();
        let fi = av.next;
        av.next += 1;
        av.forward.insert(fi, addr.to_vec());
        av.reverse.insert(key, fi);
        self.dom.counters.av_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(FiAddr(fi))
    }

    fn remove(&self, addr: FiAddr) -> Result<()> {
        let mut av = self.dom.av.lock().unwrap();
        let bytes = av.forward.remove(&addr.0).ok_or(FabricError::NoEntry)?;
        let key = sin_key(&bytes);
        if av.reverse.get(&key) == Some(&addr.0) {
            // Repoint to a surviving duplicate, if any.
            let survivor = av
                .forward
                .iter()
                .find(|(_, b)| sin_key(b) == key)
                .map(|(fi, _)| *fi);
            match survivor {
                Some(fi) => {
                    av.reverse.insert(key, fi);
                }
                None => {
                    av.reverse.remove(&key);
                }
            }
        }
        self.dom.counters.av_removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lookup(&self, addr: FiAddr) -> Result<Vec<u8>> {
        self.dom.av_lookup(addr).ok_or(FabricError::NoEntry)
    }

    fn straddr(&self, addr: &[u8]) -> String {
        sin_str(addr)
    }
}

enum CqItem {
    Event(CqEntry, FiAddr),
    Error(CqError),
}

#[derive(Default)]
struct CqState {
    items: VecDeque<CqItem>,
    signaled: bool,
}

struct LoopbackCq {
    state: Mutex<CqState>,
    cv: Condvar,
}

impl LoopbackCq {
    fn push_event(&self, entry: CqEntry, src: FiAddr) {
        self.state
            .lock()
            .unwrap()
            .items
            .push_back(CqItem::Event(entry, src));
        self.cv.notify_all();
        bump_wait_gen();
    }

    fn push_error(&self, err: CqError) {
        self.state
            .lock()
            .unwrap()
            .items
            .push_back(CqItem::Error(err));
        self.cv.notify_all();
        bump_wait_gen();
    }
}

impl CompletionQueue for LoopbackCq {
    fn read_from(&self, max: usize) -> Result<CqRead> {
        let mut state = self.state.lock().unwrap();
        let front_is_event = match state.items.front() {
            None => return Ok(CqRead::Empty),
            Some(CqItem::Error(_)) => false,
            Some(CqItem::Event(..)) => true,
        };
        if !front_is_event || max == 0 {
            // max == 0 doubles as a pure pending-work probe.
            return Ok(CqRead::ErrAvail);
        }
        let mut events = Vec::new();
        while events.len() < max {
            if !matches!(state.items.front(), Some(CqItem::Event(..))) {
                break;
            }
            if let Some(CqItem::Event(entry, src)) = state.items.pop_front() {
                events.push((entry, src));
            }
        }
        Ok(CqRead::Events(events))
    }

    fn read_err(&self) -> Result<CqError> {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.items.front(), Some(CqItem::Error(_))) {
            return Err(FabricError::NoEntry);
        }
        match state.items.pop_front() {
            Some(CqItem::Error(err)) => Ok(err),
            _ => unreachable!(),
        }
    }

    fn signal(&self) {
        self.state.lock().unwrap().signaled = true;
        self.cv.notify_all();
        bump_wait_gen();
    }

    fn wait_fd(&self) -> Option<RawFd> {
        None
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() && !state.signaled {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return Ok(false),
            };
            let (guard, result) = self.cv.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() && state.items.is_empty() && !state.signaled {
                return Ok(false);
            }
        }
        state.signaled = false;
        Ok(true)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Raw buffer pointer retained by a posted receive until it matches.
struct BufPtr(*mut u8);

// Delivery happens on arbitrary sender threads; the posting contract
// guarantees exclusive access to the buffer until completion.
unsafe impl Send for BufPtr {}

struct Posted {
    cookie: u64,
    buf: BufPtr,
    len: usize,
    src: FiAddr,
    tag: u64,
    ignore: u64,
}

struct Inbound {
    data: Vec<u8>,
    tag: u64,
    src_sin: Vec<u8>,
}

#[derive(Default)]
struct CtxState {
    tx_cq: Option<Arc<LoopbackCq>>,
    rx_cq: Option<Arc<LoopbackCq>>,
    posted: Vec<Posted>,
    parked: VecDeque<Inbound>,
}

struct EpShared {
    dom: Arc<DomainShared>,
    src: Mutex<Option<Vec<u8>>>,
    ctxs: Mutex<HashMap<u8, CtxState>>,
}

impl EpShared {
    fn matches(&self, posted: &Posted, msg: &Inbound) -> bool {
        if (posted.tag ^ msg.tag) & !posted.ignore != 0 {
            return false;
        }
        if posted.src.is_unspec() {
            return true;
        }
        let (base, _) = crate::rx_split(posted.src, RX_CTX_BITS);
        match self.dom.av_lookup(base) {
            Some(bytes) => sin_key(&bytes) == sin_key(&msg.src_sin),
            None => false,
        }
    }

    fn complete_recv(&self, posted: Posted, msg: Inbound, rx_cq: &Arc<LoopbackCq>) {
        let n = posted.len.min(msg.data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(msg.data.as_ptr(), posted.buf.0, n);
        }
        let entry = CqEntry {
            cookie: posted.cookie,
            flags: EntryFlags::RECV,
            len: msg.data.len(),
            tag: msg.tag,
        };
        match self.dom.av_reverse(sin_key(&msg.src_sin)) {
            Some(fi) => rx_cq.push_event(entry, fi),
            None if self.dom.caps.contains(Caps::SOURCE_ERR) => rx_cq.push_error(CqError {
                kind: CqErrorKind::AddrNotAvail,
                entry,
                err_data: msg.src_sin,
            }),
            None => rx_cq.push_event(entry, FiAddr::UNSPEC),
        }
    }

    fn deliver(&self, rx_idx: u8, msg: Inbound) -> Result<()> {
        let mut ctxs = self.ctxs.lock().unwrap();
        let ctx = ctxs.entry(rx_idx).or_default();
        let rx_cq = match ctx.rx_cq.clone() {
            Some(cq) => cq,
            None => return Err(FabricError::Other("receive context has no CQ".to_string())),
        };
        if let Some(pos) = ctx.posted.iter().position(|p| self.matches(p, &msg)) {
            let posted = ctx.posted.remove(pos);
            self.complete_recv(posted, msg, &rx_cq);
        } else {
            ctx.parked.push_back(msg);
        }
        Ok(())
    }

    fn resolve_peer(&self, dest: FiAddr) -> Result<(Arc<EpShared>, u8)> {
        let (base, rx_idx) = crate::rx_split(dest, RX_CTX_BITS);
        if base.is_unspec() {
            return Err(FabricError::AddrNotAvail);
        }
        let bytes = self.dom.av_lookup(base).ok_or(FabricError::AddrNotAvail)?;
        let peer = NETWORK
            .lock()
            .unwrap()
            .find(sin_key(&bytes))
            .ok_or_else(|| FabricError::Other(format!("peer {} unreachable", sin_str(&bytes))))?;
        Ok((peer, rx_idx))
    }

    fn tx_cq(&self, idx: u8) -> Result<Arc<LoopbackCq>> {
        self.ctxs
            .lock()
            .unwrap()
            .get(&idx)
            .and_then(|c| c.tx_cq.clone())
            .ok_or_else(|| FabricError::Other("transmit context has no CQ".to_string()))
    }
}

struct LoopbackEp {
    shared: Arc<EpShared>,
    idx: u8,
}

impl Endpoint for LoopbackEp {
    fn bind_cq(&self, cq: &Arc<dyn CompletionQueue>, tx: bool, rx: bool) -> Result<()> {
        let cq = cq
            .clone()
            .as_any()
            .downcast::<LoopbackCq>()
            .map_err(|_| FabricError::Other("CQ belongs to another provider".to_string()))?;
        let mut ctxs = self.shared.ctxs.lock().unwrap();
        let ctx = ctxs.entry(self.idx).or_default();
        if tx {
            ctx.tx_cq = Some(cq.clone());
        }
        if rx {
            ctx.rx_cq = Some(cq);
        }
        Ok(())
    }

    fn bind_av(&self, _av: &Arc<dyn crate::AddressVector>) -> Result<()> {
        Ok(())
    }

    fn enable(&self) -> Result<()> {
        let mut src = self.shared.src.lock().unwrap();
        let mut network = NETWORK.lock().unwrap();
        let blob = match src.take() {
            Some(blob) if u16::from_be_bytes([blob[4], blob[5]]) != 0 => blob,
            Some(blob) => {
                let port = network.alloc_port();
                let ip = Ipv4Addr::new(blob[0], blob[1], blob[2], blob[3]);
                let ip = if ip.is_unspecified() { Ipv4Addr::LOCALHOST } else { ip };
                sin_blob(ip, port)
            }
            None => sin_blob(Ipv4Addr::LOCALHOST, network.alloc_port()),
        };
        let key = sin_key(&blob);
        if let Some(existing) = network.find(key) {
            // Subcontext enables share the parent binding.
            if !Arc::ptr_eq(&existing, &self.shared) {
                return Err(FabricError::Other(format!(
                    "address {} already in use",
                    sin_str(&blob)
                )));
            }
        } else {
            network.ports.insert(key, Arc::downgrade(&self.shared));
        }
        tracing::debug!(addr = %sin_str(&blob), "endpoint enabled");
        *src = Some(blob);
        Ok(())
    }

    fn getname(&self, buf: &mut [u8]) -> Result<usize> {
        let src = self.shared.src.lock().unwrap();
        let blob = src
            .as_ref()
            .ok_or_else(|| FabricError::Other("endpoint is not enabled".to_string()))?;
        if buf.len() < blob.len() {
            return Err(FabricError::TooSmall(blob.len()));
        }
        buf[..blob.len()].copy_from_slice(blob);
        Ok(blob.len())
    }

    fn tx_context(&self, index: u8) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(LoopbackEp {
            shared: self.shared.clone(),
            idx: index,
        }))
    }

    fn rx_context(&self, index: u8) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(LoopbackEp {
            shared: self.shared.clone(),
            idx: index,
        }))
    }

    fn cancel(&self, cookie: u64) -> Result<()> {
        let mut ctxs = self.shared.ctxs.lock().unwrap();
        for ctx in ctxs.values_mut() {
            if let Some(pos) = ctx.posted.iter().position(|p| p.cookie == cookie) {
                let posted = ctx.posted.remove(pos);
                if let Some(rx_cq) = ctx.rx_cq.clone() {
                    rx_cq.push_error(CqError {
                        kind: CqErrorKind::Canceled,
                        entry: CqEntry {
                            cookie: posted.cookie,
                            flags: EntryFlags::RECV,
                            len: 0,
                            tag: 0,
                        },
                        err_data: Vec::new(),
                    });
                }
                return Ok(());
            }
        }
        // Already matched or never posted; the operation will complete (or
        // already has) through the regular path.
        Ok(())
    }

    unsafe fn tsend(
        &self,
        buf: *const u8,
        len: usize,
        dest: FiAddr,
        tag: u64,
        cookie: u64,
    ) -> Result<()> {
        let (peer, rx_idx) = self.shared.resolve_peer(dest)?;
        let tx_cq = self.shared.tx_cq(self.idx)?;
        let data = std::slice::from_raw_parts(buf, len).to_vec();
        let src_sin = self
            .shared
            .src
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FabricError::Other("endpoint is not enabled".to_string()))?;
        peer.deliver(
            rx_idx,
            Inbound {
                data,
                tag,
                src_sin,
            },
        )?;
        tx_cq.push_event(
            CqEntry {
                cookie,
                flags: EntryFlags::SEND,
                len,
                tag,
            },
            FiAddr::UNSPEC,
        );
        Ok(())
    }

    unsafe fn trecv(
        &self,
        buf: *mut u8,
        len: usize,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        cookie: u64,
    ) -> Result<()> {
        let posted = Posted {
            cookie,
            buf: BufPtr(buf),
            len,
            src,
            tag,
            ignore,
        };
        let mut ctxs = self.shared.ctxs.lock().unwrap();
        let ctx = ctxs.entry(self.idx).or_default();
        let rx_cq = match ctx.rx_cq.clone() {
            Some(cq) => cq,
            None => return Err(FabricError::Other("receive context has no CQ".to_string())),
        };
        if let Some(pos) = ctx
            .parked
            .iter()
            .position(|m| self.shared.matches(&posted, m))
        {
            let msg = ctx.parked.remove(pos).unwrap();
            self.shared.complete_recv(posted, msg, &rx_cq);
        } else {
            ctx.posted.push(posted);
        }
        Ok(())
    }

    unsafe fn writemsg(&self, msg: &RmaMsg, _flags: PostFlags) -> Result<()> {
        let (peer, _) = self.shared.resolve_peer(msg.addr)?;
        {
            let regions = peer.dom.regions.lock().unwrap();
            let region = regions
                .get(&msg.remote_key)
                .ok_or_else(|| FabricError::Other("unknown RMA key".to_string()))?;
            check_bounds(region, msg.remote_addr, msg.len as u64, Access::REMOTE_WRITE)?;
            std::ptr::copy_nonoverlapping(
                msg.local_addr as *const u8,
                msg.remote_addr as *mut u8,
                msg.len,
            );
        }
        self.shared.tx_cq(self.idx)?.push_event(
            CqEntry {
                cookie: msg.cookie,
                flags: EntryFlags::RMA,
                len: msg.len,
                tag: 0,
            },
            FiAddr::UNSPEC,
        );
        Ok(())
    }

    unsafe fn readmsg(&self, msg: &RmaMsg, _flags: PostFlags) -> Result<()> {
        let (peer, _) = self.shared.resolve_peer(msg.addr)?;
        {
            let regions = peer.dom.regions.lock().unwrap();
            let region = regions
                .get(&msg.remote_key)
                .ok_or_else(|| FabricError::Other("unknown RMA key".to_string()))?;
            check_bounds(region, msg.remote_addr, msg.len as u64, Access::REMOTE_READ)?;
            std::ptr::copy_nonoverlapping(
                msg.remote_addr as *const u8,
                msg.local_addr,
                msg.len,
            );
        }
        self.shared.tx_cq(self.idx)?.push_event(
            CqEntry {
                cookie: msg.cookie,
                flags: EntryFlags::RMA,
                len: msg.len,
                tag: 0,
            },
            FiAddr::UNSPEC,
        );
        Ok(())
    }
}

fn check_bounds(region: &Region, addr: u64, len: u64, access: Access) -> Result<()> {
    if !region.access.contains(access) {
        return Err(FabricError::Other("access denied to region".to_string()));
    }
    let end = addr
        .checked_add(len)
        .ok_or_else(|| FabricError::Other("RMA range overflow".to_string()))?;
    let region_end = region.base.saturating_add(region.len);
    if addr < region.base || end > region_end {
        return Err(FabricError::Other("RMA range outside region".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Fabric as _;
    use crate::WaitKind;

    fn open_ep(
        fabric: &LoopbackFabric,
        info: &Info,
    ) -> (Arc<dyn Domain>, Arc<dyn Endpoint>, Arc<dyn CompletionQueue>, Arc<dyn crate::AddressVector>) {
        let domain = fabric.open_domain(info).unwrap();
        let ep = domain.open_endpoint(info).unwrap();
        let cq = domain
            .open_cq(CqAttr {
                size: 16,
                wait: WaitKind::None,
            })
            .unwrap();
        let av = domain
            .open_av(AvAttr {
                av_type: crate::AvType::Map,
                rx_ctx_bits: RX_CTX_BITS,
            })
            .unwrap();
        ep.bind_cq(&cq, true, true).unwrap();
        ep.bind_av(&av).unwrap();
        ep.enable().unwrap();
        (domain, ep, cq, av)
    }

    #[test]
    fn tagged_send_matches_posted_recv() {
        let iface = Loopback::new();
        let info = iface
            .getinfo(&Hints {
                prov_name: Some("sockets".to_string()),
                ..Hints::default()
            })
            .unwrap()
            .remove(0);
        let fabric = LoopbackFabric {
            counters: iface.counters.clone(),
        };
        let (_da, a_ep, a_cq, a_av) = open_ep(&fabric, &info);
        let (_db, b_ep, b_cq, _b_av) = open_ep(&fabric, &info);

        let mut b_name = [0u8; SIN_ADDRLEN];
        b_ep.getname(&mut b_name).unwrap();
        let b_fi = a_av.insert(&b_name).unwrap();

        let mut recv_buf = [0u8; 16];
        unsafe {
            b_ep.trecv(recv_buf.as_mut_ptr(), recv_buf.len(), FiAddr::UNSPEC, 7, 0, 100)
                .unwrap();
            a_ep.tsend([1u8, 2, 3].as_ptr(), 3, b_fi, 7, 200).unwrap();
        }

        match a_cq.read_from(16).unwrap() {
            CqRead::Events(events) => {
                assert_eq!(events[0].0.cookie, 200);
                assert!(events[0].0.flags.contains(EntryFlags::SEND));
            }
            _ => panic!("expected sender completion"),
        }
        match b_cq.read_from(16).unwrap() {
            CqRead::Events(events) => {
                let (entry, src) = &events[0];
                assert_eq!(entry.cookie, 100);
                assert_eq!(entry.len, 3);
                assert_eq!(entry.tag, 7);
                // A is unknown to B's address vector.
                assert!(src.is_unspec());
            }
            _ => panic!("expected receiver completion"),
        }
        assert_eq!(&recv_buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn cancel_parks_error_completion() {
        let iface = Loopback::new();
        let info = iface
            .getinfo(&Hints {
                prov_name: Some("sockets".to_string()),
                ..Hints::default()
            })
            .unwrap()
            .remove(0);
        let fabric = LoopbackFabric {
            counters: iface.counters.clone(),
        };
        let (_d, ep, cq, _av) = open_ep(&fabric, &info);

        let mut buf = [0u8; 8];
        unsafe {
            ep.trecv(buf.as_mut_ptr(), buf.len(), FiAddr::UNSPEC, 1, !0, 42)
                .unwrap();
        }
        ep.cancel(42).unwrap();

        match cq.read_from(16).unwrap() {
            CqRead::ErrAvail => {}
            _ => panic!("expected error entry"),
        }
        let err = cq.read_err().unwrap();
        assert_eq!(err.kind, CqErrorKind::Canceled);
        assert_eq!(err.entry.cookie, 42);
    }
}
