//! Network-abstraction plugin over a vendor-neutral fabric interface:
//! reliable-datagram endpoints with tagged messaging and one-sided RMA,
//! adapted into the uniform surface an RPC runtime drives.
//!
//! A [`Class`] bundles a shared fabric domain (with its address cache and
//! registered-buffer pool) and one endpoint. [`Context`]s are the progress
//! units: operations posted on a context complete on that context, and
//! [`Context::progress`] harvests them into the consumer's
//! [`CompletionQueue`].

use std::collections::VecDeque;
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use ofi::Format;

mod addr;
mod codec;
mod context;
mod cq;
mod domain;
mod endpoint;
mod error;
mod mem;
mod msg;
mod op;
mod progress;
mod provider;
mod rma;

pub use addr::Addr;
pub use context::Context;
pub use error::Error;
pub use mem::{AccessMode, MemHandle, MsgBuf};
pub use op::OpId;
pub use provider::{Prov, ProvFlags, ProviderSpec};

use domain::Domain;
use endpoint::Endpoint;
use op::OpInner;
use provider::spec_for_name;

/// User-visible message tag: 30 bits of tag space.
pub type Tag = u32;

pub(crate) const MAX_TAG: Tag = (1 << 30) - 1;
/// High bit of the fabric tag separating expected from unexpected traffic.
pub(crate) const EXPECTED_TAG_FLAG: u64 = 0x1_0000_0000;
pub(crate) const UNEXPECTED_TAG_IGNORE: u64 = 0x0_FFFF_FFFF;
pub(crate) const UNEXPECTED_SIZE: usize = 4096;
pub(crate) const CQ_EVENT_NUM: usize = 16;
pub(crate) const CQ_DEPTH: usize = 8192;
pub(crate) const CQ_MAX_ERR_DATA: usize = 48;
pub(crate) const MAX_EINTR_RETRY: u32 = 1000;
/// Requested key for the whole-address-space registration of scalable-MR
/// providers.
pub(crate) const RMA_KEY: u64 = 0x0F1B_0F1B;
pub(crate) const SEP_RX_CTX_BITS: u32 = 8;
pub(crate) const MEM_BLOCK_COUNT: usize = 256;

/// Completion callback, invoked by the consumer when it triggers the
/// drained completion.
pub type Callback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Operation-specific completion payload.
pub enum CompletionInfo {
    Lookup {
        addr: Addr,
    },
    SendUnexpected,
    SendExpected,
    RecvUnexpected {
        /// The sender. Absent when the receive was canceled.
        source: Option<Addr>,
        tag: Tag,
        actual_size: usize,
    },
    RecvExpected {
        actual_size: usize,
    },
    Put,
    Get,
}

/// One delivered completion. Holds its operation alive until the consumer
/// drops it.
pub struct Completion {
    result: Result<(), Error>,
    info: CompletionInfo,
    callback: Option<Callback>,
    _op: Arc<OpInner>,
}

impl Completion {
    pub fn result(&self) -> &Result<(), Error> {
        &self.result
    }

    pub fn info(&self) -> &CompletionInfo {
        &self.info
    }

    /// Invoke the callback registered at post time.
    pub fn trigger(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(&self);
        }
    }
}

/// The completion channel injected by the RPC layer: the plugin pushes,
/// the consumer drains and triggers.
#[derive(Clone, Default)]
pub struct CompletionQueue {
    inner: Arc<Mutex<VecDeque<Completion>>>,
}

impl CompletionQueue {
    pub fn new() -> CompletionQueue {
        CompletionQueue::default()
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.inner.lock().unwrap().push_back(completion);
    }

    pub fn pop(&self) -> Option<Completion> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Plugin configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Source specification: `[domain/]host[:port]`.
    pub host: Option<String>,
    /// Disable blocking waits; progress becomes pure polling.
    pub no_wait: bool,
    /// Maximum number of contexts; values above one select a scalable
    /// endpoint where the provider supports it. Zero means one.
    pub max_contexts: u8,
    /// Provider authentication key (GNI).
    pub auth_key: Option<String>,
    pub listen: bool,
}

pub(crate) struct ClassInner {
    // Pools hold registrations and must be torn down before the domain.
    pub(crate) pools: Mutex<Vec<Arc<mem::MemPool>>>,
    pub(crate) endpoint: Endpoint,
    pub(crate) domain: Arc<Domain>,
    pub(crate) contexts: Mutex<u8>,
    pub(crate) max_contexts: u8,
    pub(crate) no_wait: bool,
    #[allow(dead_code)]
    pub(crate) listen: bool,
}

/// One plugin instance: a shared domain plus one endpoint. Cloning is
/// cheap and shares the instance.
#[derive(Clone)]
pub struct Class {
    pub(crate) inner: Arc<ClassInner>,
}

/// Whether the named protocol is backed by a usable provider.
pub fn check_protocol(interface: &Arc<dyn ofi::Interface>, protocol: &str) -> bool {
    let spec = match spec_for_name(protocol) {
        Some(spec) => spec,
        None => return false,
    };
    match interface.getinfo(&domain::base_hints(spec, false)) {
        Ok(infos) => infos.iter().any(|info| info.prov_name == spec.name),
        Err(_) => false,
    }
}

fn parse_host_spec(spec: &str) -> Result<(Option<String>, String, Option<u16>), Error> {
    let (left, port) = match spec.rsplit_once(':') {
        Some((left, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidArg("bad port in host specification"))?;
            (left, Some(port))
        }
        None => (spec, None),
    };
    let (domain, host) = match left.split_once('/') {
        Some((domain, host)) => (Some(domain.to_string()), host),
        None => (None, left),
    };
    if host.is_empty() {
        return Err(Error::InvalidArg("empty host in host specification"));
    }
    Ok((domain, host.to_string(), port))
}

fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, Error> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| Error::AddrNotAvail)?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(Error::AddrNotAvail)
}

impl Class {
    /// Bring up a plugin instance for the named protocol: domain (shared
    /// process-wide where possible), endpoint, and self-address.
    pub fn initialize(
        interface: Arc<dyn ofi::Interface>,
        protocol: &str,
        config: Config,
    ) -> Result<Class, Error> {
        let spec =
            spec_for_name(protocol).ok_or(Error::InvalidArg("protocol is not recognized"))?;
        tracing::debug!(protocol = spec.name, host = ?config.host, "initializing plugin class");

        let no_wait = config.no_wait || spec.forces_no_wait();
        let max_contexts = config.max_contexts.max(1);

        let mut domain_name = None;
        let mut node = None;
        let mut service = None;
        let mut src_addr = None;
        if let Some(host) = &config.host {
            let (domain_part, host_part, port) = parse_host_spec(host)?;
            domain_name = domain_part;
            let ip = resolve_ipv4(&host_part)?;
            match spec.format {
                Format::Sin => {
                    src_addr = Some(codec::sin_blob(ip, port.unwrap_or(0)));
                }
                Format::Psm2 | Format::Gni => {
                    // Native-format providers bind by node/service instead
                    // of a socket address.
                    node = Some(ip.to_string());
                    service = Some(port.unwrap_or(0).to_string());
                }
            }
        }

        let domain = Domain::open(
            &interface,
            spec,
            domain_name.as_deref(),
            config.auth_key.as_deref().map(str::as_bytes),
            no_wait,
            max_contexts,
        )?;
        let endpoint = Endpoint::open(
            &domain,
            node.as_deref(),
            service.as_deref(),
            src_addr,
            no_wait,
            max_contexts,
        )?;

        Ok(Class {
            inner: Arc::new(ClassInner {
                pools: Mutex::new(Vec::new()),
                endpoint,
                domain,
                contexts: Mutex::new(0),
                max_contexts,
                no_wait,
                listen: config.listen,
            }),
        })
    }

    /// Tear the instance down. Fails with `Busy` while unexpected receives
    /// are still posted on the endpoint.
    pub fn finalize(self) -> Result<(), Error> {
        if let Some(res) = &self.inner.endpoint.res {
            if !res.unexpected.is_empty() {
                return Err(Error::Busy);
            }
        }
        self.inner.pools.lock().unwrap().clear();
        Ok(())
    }

    /// Allocate a reusable operation ID, born completed.
    pub fn op_create(&self) -> OpId {
        OpId::create()
    }

    pub fn op_destroy(&self, op: OpId) {
        drop(op);
    }

    /// Canonical name of the provider backing this instance.
    pub fn protocol(&self) -> &'static str {
        self.inner.domain.spec.name
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_spec_parsing() {
        assert_eq!(
            parse_host_spec("127.0.0.1:4000").unwrap(),
            (None, "127.0.0.1".to_string(), Some(4000))
        );
        assert_eq!(
            parse_host_spec("eth0/10.0.0.3:77").unwrap(),
            (Some("eth0".to_string()), "10.0.0.3".to_string(), Some(77))
        );
        assert_eq!(
            parse_host_spec("10.0.0.3").unwrap(),
            (None, "10.0.0.3".to_string(), None)
        );
        assert!(parse_host_spec("host:notaport").is_err());
        assert!(parse_host_spec("/1.2.3.4").is_err());
    }

    #[test]
    fn check_protocol_consults_the_fabric() {
        let iface: Arc<dyn ofi::Interface> = ofi::loopback::Loopback::new();
        assert!(check_protocol(&iface, "sockets"));
        assert!(check_protocol(&iface, "tcp"));
        // Recognized by the table but absent from this fabric.
        assert!(!check_protocol(&iface, "gni"));
        // Not in the table at all.
        assert!(!check_protocol(&iface, "udp"));
    }
}
