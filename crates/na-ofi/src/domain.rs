//! Domain lifecycle: fabric + domain + address vector + global memory
//! registration, shared process-wide across endpoints of the same
//! provider/domain, plus the address cache layered on top of the AV.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use ofi::{Access, AvAttr, AvType, Caps, FiAddr, Format, Hints, Info, MrMode, MsgOrder, Progress};

use crate::codec::{self, KeyHashBuilder};
use crate::error::Error;
use crate::provider::{ProvFlags, ProviderSpec};
use crate::{RMA_KEY, SEP_RX_CTX_BITS};

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

lazy_static::lazy_static! {
    /// Process-wide domain registry. Entries are weak; a domain removes
    /// itself on drop.
    static ref DOMAIN_REGISTRY: Mutex<Vec<(u64, Weak<Domain>)>> = Mutex::new(Vec::new());
}

/// Base provider-query hints: reliable-datagram endpoint, tagged + RMA
/// capability, the full requested MR mode, same-tag send-after-send
/// ordering, and the provider's progress model (manual when waiting is
/// disabled).
pub(crate) fn base_hints(spec: &'static ProviderSpec, no_wait: bool) -> Hints {
    Hints {
        prov_name: Some(spec.name.to_string()),
        caps: Caps::TAGGED | Caps::RMA | spec.extra_caps,
        mr_mode: MrMode::VIRT_ADDR | MrMode::ALLOCATED | MrMode::PROV_KEY | MrMode::LOCAL,
        msg_order: Some(MsgOrder::Sas),
        progress: Some(if no_wait { Progress::Manual } else { spec.progress }),
        ..Hints::default()
    }
}

fn verify_provider(spec: &ProviderSpec, domain_name: Option<&str>, info: &Info) -> bool {
    if info.prov_name != spec.name {
        return false;
    }
    // For some providers the name is ambiguous and the domain name must
    // match as well.
    if spec.flags.contains(ProvFlags::VERIFY_PROV_DOM) {
        if let Some(name) = domain_name {
            if !name.is_empty() && name != info.domain_name {
                return false;
            }
        }
    }
    true
}

pub(crate) struct Domain {
    id: u64,
    pub(crate) spec: &'static ProviderSpec,
    pub(crate) info: Info,
    pub(crate) interface: Arc<dyn ofi::Interface>,
    cache: RwLock<HashMap<u64, FiAddr, KeyHashBuilder>>,
    /// Serializes AV and cancel paths for providers with the domain-lock
    /// workaround flag.
    op_mutex: Mutex<()>,
    pub(crate) mr_key: u64,
    pub(crate) global_mr: Option<Arc<dyn ofi::MemoryRegion>>,
    pub(crate) av: Arc<dyn ofi::AddressVector>,
    pub(crate) raw: Arc<dyn ofi::Domain>,
    pub(crate) fabric: Arc<dyn ofi::Fabric>,
}

impl Domain {
    /// Find or create the domain for a provider and optional domain name.
    pub(crate) fn open(
        interface: &Arc<dyn ofi::Interface>,
        spec: &'static ProviderSpec,
        domain_name: Option<&str>,
        auth_key: Option<&[u8]>,
        no_wait: bool,
        max_contexts: u8,
    ) -> Result<Arc<Domain>, Error> {
        {
            let registry = DOMAIN_REGISTRY.lock().unwrap();
            for (_, weak) in registry.iter() {
                if let Some(domain) = weak.upgrade() {
                    if verify_provider(spec, domain_name, &domain.info) {
                        tracing::debug!(provider = spec.name, "reusing existing domain");
                        return Ok(domain);
                    }
                }
            }
        }

        let mut hints = base_hints(spec, no_wait);
        hints.domain = domain_name.map(str::to_string);
        let infos = interface.getinfo(&hints).map_err(Error::from)?;
        let mut info = infos
            .into_iter()
            .find(|info| verify_provider(spec, domain_name, info))
            .ok_or(Error::NoEntry)?;
        info.auth_key = auth_key.map(<[u8]>::to_vec);

        let fabric = interface.open_fabric(&info)?;
        let raw = fabric.open_domain(&info)?;

        if max_contexts > 1 {
            let limit = info.tx_ctx_cnt.min(info.rx_ctx_cnt);
            if max_contexts as usize > limit {
                return Err(Error::InvalidArg(
                    "requested context count exceeds provider limit",
                ));
            }
        }

        // Providers that do not require physically-backed registration get
        // one registration spanning the whole address space.
        let (global_mr, mr_key) = if !info.mr_mode.contains(MrMode::ALLOCATED) {
            let requested_key = if info.mr_mode.contains(MrMode::PROV_KEY) {
                0
            } else {
                RMA_KEY
            };
            let mr = raw.register(
                0,
                u64::MAX,
                Access::READ
                    | Access::WRITE
                    | Access::REMOTE_READ
                    | Access::REMOTE_WRITE
                    | Access::SEND
                    | Access::RECV,
                requested_key,
            )?;
            let key = mr.key();
            (Some(mr), key)
        } else {
            (None, 0)
        };

        let av = raw.open_av(AvAttr {
            av_type: AvType::Map,
            rx_ctx_bits: SEP_RX_CTX_BITS,
        })?;

        let domain = Arc::new(Domain {
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::SeqCst),
            spec,
            info,
            interface: interface.clone(),
            cache: RwLock::new(HashMap::default()),
            op_mutex: Mutex::new(()),
            mr_key,
            global_mr,
            av,
            raw,
            fabric,
        });
        DOMAIN_REGISTRY
            .lock()
            .unwrap()
            .push((domain.id, Arc::downgrade(&domain)));
        Ok(domain)
    }

    /// Serialize a fabric-domain operation when the provider demands it.
    pub(crate) fn lock_domain(&self) -> Option<MutexGuard<'_, ()>> {
        if self.spec.flags.contains(ProvFlags::DOMAIN_LOCK) {
            Some(self.op_mutex.lock().unwrap())
        } else {
            None
        }
    }

    /// Whether unexpected messages carry a source-address header.
    pub(crate) fn with_msg_hdr(&self) -> bool {
        self.spec.format == Format::Sin
    }

    /// Insert a native address into the AV, resolving sin-shaped PSM2
    /// addresses to the provider's native destination first.
    pub(crate) fn av_insert(&self, bytes: &[u8]) -> Result<FiAddr, Error> {
        let resolved;
        let bytes = if self.spec.format == Format::Psm2 && bytes.len() == codec::SIN_ADDRLEN {
            let (ip, port) = codec::sin_ip_port(bytes)
                .ok_or_else(|| Error::Protocol("malformed sin address".to_string()))?;
            let mut hints = base_hints(self.spec, false);
            hints.node = Some(ip.to_string());
            hints.service = Some(port.to_string());
            let infos = self.interface.getinfo(&hints).map_err(Error::from)?;
            resolved = infos
                .into_iter()
                .find_map(|info| info.dest_addr)
                .ok_or_else(|| {
                    Error::Protocol(format!("cannot resolve PSM2 destination {ip}:{port}"))
                })?;
            resolved.as_slice()
        } else {
            bytes
        };
        let _guard = self.lock_domain();
        Ok(self.av.insert(bytes)?)
    }

    /// Insert raw native bytes recovered from an error completion.
    pub(crate) fn av_insert_direct(&self, bytes: &[u8]) -> Result<FiAddr, Error> {
        let _guard = self.lock_domain();
        Ok(self.av.insert(bytes)?)
    }

    /// Look a fabric address back up into its native bytes.
    pub(crate) fn av_lookup(&self, fi_addr: FiAddr) -> Result<Vec<u8>, Error> {
        let _guard = self.lock_domain();
        Ok(self.av.lookup(fi_addr)?)
    }

    /// Resolve native bytes to a fabric address, inserting on first
    /// observation. Returns the handle and the derived 64-bit key.
    pub(crate) fn cache_lookup(&self, format: Format, bytes: &[u8]) -> Result<(FiAddr, u64), Error> {
        let key = codec::addr_key(format, bytes);
        if key == 0 {
            return Err(Error::ProtocolNotSupported(
                "cannot derive key from native address".to_string(),
            ));
        }

        if let Some(fi_addr) = self.cache.read().unwrap().get(&key) {
            return Ok((*fi_addr, key));
        }

        // Not cached: insert into the AV first, then reconcile under the
        // write lock. A failure past this point leaves the AV entry in
        // place; it stays usable and a later lookup adopts it.
        let fi_addr = self.av_insert(bytes)?;

        let mut cache = self.cache.write().unwrap();
        if let Some(existing) = cache.get(&key) {
            // Another thread won the race: adopt its mapping and drop the
            // entry we just inserted.
            let existing = *existing;
            self.av.remove(fi_addr).map_err(Error::from)?;
            return Ok((existing, key));
        }
        cache.insert(key, fi_addr);
        Ok((fi_addr, key))
    }

    /// Drop a cached mapping and its AV entry.
    pub(crate) fn cache_remove(&self, key: u64, fi_addr: FiAddr) -> Result<(), Error> {
        let mut cache = self.cache.write().unwrap();
        if cache.remove(&key).is_none() {
            return Err(Error::NoEntry);
        }
        self.av.remove(fi_addr).map_err(Error::from)?;
        Ok(())
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        DOMAIN_REGISTRY.lock().unwrap().retain(|(id, _)| *id != self.id);
        // Fabric objects close in field-declaration order: global MR,
        // AV, domain, fabric.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::spec_for_name;
    use ofi::loopback::Loopback;

    #[test]
    fn domains_are_shared_by_provider_and_name() {
        let iface = Loopback::new();
        let iface: Arc<dyn ofi::Interface> = iface;
        let spec = spec_for_name("sockets").unwrap();

        let a = Domain::open(&iface, spec, Some("dom-share"), None, false, 1).unwrap();
        let b = Domain::open(&iface, spec, Some("dom-share"), None, false, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A different domain name opens a distinct domain.
        let c = Domain::open(&iface, spec, Some("dom-other"), None, false, 1).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn cache_lookup_inserts_once() {
        let loopback = Loopback::new();
        let iface: Arc<dyn ofi::Interface> = loopback.clone();
        let spec = spec_for_name("sockets").unwrap();
        let domain = Domain::open(&iface, spec, Some("dom-cache"), None, false, 1).unwrap();

        let bytes = codec::parse_uri(Format::Sin, "sockets://127.0.0.1:9301").unwrap();
        let before = loopback.av_inserts();
        let (fi_a, key_a) = domain.cache_lookup(Format::Sin, &bytes).unwrap();
        let (fi_b, key_b) = domain.cache_lookup(Format::Sin, &bytes).unwrap();
        assert_eq!(fi_a, fi_b);
        assert_eq!(key_a, key_b);
        assert_eq!(loopback.av_inserts() - before, 1);

        // Removal makes the next lookup insert again.
        domain.cache_remove(key_a, fi_a).unwrap();
        let (_, key_c) = domain.cache_lookup(Format::Sin, &bytes).unwrap();
        assert_eq!(key_c, key_a);
        assert_eq!(loopback.av_inserts() - before, 2);
    }
}
