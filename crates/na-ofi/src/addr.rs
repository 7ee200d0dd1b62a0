//! Resolvable peer identities: reference-counted address objects backed by
//! the domain's address cache, with lazy URI/native-byte recovery and a
//! `(len, bytes)` serial form.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use ofi::{FiAddr, Format};

use crate::codec;
use crate::context::Context;
use crate::domain::Domain;
use crate::error::Error;
use crate::op::{OpId, OpKind};
use crate::provider::spec_for_uri;
use crate::{Callback, Class};

pub(crate) struct AddrInner {
    pub(crate) domain: Arc<Domain>,
    pub(crate) fi_addr: FiAddr,
    pub(crate) key: u64,
    pub(crate) native: Mutex<Option<Vec<u8>>>,
    pub(crate) uri: Mutex<Option<String>>,
    pub(crate) is_self: bool,
    pub(crate) remove: AtomicBool,
}

impl Drop for AddrInner {
    fn drop(&mut self) {
        // Removal from the AV is deferred to the last reference so the
        // cache never sees repeated insert/remove cycles for a live peer.
        if self.remove.load(Ordering::SeqCst) && self.key != 0 {
            if let Err(err) = self.domain.cache_remove(self.key, self.fi_addr) {
                tracing::debug!(key = self.key, %err, "address removal skipped");
            }
        }
    }
}

/// A peer identity. Cloning is reference duplication; the backing state is
/// freed when the last clone drops.
#[derive(Clone)]
pub struct Addr {
    pub(crate) inner: Arc<AddrInner>,
}

impl Addr {
    pub(crate) fn alloc(
        domain: Arc<Domain>,
        fi_addr: FiAddr,
        key: u64,
        native: Option<Vec<u8>>,
        uri: Option<String>,
        is_self: bool,
    ) -> Addr {
        Addr {
            inner: Arc::new(AddrInner {
                domain,
                fi_addr,
                key,
                native: Mutex::new(native),
                uri: Mutex::new(uri),
                is_self,
                remove: AtomicBool::new(false),
            }),
        }
    }

    /// The compact fabric-address handle backing this address.
    pub fn handle(&self) -> u64 {
        self.inner.fi_addr.0
    }

    pub fn is_self(&self) -> bool {
        self.inner.is_self
    }

    pub(crate) fn fi_addr(&self) -> FiAddr {
        self.inner.fi_addr
    }

    /// Recover the native bytes, looking them up from the AV if this
    /// address was learned from a bare fabric handle.
    pub(crate) fn ensure_native(&self) -> Result<Vec<u8>, Error> {
        if let Some(bytes) = self.inner.native.lock().unwrap().clone() {
            return Ok(bytes);
        }
        if self.inner.fi_addr.is_unspec() {
            return Err(Error::AddrNotAvail);
        }
        let bytes = self.inner.domain.av_lookup(self.inner.fi_addr)?;
        *self.inner.native.lock().unwrap() = Some(bytes.clone());
        Ok(bytes)
    }
}

/// Build the URI for native bytes: `<prov>://` plus the fabric's printable
/// form. PSM2 is special-cased to the endpoint's externally-visible
/// IP:port, since its internal representation is not routable from
/// outside.
pub(crate) fn format_uri(
    domain: &Domain,
    psm2_src: Option<(&str, &str)>,
    bytes: &[u8],
) -> Result<String, Error> {
    if domain.spec.format == Format::Psm2 {
        let (node, service) = psm2_src.ok_or(Error::AddrNotAvail)?;
        return Ok(format!("{}://{}:{}", domain.spec.name, node, service));
    }
    let mut printable = domain.av.straddr(bytes);
    if printable.is_empty() {
        // Fall back to the codec's own rendering when the fabric cannot
        // print this format.
        printable =
            codec::native_to_string(domain.spec.format, bytes).ok_or(Error::AddrNotAvail)?;
    }
    if let Some(pos) = printable.find("://") {
        printable = printable.split_off(pos + 3);
    }
    Ok(format!("{}://{}", domain.spec.name, printable))
}

impl Class {
    /// Synchronous lookup of a peer by URI.
    pub fn addr_lookup2(&self, name: &str) -> Result<Addr, Error> {
        let domain = &self.inner.domain;
        let spec = spec_for_uri(name)
            .ok_or(Error::InvalidArg("unrecognized provider prefix in address"))?;
        if !std::ptr::eq(spec, domain.spec) {
            return Err(Error::InvalidArg("address provider does not match class"));
        }
        let bytes = codec::parse_uri(domain.spec.format, name)?;
        let (fi_addr, key) = domain.cache_lookup(domain.spec.format, &bytes)?;
        Ok(Addr::alloc(
            domain.clone(),
            fi_addr,
            key,
            Some(bytes),
            Some(name.to_string()),
            false,
        ))
    }

    /// The endpoint's own address.
    pub fn addr_self(&self) -> Addr {
        self.inner.endpoint.src_addr.clone()
    }

    pub fn addr_dup(&self, addr: &Addr) -> Addr {
        addr.clone()
    }

    pub fn addr_free(&self, addr: Addr) {
        drop(addr);
    }

    /// Mark the address for cache and AV removal when the last reference
    /// is freed.
    pub fn addr_set_remove(&self, addr: &Addr) {
        addr.inner.remove.store(true, Ordering::SeqCst);
    }

    pub fn addr_is_self(&self, addr: &Addr) -> bool {
        addr.is_self()
    }

    /// The URI of an address, regenerated from native bytes when it was
    /// not produced by a lookup.
    pub fn addr_to_string(&self, addr: &Addr) -> Result<String, Error> {
        if let Some(uri) = addr.inner.uri.lock().unwrap().clone() {
            return Ok(uri);
        }
        let bytes = addr.ensure_native()?;
        let endpoint = &self.inner.endpoint;
        let psm2_src = endpoint
            .src_node
            .as_deref()
            .zip(endpoint.src_service.as_deref());
        let uri = format_uri(&self.inner.domain, psm2_src, &bytes)?;
        *addr.inner.uri.lock().unwrap() = Some(uri.clone());
        Ok(uri)
    }

    pub fn addr_get_serialize_size(&self, addr: &Addr) -> Result<usize, Error> {
        Ok(addr.ensure_native()?.len() + std::mem::size_of::<u64>())
    }

    /// Serial form: `[addrlen: 8 LE][native bytes]`.
    pub fn addr_serialize(&self, buf: &mut [u8], addr: &Addr) -> Result<(), Error> {
        let bytes = addr.ensure_native()?;
        let need = bytes.len() + 8;
        if buf.len() < need {
            return Err(Error::Overflow);
        }
        LittleEndian::write_u64(&mut buf[0..8], bytes.len() as u64);
        buf[8..need].copy_from_slice(&bytes);
        Ok(())
    }

    /// Rebuild an address from its serial form, re-running the cache
    /// lookup to recover the fabric handle.
    pub fn addr_deserialize(&self, buf: &[u8]) -> Result<Addr, Error> {
        if buf.len() < 8 {
            return Err(Error::Overflow);
        }
        let len = LittleEndian::read_u64(&buf[0..8]) as usize;
        if buf.len() < 8 + len {
            return Err(Error::Overflow);
        }
        let bytes = buf[8..8 + len].to_vec();
        let domain = &self.inner.domain;
        let (fi_addr, key) = domain.cache_lookup(domain.spec.format, &bytes)?;
        // URI regeneration is deferred until requested.
        Ok(Addr::alloc(
            domain.clone(),
            fi_addr,
            key,
            Some(bytes),
            None,
            false,
        ))
    }
}

impl Context {
    /// Lookup flavor that reports through the completion queue. Address
    /// insertion is blocking, so the completion is delivered before this
    /// returns.
    pub fn addr_lookup(&self, op: &OpId, callback: Callback, name: &str) -> Result<(), Error> {
        self.post_begin(op, OpKind::Lookup(None), callback, None)?;
        match self.class.addr_lookup2(name) {
            Ok(addr) => {
                {
                    let mut state = op.inner.state.lock().unwrap();
                    state.kind = OpKind::Lookup(Some(addr.clone()));
                    state.addr = Some(addr);
                }
                self.complete(op.inner.clone(), Ok(()));
                Ok(())
            }
            Err(err) => {
                self.post_abort(op);
                Err(err)
            }
        }
    }
}
