//! Transport endpoints above a domain: basic endpoints with their own CQ
//! and unexpected-operation queue, or scalable endpoints whose contexts
//! fan out their own resources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ofi::{CqAttr, FabricError, FiAddr, Format, WaitKind};

use crate::addr::{format_uri, Addr};
use crate::codec;
use crate::domain::{base_hints, Domain};
use crate::error::Error;
use crate::op::{OpInner, OpQueue};
use crate::provider::ProvFlags;
use crate::CQ_DEPTH;

/// Completion resources shared by every consumer of one CQ: the queue of
/// posted unexpected receives and the table of in-flight operations keyed
/// by their fabric context cookie.
pub(crate) struct CtxResources {
    pub(crate) cq: Arc<dyn ofi::CompletionQueue>,
    pub(crate) wait: Option<Arc<dyn ofi::WaitSet>>,
    pub(crate) unexpected: OpQueue,
    pub(crate) inflight: Mutex<HashMap<u64, Arc<OpInner>>>,
}

impl CtxResources {
    pub(crate) fn new(
        cq: Arc<dyn ofi::CompletionQueue>,
        wait: Option<Arc<dyn ofi::WaitSet>>,
    ) -> CtxResources {
        CtxResources {
            cq,
            wait,
            unexpected: OpQueue::default(),
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Open a CQ with the wait object the provider supports: an fd when
/// available, a wait set otherwise, or nothing when waiting is disabled.
pub(crate) fn open_cq_with_wait(
    domain: &Domain,
    no_wait: bool,
) -> Result<(Arc<dyn ofi::CompletionQueue>, Option<Arc<dyn ofi::WaitSet>>), Error> {
    let (wait_kind, wait) = if no_wait {
        (WaitKind::None, None)
    } else if domain.spec.flags.contains(ProvFlags::WAIT_FD) {
        (WaitKind::Fd, None)
    } else {
        let wait_set = domain.fabric.open_wait_set()?;
        (WaitKind::Set(wait_set.clone()), Some(wait_set))
    };
    let cq = domain.raw.open_cq(CqAttr {
        size: CQ_DEPTH,
        wait: wait_kind,
    })?;
    Ok((cq, wait))
}

pub(crate) struct Endpoint {
    pub(crate) ep: Arc<dyn ofi::Endpoint>,
    /// Basic-endpoint resources; scalable endpoints leave this unset and
    /// each context owns its own.
    pub(crate) res: Option<Arc<CtxResources>>,
    pub(crate) sep: bool,
    pub(crate) src_node: Option<String>,
    pub(crate) src_service: Option<String>,
    pub(crate) src_addr: Addr,
}

impl Endpoint {
    pub(crate) fn open(
        domain: &Arc<Domain>,
        node: Option<&str>,
        service: Option<&str>,
        src_addr: Option<Vec<u8>>,
        no_wait: bool,
        max_contexts: u8,
    ) -> Result<Endpoint, Error> {
        let mut hints = base_hints(domain.spec, no_wait);
        hints.domain = Some(domain.info.domain_name.clone());
        hints.node = node.map(str::to_string);
        hints.service = service.map(str::to_string);
        // FI_SOURCE-style resolution applies to node/service binding only;
        // an explicit source address is passed through as-is.
        hints.source = node.is_some();
        hints.src_addr = src_addr;
        hints.tx_ctx_cnt = max_contexts as usize;
        hints.rx_ctx_cnt = max_contexts as usize;
        let info = domain
            .interface
            .getinfo(&hints)?
            .into_iter()
            .find(|info| info.prov_name == domain.spec.name)
            .ok_or(Error::NoEntry)?;

        let sep = !domain.spec.flags.contains(ProvFlags::NO_SEP) && max_contexts >= 2;
        let (ep, res) = if sep {
            let ep = domain.raw.open_scalable_endpoint(&info)?;
            ep.bind_av(&domain.av)?;
            ep.enable()?;
            (ep, None)
        } else {
            let ep = domain.raw.open_endpoint(&info)?;
            let (cq, wait) = open_cq_with_wait(domain, no_wait)?;
            ep.bind_cq(&cq, true, true)?;
            ep.bind_av(&domain.av)?;
            ep.enable()?;
            (ep, Some(Arc::new(CtxResources::new(cq, wait))))
        };

        let src_addr = Self::ep_addr(domain, &ep, node, service)?;

        Ok(Endpoint {
            ep,
            res,
            sep,
            src_node: node.map(str::to_string),
            src_service: service.map(str::to_string),
            src_addr,
        })
    }

    /// Discover the endpoint's own address. The name query is retried once
    /// with the reported length; PSM2 names are replaced with the
    /// externally-visible IP:port so remote peers can address them.
    fn ep_addr(
        domain: &Arc<Domain>,
        ep: &Arc<dyn ofi::Endpoint>,
        node: Option<&str>,
        service: Option<&str>,
    ) -> Result<Addr, Error> {
        let mut buf = vec![0u8; domain.info.src_addrlen.max(16)];
        let len = match ep.getname(&mut buf) {
            Ok(len) => len,
            Err(FabricError::TooSmall(need)) => {
                buf.resize(need, 0);
                ep.getname(&mut buf).map_err(Error::from)?
            }
            Err(err) => return Err(err.into()),
        };
        let mut bytes = buf;
        bytes.truncate(len);

        if domain.spec.format == Format::Psm2 {
            if let (Some(node), Some(service)) = (node, service) {
                let ip = node
                    .parse()
                    .map_err(|_| Error::AddrNotAvail)?;
                let port = service.parse().map_err(|_| Error::AddrNotAvail)?;
                bytes = codec::sin_blob(ip, port);
            }
        }

        let psm2_src = node.zip(service);
        let uri = format_uri(domain, psm2_src, &bytes)?;
        Ok(Addr::alloc(
            domain.clone(),
            FiAddr::UNSPEC,
            0,
            Some(bytes),
            Some(uri),
            true,
        ))
    }
}
