//! Per-consumer progress units. For basic endpoints a context aliases the
//! endpoint's CQ and unexpected queue; for scalable endpoints each context
//! owns a distinct CQ and a transmit/receive subcontext pair.

use std::sync::Arc;

use crate::endpoint::{open_cq_with_wait, CtxResources};
use crate::error::Error;
use crate::{Class, CompletionQueue};

pub struct Context {
    pub(crate) class: Class,
    pub(crate) idx: u8,
    pub(crate) tx: Arc<dyn ofi::Endpoint>,
    pub(crate) rx: Arc<dyn ofi::Endpoint>,
    pub(crate) res: Arc<CtxResources>,
    pub(crate) completions: CompletionQueue,
    sep_ctx: bool,
}

impl Class {
    /// Create the progress unit with the given index. Completions harvested
    /// on it are pushed to `completions`, which the consumer drains.
    pub fn context_create(&self, id: u8, completions: CompletionQueue) -> Result<Context, Error> {
        let inner = &self.inner;
        let endpoint = &inner.endpoint;
        let mut count = inner.contexts.lock().unwrap();
        if *count >= inner.max_contexts || id >= inner.max_contexts {
            return Err(Error::OpNotSupported);
        }

        let context = if !endpoint.sep {
            let res = endpoint
                .res
                .clone()
                .ok_or(Error::Fault("basic endpoint has no completion resources"))?;
            Context {
                class: self.clone(),
                idx: id,
                tx: endpoint.ep.clone(),
                rx: endpoint.ep.clone(),
                res,
                completions,
                sep_ctx: false,
            }
        } else {
            let (cq, wait) = open_cq_with_wait(&inner.domain, inner.no_wait)?;
            let tx = endpoint.ep.tx_context(id)?;
            let rx = endpoint.ep.rx_context(id)?;
            tx.bind_cq(&cq, true, false)?;
            rx.bind_cq(&cq, false, true)?;
            tx.enable()?;
            rx.enable()?;
            Context {
                class: self.clone(),
                idx: id,
                tx,
                rx,
                res: Arc::new(CtxResources::new(cq, wait)),
                completions,
                sep_ctx: true,
            }
        };

        *count += 1;
        Ok(context)
    }
}

impl Context {
    pub fn id(&self) -> u8 {
        self.idx
    }

    /// The completion queue injected at creation.
    pub fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    /// Tear the context down. Fails with `Busy` while unexpected receives
    /// are still posted on a context-owned queue; the context is consumed
    /// either way.
    pub fn destroy(self) -> Result<(), Error> {
        if self.sep_ctx && !self.res.unexpected.is_empty() {
            return Err(Error::Busy);
        }
        *self.class.inner.contexts.lock().unwrap() -= 1;
        Ok(())
    }
}
