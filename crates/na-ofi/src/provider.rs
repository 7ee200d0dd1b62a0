//! Static table of supported providers. This is the only place that
//! encodes per-backend quirks; consumers gate on the table's flags rather
//! than on provider names.

use bitflags::bitflags;
use ofi::{Caps, Format, Progress};

bitflags! {
    /// Provider behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProvFlags: u32 {
        /// Requires domain verification in addition to the provider match.
        const VERIFY_PROV_DOM = 1 << 0;
        /// Supports wait sets.
        const WAIT_SET        = 1 << 1;
        /// Supports wait file descriptors.
        const WAIT_FD         = 1 << 2;
        /// Workaround: never signal the CQ for this provider.
        const SKIP_SIGNAL     = 1 << 4;
        /// Workaround: serialize all access to the fabric domain.
        const DOMAIN_LOCK     = 1 << 5;
        /// Scalable endpoints are disabled for this provider.
        const NO_SEP          = 1 << 6;
        /// Assume blocking is safe without consulting the fabric try-wait.
        const TRYWAIT_SAFE    = 1 << 7;
    }
}

/// Provider identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prov {
    Sockets,
    Tcp,
    Psm2,
    Verbs,
    Gni,
}

/// One provider profile: canonical name, alias, address format, progress
/// mode, extra capabilities beyond the required base set, and behavior
/// flags.
#[derive(Debug)]
pub struct ProviderSpec {
    pub prov: Prov,
    pub name: &'static str,
    pub alias: &'static str,
    pub format: Format,
    pub progress: Progress,
    pub extra_caps: Caps,
    pub flags: ProvFlags,
}

pub(crate) const PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        prov: Prov::Sockets,
        name: "sockets",
        alias: "",
        format: Format::Sin,
        progress: Progress::Auto,
        extra_caps: Caps::SOURCE.union(Caps::DIRECTED_RECV),
        flags: ProvFlags::VERIFY_PROV_DOM.union(ProvFlags::WAIT_FD),
    },
    ProviderSpec {
        prov: Prov::Tcp,
        name: "tcp;ofi_rxm",
        alias: "tcp",
        format: Format::Sin,
        progress: Progress::Manual,
        extra_caps: Caps::SOURCE.union(Caps::DIRECTED_RECV),
        flags: ProvFlags::WAIT_FD
            .union(ProvFlags::NO_SEP)
            .union(ProvFlags::SKIP_SIGNAL),
    },
    ProviderSpec {
        prov: Prov::Psm2,
        name: "psm2",
        alias: "",
        format: Format::Psm2,
        progress: Progress::Auto,
        extra_caps: Caps::SOURCE
            .union(Caps::SOURCE_ERR)
            .union(Caps::DIRECTED_RECV),
        flags: ProvFlags::DOMAIN_LOCK
            .union(ProvFlags::WAIT_FD)
            .union(ProvFlags::TRYWAIT_SAFE),
    },
    ProviderSpec {
        prov: Prov::Verbs,
        name: "verbs;ofi_rxm",
        alias: "verbs",
        format: Format::Sin,
        progress: Progress::Manual,
        extra_caps: Caps::SOURCE.union(Caps::DIRECTED_RECV),
        flags: ProvFlags::VERIFY_PROV_DOM
            .union(ProvFlags::WAIT_FD)
            .union(ProvFlags::NO_SEP)
            .union(ProvFlags::SKIP_SIGNAL),
    },
    ProviderSpec {
        prov: Prov::Gni,
        name: "gni",
        alias: "",
        format: Format::Gni,
        progress: Progress::Auto,
        extra_caps: Caps::SOURCE
            .union(Caps::SOURCE_ERR)
            .union(Caps::DIRECTED_RECV),
        flags: ProvFlags::WAIT_SET,
    },
];

impl ProviderSpec {
    /// Whether neither wait object kind is available, forcing no-wait mode.
    pub(crate) fn forces_no_wait(&self) -> bool {
        !self
            .flags
            .intersects(ProvFlags::WAIT_SET | ProvFlags::WAIT_FD)
    }
}

/// Recognize a provider by canonical name or alias.
pub(crate) fn spec_for_name(name: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS
        .iter()
        .find(|spec| spec.name == name || (!spec.alias.is_empty() && spec.alias == name))
}

/// Recognize the provider of a `<prov>://...` URI by its prefix.
pub(crate) fn spec_for_uri(uri: &str) -> Option<&'static ProviderSpec> {
    let (prefix, _) = uri.split_once("://")?;
    spec_for_name(prefix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_by_name_and_alias() {
        assert_eq!(spec_for_name("sockets").unwrap().prov, Prov::Sockets);
        assert_eq!(spec_for_name("tcp").unwrap().prov, Prov::Tcp);
        assert_eq!(spec_for_name("tcp;ofi_rxm").unwrap().prov, Prov::Tcp);
        assert_eq!(spec_for_name("verbs").unwrap().prov, Prov::Verbs);
        assert!(spec_for_name("mlx").is_none());
        // The empty alias never matches.
        assert!(spec_for_name("").is_none());
    }

    #[test]
    fn uri_prefix_selects_provider() {
        assert_eq!(
            spec_for_uri("sockets://127.0.0.1:4000").unwrap().prov,
            Prov::Sockets
        );
        assert_eq!(spec_for_uri("gni://0001:0x1:0x2:01:0x3:0x4:00").unwrap().prov, Prov::Gni);
        assert!(spec_for_uri("127.0.0.1:4000").is_none());
    }

    #[test]
    fn wait_support_gates_no_wait() {
        for spec in PROVIDERS {
            // Every current provider has a wait object; the helper still
            // guards consumers against future table rows without one.
            assert!(!spec.forces_no_wait(), "{} lost its wait object", spec.name);
        }
    }
}
