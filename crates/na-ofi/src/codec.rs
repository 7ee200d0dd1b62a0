//! Address codecs: URI string <-> native address blob conversion and the
//! 64-bit key contract over native-address bytes.
//!
//! Blob layouts are crate-defined and stable, since they travel inside
//! serialized addresses:
//! - sin: `[ipv4: 4 BE][port: 2 BE][0; 2]`
//! - psm2: two little-endian u64 (the epid pair)
//! - gni: `[device_addr: 4 LE][cdm_id: 4 LE][name_type: 1]
//!   [cm_nic_cdm_id: 3 LE][cookie: 4 LE][rx_ctx_cnt: 1][0; 15]`

use std::hash::{BuildHasherDefault, Hasher};
use std::net::Ipv4Addr;

use byteorder::{ByteOrder, LittleEndian};
use ofi::Format;

use crate::error::Error;

pub(crate) const SIN_ADDRLEN: usize = 8;
pub(crate) const PSM2_ADDRLEN: usize = 16;
pub(crate) const GNI_ADDRLEN: usize = 32;

const GNI_AV_STR_ADDR_VERSION: u32 = 1;

pub(crate) fn sin_blob(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut blob = Vec::with_capacity(SIN_ADDRLEN);
    blob.extend_from_slice(&ip.octets());
    blob.extend_from_slice(&port.to_be_bytes());
    blob.extend_from_slice(&[0, 0]);
    blob
}

pub(crate) fn sin_ip_port(blob: &[u8]) -> Option<(Ipv4Addr, u16)> {
    if blob.len() < 6 {
        return None;
    }
    Some((
        Ipv4Addr::new(blob[0], blob[1], blob[2], blob[3]),
        u16::from_be_bytes([blob[4], blob[5]]),
    ))
}

/// Parse the provider-specific part of a `<prov>://...` URI into the
/// native blob for the given address format.
pub(crate) fn parse_uri(format: Format, uri: &str) -> Result<Vec<u8>, Error> {
    let rest = uri
        .split_once("://")
        .ok_or(Error::ProtocolNotSupported(format!("malformed URI: {uri}")))?
        .1;
    match format {
        Format::Sin => parse_sin(rest),
        // PSM2 addresses are externally represented as IP:port.
        Format::Psm2 => parse_sin(rest),
        Format::Gni => parse_gni(rest),
    }
}

fn parse_sin(rest: &str) -> Result<Vec<u8>, Error> {
    let rest = rest.split('/').next().unwrap_or_default();
    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::ProtocolNotSupported(format!("bad port in: {rest}")))?;
            (host, port)
        }
        None => (rest, 0),
    };
    let ip = if host.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse::<Ipv4Addr>()
            .map_err(|_| Error::ProtocolNotSupported(format!("bad IPv4 address: {host}")))?
    };
    Ok(sin_blob(ip, port))
}

fn parse_gni(rest: &str) -> Result<Vec<u8>, Error> {
    fn dec(field: &str) -> Option<u32> {
        field.parse().ok()
    }
    fn hex(field: &str) -> Option<u32> {
        u32::from_str_radix(field.strip_prefix("0x")?, 16).ok()
    }

    let fields: Vec<&str> = rest.split(':').collect();
    if fields.len() != 7 {
        return Err(Error::ProtocolNotSupported(format!(
            "GNI address needs 7 fields: {rest}"
        )));
    }
    let parsed = (
        dec(fields[0]),
        hex(fields[1]),
        hex(fields[2]),
        dec(fields[3]),
        hex(fields[4]),
        hex(fields[5]),
        dec(fields[6]),
    );
    let (version, device_addr, cdm_id, name_type, cm_nic_cdm_id, cookie, rx_ctx_cnt) = match parsed
    {
        (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f), Some(g)) => (a, b, c, d, e, f, g),
        _ => {
            return Err(Error::ProtocolNotSupported(format!(
                "bad GNI address field in: {rest}"
            )))
        }
    };
    if version != GNI_AV_STR_ADDR_VERSION {
        return Err(Error::ProtocolNotSupported(format!(
            "unsupported GNI address version {version}"
        )));
    }
    tracing::debug!(
        device_addr,
        cdm_id,
        name_type,
        cm_nic_cdm_id,
        cookie,
        rx_ctx_cnt,
        "decoded GNI address"
    );

    let mut blob = vec![0u8; GNI_ADDRLEN];
    LittleEndian::write_u32(&mut blob[0..4], device_addr);
    LittleEndian::write_u32(&mut blob[4..8], cdm_id);
    blob[8] = (name_type & 0xff) as u8;
    LittleEndian::write_u24(&mut blob[9..12], cm_nic_cdm_id & 0xff_ffff);
    LittleEndian::write_u32(&mut blob[12..16], cookie);
    blob[16] = (rx_ctx_cnt & 0xff) as u8;
    Ok(blob)
}

/// Render a native blob as the provider-specific URI part. Used when the
/// fabric's straddr helper is not applicable.
pub(crate) fn native_to_string(format: Format, blob: &[u8]) -> Option<String> {
    match format {
        Format::Sin | Format::Psm2 => {
            let (ip, port) = sin_ip_port(blob)?;
            Some(format!("{ip}:{port}"))
        }
        Format::Gni => {
            if blob.len() < GNI_ADDRLEN {
                return None;
            }
            let device_addr = LittleEndian::read_u32(&blob[0..4]);
            let cdm_id = LittleEndian::read_u32(&blob[4..8]);
            let name_type = blob[8];
            let cm_nic_cdm_id = LittleEndian::read_u24(&blob[9..12]);
            let cookie = LittleEndian::read_u32(&blob[12..16]);
            let rx_ctx_cnt = blob[16];
            Some(format!(
                "{:04}:0x{:08x}:0x{:08x}:{:02}:0x{:06x}:0x{:08x}:{:02}",
                GNI_AV_STR_ADDR_VERSION,
                device_addr,
                cdm_id,
                name_type,
                cm_nic_cdm_id,
                cookie,
                rx_ctx_cnt
            ))
        }
    }
}

/// Derive the 64-bit cache key for a native blob. Zero is reserved and
/// signals an encoding failure.
pub(crate) fn addr_key(format: Format, blob: &[u8]) -> u64 {
    match format {
        Format::Sin => sin_key(blob),
        Format::Psm2 => psm2_key(blob),
        Format::Gni => gni_key(blob),
    }
}

fn sin_key(blob: &[u8]) -> u64 {
    match sin_ip_port(blob) {
        Some((ip, port)) => ((u32::from(ip) as u64) << 32) | port as u64,
        None => 0,
    }
}

/// PSM2 keys dispatch on the blob length: externally-parsed addresses are
/// sin-shaped and use the sin rule; native epid pairs use their first
/// 64 bits.
fn psm2_key(blob: &[u8]) -> u64 {
    match blob.len() {
        SIN_ADDRLEN => sin_key(blob),
        PSM2_ADDRLEN => LittleEndian::read_u64(&blob[0..8]),
        _ => 0,
    }
}

fn gni_key(blob: &[u8]) -> u64 {
    if blob.len() < GNI_ADDRLEN {
        return 0;
    }
    let device_addr = LittleEndian::read_u32(&blob[0..4]);
    let cdm_id = LittleEndian::read_u32(&blob[4..8]);
    ((device_addr as u64) << 32) | cdm_id as u64
}

/// Bucket hash for address-cache keys: mixes the high and low key halves
/// so keys whose ports or cdm-ids cluster still spread across buckets.
#[derive(Default)]
pub(crate) struct KeyMixHasher(u64);

impl Hasher for KeyMixHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | b as u64;
        }
    }

    fn write_u64(&mut self, key: u64) {
        let hi = (key >> 32) as u32;
        let lo = key as u32;
        self.0 = ((hi & 0xFFFF_0000) | (lo & 0xFFFF)) as u64;
    }
}

pub(crate) type KeyHashBuilder = BuildHasherDefault<KeyMixHasher>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sin_uri_round_trip() {
        let blob = parse_uri(Format::Sin, "sockets://192.168.1.9:4000").unwrap();
        assert_eq!(blob.len(), SIN_ADDRLEN);
        assert_eq!(native_to_string(Format::Sin, &blob).unwrap(), "192.168.1.9:4000");
        assert_eq!(
            addr_key(Format::Sin, &blob),
            ((u32::from(Ipv4Addr::new(192, 168, 1, 9)) as u64) << 32) | 4000
        );

        // Port-only form binds the wildcard address.
        let blob = parse_uri(Format::Sin, "sockets://:9000").unwrap();
        assert_eq!(sin_ip_port(&blob).unwrap(), (Ipv4Addr::UNSPECIFIED, 9000));

        // Host-only form defaults the port.
        let blob = parse_uri(Format::Sin, "sockets://10.0.0.1").unwrap();
        assert_eq!(sin_ip_port(&blob).unwrap(), (Ipv4Addr::new(10, 0, 0, 1), 0));
    }

    #[test]
    fn sin_uri_rejects_garbage() {
        assert!(parse_uri(Format::Sin, "sockets://not-an-ip:20").is_err());
        assert!(parse_uri(Format::Sin, "sockets://1.2.3.4:70000").is_err());
        assert!(parse_uri(Format::Sin, "no-scheme").is_err());
    }

    #[test]
    fn gni_uri_round_trip() {
        let uri = "0001:0x0000abcd:0x00001234:01:0x000099:0xdeadbeef:04";
        let blob = parse_gni(uri).unwrap();
        assert_eq!(blob.len(), GNI_ADDRLEN);
        assert_eq!(native_to_string(Format::Gni, &blob).unwrap(), uri);
        assert_eq!(addr_key(Format::Gni, &blob), (0xabcd_u64 << 32) | 0x1234);

        // Version field is pinned.
        assert!(parse_gni("0002:0x0:0x0:00:0x0:0x0:00").is_err());
        assert!(parse_gni("0001:0x0:0x0").is_err());
    }

    #[test]
    fn psm2_key_dispatches_on_length() {
        // Externally-parsed PSM2 addresses are sin-shaped.
        let sin = parse_uri(Format::Psm2, "psm2://10.1.2.3:88").unwrap();
        assert_eq!(addr_key(Format::Psm2, &sin), addr_key(Format::Sin, &sin));

        // Native epid pairs use their first 64 bits.
        let mut native = vec![0u8; PSM2_ADDRLEN];
        LittleEndian::write_u64(&mut native[0..8], 0x1122_3344_5566_7788);
        assert_eq!(addr_key(Format::Psm2, &native), 0x1122_3344_5566_7788);

        // Unknown lengths are encoding failures.
        assert_eq!(addr_key(Format::Psm2, &[0u8; 4]), 0);
    }

    #[test]
    fn key_hash_mixes_halves() {
        let mut hasher = KeyMixHasher::default();
        hasher.write_u64(0xAAAA_BBBB_CCCC_DDDD);
        // High half keeps its upper 16 bits, low half its lower 16.
        assert_eq!(hasher.finish(), (0xAAAA_0000u64 | 0xDDDD) as u64);
    }
}
