//! Client IP allowlisting.
//!
//! An [`IpRange`] is a comma-separated list of entries, each one of:
//!
//! - a single IPv4/IPv6 address (`192.168.0.2`, `fe80::1`)
//! - a CIDR prefix (`192.168.0.0/24`, `fd00::/8`)
//! - an IPv4 address with an explicit mask (`192.168.0.0/255.255.255.0`)
//! - a dashed inclusive range (`192.168.0.10-192.168.0.50`)

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpRangeParseError {
    #[error("empty ip range")]
    Empty,

    #[error("invalid ip address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid prefix length or mask: {0:?}")]
    InvalidPrefix(String),

    #[error("range endpoints mix address families: {0:?}")]
    MixedFamilies(String),

    #[error("range start after end: {0:?}")]
    InvertedRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    V4 { start: u32, end: u32 },
    V6 { start: u128, end: u128 },
}

impl Entry {
    fn single(addr: IpAddr) -> Entry {
        match addr {
            IpAddr::V4(a) => {
                let v = u32::from(a);
                Entry::V4 { start: v, end: v }
            }
            IpAddr::V6(a) => {
                let v = u128::from(a);
                Entry::V6 { start: v, end: v }
            }
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        // IPv4-mapped IPv6 clients match their IPv4 entries.
        let addr = match addr {
            IpAddr::V6(a) => match a.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => addr,
            },
            v4 => v4,
        };
        match (self, addr) {
            (Entry::V4 { start, end }, IpAddr::V4(a)) => {
                let v = u32::from(a);
                *start <= v && v <= *end
            }
            (Entry::V6 { start, end }, IpAddr::V6(a)) => {
                let v = u128::from(a);
                *start <= v && v <= *end
            }
            _ => false,
        }
    }
}

/// A set of address ranges. See the module docs for the accepted syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    entries: Vec<Entry>,
}

impl IpRange {
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries.iter().any(|e| e.contains(addr))
    }
}

impl FromStr for IpRange {
    type Err = IpRangeParseError;

    fn from_str(s: &str) -> Result<Self, IpRangeParseError> {
        let mut entries = Vec::new();
        for raw in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            entries.push(parse_entry(raw)?);
        }
        if entries.is_empty() {
            return Err(IpRangeParseError::Empty);
        }
        Ok(IpRange { entries })
    }
}

fn parse_entry(raw: &str) -> Result<Entry, IpRangeParseError> {
    if let Some((start, end)) = raw.split_once('-') {
        let start = parse_addr(start.trim())?;
        let end = parse_addr(end.trim())?;
        return match (start, end) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let (a, b) = (u32::from(a), u32::from(b));
                if a > b {
                    Err(IpRangeParseError::InvertedRange(raw.to_string()))
                } else {
                    Ok(Entry::V4 { start: a, end: b })
                }
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let (a, b) = (u128::from(a), u128::from(b));
                if a > b {
                    Err(IpRangeParseError::InvertedRange(raw.to_string()))
                } else {
                    Ok(Entry::V6 { start: a, end: b })
                }
            }
            _ => Err(IpRangeParseError::MixedFamilies(raw.to_string())),
        };
    }

    if let Some((addr, suffix)) = raw.split_once('/') {
        let addr = parse_addr(addr.trim())?;
        let suffix = suffix.trim();

        // IPv4 with an explicit dotted mask.
        if let (IpAddr::V4(a), Ok(mask)) = (addr, Ipv4Addr::from_str(suffix)) {
            let mask = u32::from(mask);
            // Masks must be contiguous ones followed by zeros.
            if mask != 0 && (!mask).wrapping_add(1) & !mask != 0 {
                return Err(IpRangeParseError::InvalidPrefix(raw.to_string()));
            }
            let base = u32::from(a) & mask;
            return Ok(Entry::V4 {
                start: base,
                end: base | !mask,
            });
        }

        let prefix: u32 = suffix
            .parse()
            .map_err(|_| IpRangeParseError::InvalidPrefix(raw.to_string()))?;
        return match addr {
            IpAddr::V4(a) => {
                if prefix > 32 {
                    return Err(IpRangeParseError::InvalidPrefix(raw.to_string()));
                }
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                let base = u32::from(a) & mask;
                Ok(Entry::V4 {
                    start: base,
                    end: base | !mask,
                })
            }
            IpAddr::V6(a) => {
                if prefix > 128 {
                    return Err(IpRangeParseError::InvalidPrefix(raw.to_string()));
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                let base = u128::from(a) & mask;
                Ok(Entry::V6 {
                    start: base,
                    end: base | !mask,
                })
            }
        };
    }

    Ok(Entry::single(parse_addr(raw)?))
}

fn parse_addr(raw: &str) -> Result<IpAddr, IpRangeParseError> {
    IpAddr::from_str(raw).map_err(|_| IpRangeParseError::InvalidAddress(raw.to_string()))
}
