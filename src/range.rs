//! Conversion of address and CIDR literals into interval-set ranges.
//!
//! A range is `[start, end)`: the end bound is exclusive, which is exactly the
//! shape an nftables interval set stores (a start element followed by an
//! element flagged as interval end).

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

use crate::error::GuardError;
use crate::netfilter::{ip_from_bytes, ip_to_bytes, AddressFamily, SetElement};

/// An address range with an exclusive upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: IpAddr,
    /// First address past the range. `None` when the range runs to the last
    /// address of the family, where `start + size` does not fit in the width.
    pub end: Option<IpAddr>,
}

impl AddressRange {
    /// Range covering `prefix_len` leading bits of `start`.
    ///
    /// `start` is expected to already be the network address of the block.
    pub fn from_prefix(start: IpAddr, prefix_len: u8) -> Self {
        let end = range_end(&ip_to_bytes(start), prefix_len).and_then(|b| ip_from_bytes(&b));
        Self { start, end }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.start)
    }

    /// Interval-set elements for this range: the start, then the terminator.
    pub fn elements(&self) -> Vec<SetElement> {
        let mut elements = vec![SetElement::new(ip_to_bytes(self.start))];
        if let Some(end) = self.end {
            elements.push(SetElement::interval_end(ip_to_bytes(end)));
        }
        elements
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{} - {} (exclusive)", self.start, end),
            None => write!(f, "{} - end of address space", self.start),
        }
    }
}

/// Parse a bare address or a prefix range into an [`AddressRange`].
///
/// A bare address yields the single-address range `[a, a+1)`. For a prefix
/// range the start is the network address (host bits are dropped) and the end
/// is `start + 2^(width - prefix_len)`.
pub fn range_of(text: &str) -> Result<AddressRange, GuardError> {
    let text = text.trim();

    if text.contains('/') {
        let net: IpNet = text.parse().map_err(|_| unparseable(text))?;
        return Ok(AddressRange::from_prefix(net.network(), net.prefix_len()));
    }

    let ip: IpAddr = text.parse().map_err(|_| unparseable(text))?;
    Ok(AddressRange::from_prefix(ip, AddressFamily::of(&ip).max_prefix_len()))
}

/// Exclusive end of the block starting at `start` with `prefix_len` mask bits.
///
/// The addition is carried out over the raw bytes so it works for any width.
/// Returns `None` when the result would carry out of the address width.
pub fn range_end(start: &[u8], prefix_len: u8) -> Option<Vec<u8>> {
    let width_bits = start.len() * 8;
    let prefix_len = usize::from(prefix_len).min(width_bits);
    let shift = width_bits - prefix_len;
    if shift >= width_bits {
        return None;
    }

    let mut end = start.to_vec();
    let mut idx = end.len() - 1 - shift / 8;
    let mut carry: u16 = 1 << (shift % 8);

    loop {
        let sum = u16::from(end[idx]) + carry;
        end[idx] = (sum & 0xff) as u8;
        carry = sum >> 8;
        if carry == 0 {
            return Some(end);
        }
        if idx == 0 {
            return None;
        }
        idx -= 1;
    }
}

fn unparseable(text: &str) -> GuardError {
    GuardError::InvalidAddressSpec(format!(
        "can't extract ip range from \"{}\", no CIDR or IP detected",
        text
    ))
}
