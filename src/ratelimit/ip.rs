//! IP address, CIDR block and address-range matching for whitelists and rules.

use std::net::IpAddr;
use std::str::FromStr;

/// A parsed IP whitelist or rule entry.
///
/// Accepted forms are a single address (`10.0.0.1`), a CIDR block
/// (`10.0.0.0/8`, `2001:db8::/32`) and an inclusive range
/// (`192.168.0.10-192.168.0.20`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMatcher {
    /// Exactly one address
    Single(IpAddr),
    /// A network prefix
    Cidr { network: IpAddr, prefix: u8 },
    /// Inclusive address range, both ends in the same family
    Range { start: IpAddr, end: IpAddr },
}

impl IpMatcher {
    /// Parse an entry, returning `None` for anything malformed.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();

        if let Some((network, prefix)) = entry.split_once('/') {
            let network = parse_addr(network)?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            if prefix > max_prefix(&network) {
                return None;
            }
            return Some(IpMatcher::Cidr { network, prefix });
        }

        if let Some((start, end)) = entry.split_once('-') {
            let start = parse_addr(start)?;
            let end = parse_addr(end)?;
            if start.is_ipv4() != end.is_ipv4() {
                return None;
            }
            return Some(IpMatcher::Range { start, end });
        }

        parse_addr(entry).map(IpMatcher::Single)
    }

    /// Whether the address falls within this entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        match *self {
            IpMatcher::Single(addr) => addr == ip,
            IpMatcher::Cidr { network, prefix } => {
                if network.is_ipv4() != ip.is_ipv4() {
                    return false;
                }
                let shift = max_prefix(&network) - prefix;
                let mask = if shift >= 128 { 0 } else { u128::MAX << shift };
                (to_bits(&network) & mask) == (to_bits(&ip) & mask)
            }
            IpMatcher::Range { start, end } => {
                if start.is_ipv4() != ip.is_ipv4() {
                    return false;
                }
                let (lo, hi) = ordered(to_bits(&start), to_bits(&end));
                let value = to_bits(&ip);
                lo <= value && value <= hi
            }
        }
    }
}

impl FromStr for IpMatcher {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpMatcher::parse(s).ok_or(())
    }
}

/// Whether `entry` (address, CIDR or range) contains the address in `ip`.
///
/// Either side failing to parse is a non-match.
pub fn entry_contains(entry: &str, ip: &str) -> bool {
    match (IpMatcher::parse(entry), parse_addr(ip)) {
        (Some(matcher), Some(ip)) => matcher.contains(&ip),
        _ => false,
    }
}

/// Whether any entry in the list contains the address.
pub fn list_contains<'a, I>(entries: I, ip: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let Some(ip) = parse_addr(ip) else {
        return false;
    };
    entries
        .into_iter()
        .filter_map(|entry| IpMatcher::parse(entry))
        .any(|matcher| matcher.contains(&ip))
}

/// Parse an address, tolerating surrounding whitespace and a bracketed IPv6 form.
pub fn parse_addr(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_start_matches('[').trim_end_matches(']');
    value.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

fn max_prefix(ip: &IpAddr) -> u8 {
    if ip.is_ipv4() {
        32
    } else {
        128
    }
}

fn to_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn ordered(a: u128, b: u128) -> (u128, u128) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_address() {
        assert!(entry_contains("10.0.0.1", "10.0.0.1"));
        assert!(!entry_contains("10.0.0.1", "10.0.0.2"));
        assert!(entry_contains("::1", "::1"));
    }

    #[test]
    fn test_cidr_block() {
        assert!(entry_contains("192.168.1.0/24", "192.168.1.77"));
        assert!(!entry_contains("192.168.1.0/24", "192.168.2.1"));
        assert!(entry_contains("0.0.0.0/0", "8.8.8.8"));
        assert!(entry_contains("2001:db8::/32", "2001:db8:1::5"));
        assert!(!entry_contains("2001:db8::/32", "10.0.0.1"));
    }

    #[test]
    fn test_address_range() {
        assert!(entry_contains("10.0.0.10-10.0.0.20", "10.0.0.15"));
        assert!(entry_contains("10.0.0.10-10.0.0.20", "10.0.0.20"));
        assert!(!entry_contains("10.0.0.10-10.0.0.20", "10.0.0.21"));

        // Reversed bounds still match
        assert!(entry_contains("10.0.0.20-10.0.0.10", "10.0.0.12"));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_client() {
        assert!(entry_contains("127.0.0.0/8", "::ffff:127.0.0.1"));
    }

    #[test]
    fn test_malformed_entries_never_match() {
        assert!(!entry_contains("not-an-ip", "10.0.0.1"));
        assert!(!entry_contains("10.0.0.0/33", "10.0.0.1"));
        assert!(!entry_contains("10.0.0.1-::1", "10.0.0.1"));
        assert!(!entry_contains("10.0.0.1", "garbage"));
        assert!(!entry_contains("10.0.0.1", ""));
    }

    #[test]
    fn test_list_contains() {
        let list = vec!["bogus".to_string(), "172.16.0.0/12".to_string()];
        assert!(list_contains(&list, "172.20.1.1"));
        assert!(!list_contains(&list, "8.8.8.8"));
        assert!(!list_contains(&list, "bogus"));
    }
}
