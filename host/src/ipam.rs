//! SSH port and overlay IP allocation (spec.md §4.F.1 steps 3-4).
//!
//! These allocators are advisory: they pick the first free value out of
//! the currently-used set the scheduler reads from the task table. The
//! partial unique index on `tasks.ssh_port` is the actual invariant
//! enforcement (spec.md invariant 3) — a race between two schedulers (or
//! two concurrent submissions) that both pick the same port is caught by
//! the database and the loser retries with a fresh snapshot.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy)]
pub struct SshPortAllocator {
    low: u16,
    high: u16,
}

impl SshPortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        Self { low: range.0, high: range.1 }
    }

    pub fn allocate(&self, used: &BTreeSet<u16>) -> Option<u16> {
        (self.low..=self.high).find(|p| !used.contains(p))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OverlayIpAllocator {
    network: u32,
    prefix_len: u8,
}

impl OverlayIpAllocator {
    pub fn parse(cidr: &str) -> Result<Self, String> {
        let (addr_str, prefix_str) = cidr
            .split_once('/')
            .ok_or_else(|| format!("{cidr:?} is not in CIDR notation"))?;
        let addr: Ipv4Addr = addr_str.parse().map_err(|_| format!("invalid address {addr_str:?}"))?;
        let prefix_len: u8 = prefix_str.parse().map_err(|_| format!("invalid prefix {prefix_str:?}"))?;
        if prefix_len > 32 {
            return Err(format!("prefix /{prefix_len} out of range"));
        }
        let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    /// Skips the network and broadcast addresses; everything else in the
    /// block is a candidate host address.
    pub fn allocate(&self, used: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let host_bits = 32 - self.prefix_len;
        if host_bits < 2 {
            return None;
        }
        let count = 1u32 << host_bits;
        (1..count - 1).map(|offset| Ipv4Addr::from(self.network | offset)).find(|ip| !used.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_port_allocator_skips_used() {
        let alloc = SshPortAllocator::new((32000, 32003));
        let used = BTreeSet::from([32000, 32001]);
        assert_eq!(alloc.allocate(&used), Some(32002));
    }

    #[test]
    fn ssh_port_allocator_exhausted() {
        let alloc = SshPortAllocator::new((32000, 32001));
        let used = BTreeSet::from([32000, 32001]);
        assert_eq!(alloc.allocate(&used), None);
    }

    #[test]
    fn overlay_ip_skips_network_and_broadcast() {
        let alloc = OverlayIpAllocator::parse("10.200.0.0/30").unwrap();
        let first = alloc.allocate(&BTreeSet::new()).unwrap();
        assert_eq!(first, "10.200.0.1".parse::<Ipv4Addr>().unwrap());
        let used = BTreeSet::from([first]);
        let second = alloc.allocate(&used).unwrap();
        assert_eq!(second, "10.200.0.2".parse::<Ipv4Addr>().unwrap());
        let used_all = BTreeSet::from([first, second]);
        assert_eq!(alloc.allocate(&used_all), None);
    }

    #[test]
    fn overlay_ip_rejects_bad_cidr() {
        assert!(OverlayIpAllocator::parse("not-a-cidr").is_err());
        assert!(OverlayIpAllocator::parse("10.0.0.0/33").is_err());
    }
}
