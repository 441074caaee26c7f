//! Context-id and IP allocation.

use std::{
    collections::BTreeSet,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use ipnetwork::Ipv4Network;

use crate::{LiaError, LiaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Context ids below this are reserved by the vsock transport.
const MIN_GUEST_CID: u32 = 3;

/// First host octet handed out to guests.
const HOST_OCTET_START: u32 = 100;

/// Last host octet handed out to guests.
const HOST_OCTET_END: u32 = 254;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Allocates vsock context ids and guest IPs.
///
/// Both resources use the same discipline: an atomic high-water counter plus a
/// freed-set searched first, so values released by terminated VMs are reused
/// lowest-first and no two live VMs ever alias.
#[derive(Debug)]
pub struct ResourceAllocator {
    next_cid: AtomicU32,
    freed_cids: Mutex<BTreeSet<u32>>,
    next_octet: AtomicU32,
    freed_octets: Mutex<BTreeSet<u8>>,
    network: Ipv4Network,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceAllocator {
    /// Creates an allocator for the given subnet, handing out context ids from
    /// `cid_start` (clamped to the vsock minimum of 3).
    pub fn new(cid_start: u32, network: Ipv4Network) -> Self {
        Self {
            next_cid: AtomicU32::new(cid_start.max(MIN_GUEST_CID)),
            freed_cids: Mutex::new(BTreeSet::new()),
            next_octet: AtomicU32::new(HOST_OCTET_START),
            freed_octets: Mutex::new(BTreeSet::new()),
            network,
        }
    }

    /// Allocates the next context id, preferring freed ones.
    pub fn allocate_cid(&self) -> u32 {
        if let Some(cid) = self.freed_cids.lock().unwrap().pop_first() {
            return cid;
        }
        self.next_cid.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns a context id to the pool once its VM is fully torn down.
    pub fn free_cid(&self, cid: u32) {
        self.freed_cids.lock().unwrap().insert(cid);
    }

    /// Allocates the next guest IP, preferring freed ones. Fails once the host
    /// range (.100–.254) is exhausted.
    pub fn allocate_ip(&self) -> LiaResult<Ipv4Addr> {
        if let Some(octet) = self.freed_octets.lock().unwrap().pop_first() {
            return Ok(self.ip_with_octet(octet));
        }

        let octet = self.next_octet.fetch_add(1, Ordering::SeqCst);
        if octet > HOST_OCTET_END {
            // Keep the counter parked past the end so later calls keep failing
            // until something is freed.
            self.next_octet.store(HOST_OCTET_END + 1, Ordering::SeqCst);
            return Err(LiaError::Allocation(format!(
                "no free ip address in {}",
                self.network
            )));
        }

        Ok(self.ip_with_octet(octet as u8))
    }

    /// Returns an IP to the pool once its VM is fully torn down.
    pub fn free_ip(&self, ip: Ipv4Addr) {
        self.freed_octets.lock().unwrap().insert(ip.octets()[3]);
    }

    fn ip_with_octet(&self, octet: u8) -> Ipv4Addr {
        let base = self.network.network().octets();
        Ipv4Addr::new(base[0], base[1], base[2], octet)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn allocator() -> ResourceAllocator {
        ResourceAllocator::new(100, "172.16.0.0/24".parse().unwrap())
    }

    #[test]
    fn test_live_allocations_never_alias() {
        let allocator = allocator();

        let cids: HashSet<u32> = (0..50).map(|_| allocator.allocate_cid()).collect();
        assert_eq!(cids.len(), 50);

        let ips: HashSet<Ipv4Addr> = (0..50).map(|_| allocator.allocate_ip().unwrap()).collect();
        assert_eq!(ips.len(), 50);
        assert!(ips.contains(&"172.16.0.100".parse().unwrap()));
    }

    #[test]
    fn test_freed_values_are_reused_lowest_first() {
        let allocator = allocator();

        let a = allocator.allocate_ip().unwrap();
        let b = allocator.allocate_ip().unwrap();
        let _c = allocator.allocate_ip().unwrap();

        allocator.free_ip(b);
        allocator.free_ip(a);

        // .100 comes back before .101, before the counter advances again.
        assert_eq!(allocator.allocate_ip().unwrap(), a);
        assert_eq!(allocator.allocate_ip().unwrap(), b);
        assert_eq!(
            allocator.allocate_ip().unwrap(),
            "172.16.0.103".parse::<Ipv4Addr>().unwrap()
        );

        let cid = allocator.allocate_cid();
        allocator.free_cid(cid);
        assert_eq!(allocator.allocate_cid(), cid);
    }

    #[test]
    fn test_ip_exhaustion_is_an_allocation_error() {
        let allocator = allocator();

        for _ in 100..=254 {
            allocator.allocate_ip().unwrap();
        }

        let err = allocator.allocate_ip().unwrap_err();
        assert!(matches!(err, LiaError::Allocation(_)));

        // Freeing one makes exactly one allocation succeed again.
        allocator.free_ip("172.16.0.177".parse().unwrap());
        assert_eq!(
            allocator.allocate_ip().unwrap(),
            "172.16.0.177".parse::<Ipv4Addr>().unwrap()
        );
        assert!(allocator.allocate_ip().is_err());
    }

    #[test]
    fn test_cid_start_is_clamped_to_vsock_minimum() {
        let allocator = ResourceAllocator::new(0, "10.0.0.0/24".parse().unwrap());
        assert_eq!(allocator.allocate_cid(), 3);
    }
}
