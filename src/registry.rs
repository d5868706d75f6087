//! The set of virtual machines a request can be resolved against.
//!
//! The translation core only ever asks two questions of the registry: "which VM belongs
//! to this pid" and "which VM was registered first". Everything else about how VMs come
//! and go is owned by whoever fills the registry.
use std::sync::{Arc, RwLock};

use log::debug;
use serde::Deserialize;

use crate::translate::{AddressSpace, PAGE_SHIFT};

/// A running virtual machine as seen by the translator
pub trait Vm: Send + Sync {
    /// pid of the userspace process (e.g. QEMU) that owns the VM
    fn owner_pid(&self) -> u64;

    /// Map a guest frame number to the host virtual address of the page backing it.
    /// Returns `None` if the frame is not backed by any memory slot.
    fn gfn_to_hva(&self, gfn: u64) -> Option<u64>;

    /// Address space in which the values returned by [`gfn_to_hva`](Self::gfn_to_hva) are valid
    fn address_space(&self) -> AddressSpace;
}

pub trait VmRegistry: Send + Sync {
    fn find_by_owner_id(&self, pid: u64) -> Option<Arc<dyn Vm>>;
    fn first(&self) -> Option<Arc<dyn Vm>>;
}

/// Contiguous range of guest physical memory backed by host virtual memory. Same layout
/// as the regions handed to `KVM_SET_USER_MEMORY_REGION`, expressed in frames.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlot {
    /// first guest frame covered by this slot
    pub base_gfn: u64,
    /// number of 4KiB frames in this slot
    pub npages: u64,
    /// host virtual address backing `base_gfn`
    pub userspace_addr: u64,
}

impl MemSlot {
    pub fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn - self.base_gfn < self.npages
    }

    /// Host virtual address for `gfn`. Caller must check [`contains`](Self::contains) first
    fn hva_of(&self, gfn: u64) -> Option<u64> {
        (gfn - self.base_gfn)
            .checked_mul(1 << PAGE_SHIFT)
            .and_then(|off| self.userspace_addr.checked_add(off))
    }
}

/// VM described by its owning pid and its memory slots
#[derive(Debug, Clone)]
pub struct GuestVm {
    pid: u64,
    memslots: Vec<MemSlot>,
}

impl GuestVm {
    pub fn new(pid: u64, memslots: Vec<MemSlot>) -> Self {
        GuestVm { pid, memslots }
    }
}

impl Vm for GuestVm {
    fn owner_pid(&self) -> u64 {
        self.pid
    }

    fn gfn_to_hva(&self, gfn: u64) -> Option<u64> {
        self.memslots
            .iter()
            .find(|slot| slot.contains(gfn))
            .and_then(|slot| slot.hva_of(gfn))
    }

    fn address_space(&self) -> AddressSpace {
        AddressSpace { pid: self.pid }
    }
}

/// Registry kept in memory. Registration order is the natural order used by
/// [`VmRegistry::first`].
#[derive(Default)]
pub struct MemoryRegistry {
    vms: RwLock<Vec<Arc<dyn Vm>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vm: Arc<dyn Vm>) {
        debug!("registering vm owned by pid {}", vm.owner_pid());
        self.vms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(vm);
    }

    /// Remove all VMs owned by `pid`. Returns true if at least one was removed.
    /// Requests already holding the VM keep using it until they finish.
    pub fn unregister(&self, pid: u64) -> bool {
        let mut vms = self.vms.write().unwrap_or_else(|e| e.into_inner());
        let before = vms.len();
        vms.retain(|vm| vm.owner_pid() != pid);
        debug!("unregistered {} vm(s) owned by pid {}", before - vms.len(), pid);
        before != vms.len()
    }

    pub fn len(&self) -> usize {
        self.vms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VmRegistry for MemoryRegistry {
    fn find_by_owner_id(&self, pid: u64) -> Option<Arc<dyn Vm>> {
        self.vms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|vm| vm.owner_pid() == pid)
            .cloned()
    }

    fn first(&self) -> Option<Arc<dyn Vm>> {
        self.vms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .cloned()
    }
}
