//! Host side physical address resolution through procfs.
//!
//! [`LinuxPageMap`] translates virtual addresses of a single process through
//! `/proc/<pid>/pagemap`. [`PagemapResolver`] builds the [`PageResolver`] used by the
//! endpoint on top of it: it faults the target page in by reading one byte of it from the
//! VM process, looks up the backing frame and classifies it through `/proc/kpageflags`.
//! All of this requires root rights.
use std::{
    fs::File,
    io::IoSliceMut,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::warn;
use nix::{
    errno::Errno,
    sys::uio::{process_vm_readv, RemoteIoVec},
    unistd::Pid,
};

use crate::translate::{AddressSpace, PageResolver, PinError, PinnedPage, PAGE_SIZE};

pub trait VirtToPhysResolver {
    fn get_phys(&mut self, virt: u64) -> Result<u64>;
}

///LinuxPageMap uses /proc/<pid>/pagemap to translate virtual to physical addresses.
/// Requires root rights
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap::PageMap,
}

impl LinuxPageMap {
    /// Translate addresses of the calling process
    pub fn new() -> Result<LinuxPageMap> {
        Self::for_pid(std::process::id() as u64)
    }

    pub fn for_pid(pid: u64) -> Result<LinuxPageMap> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap::PageMap::new(pid)
                .with_context(|| format!("failed to open pagemap of pid {}", pid))?,
        };
        Ok(res)
    }

    /// Frame backing the page that contains `virt`. `None` if the page is not resident
    pub fn frame_of(&mut self, virt: u64) -> Result<Option<u64>> {
        let vaddr_start_page = virt & !(PAGE_SIZE - 1);
        let vaddr_end_page = vaddr_start_page + (PAGE_SIZE - 1);

        let memory_region = pagemap::MemoryRegion::from((vaddr_start_page, vaddr_end_page));
        let entry = self
            .pagemap_wrapper
            .pagemap_region(&memory_region)
            .context(format!(
                "failed to query pagemap for memory region {:?}",
                memory_region
            ))?;
        if entry.len() != 1 {
            bail!(
                "Got {} pagemap entries for virtual address 0x{:x}, expected exactly one",
                entry.len(),
                virt
            )
        }

        Ok(entry[0].pfn().ok())
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    fn get_phys(&mut self, virt: u64) -> Result<u64> {
        let pfn = self
            .frame_of(virt)?
            .with_context(|| format!("page of virtual address 0x{:x} is not present", virt))?;
        if pfn == 0 {
            bail!(
                "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt,
            )
        }

        Ok((pfn << 12) | (virt & (PAGE_SIZE - 1)))
    }
}

/// Flag bits of `/proc/kpageflags`, see Documentation/admin-guide/mm/pagemap.rst
const KPF_HUGE: u64 = 1 << 17;
const KPF_THP: u64 = 1 << 22;

struct ResidentPage {
    pfn: u64,
    kpageflags: u64,
}

impl PinnedPage for ResidentPage {
    fn pfn(&self) -> u64 {
        self.pfn
    }

    fn is_trans_huge(&self) -> bool {
        self.kpageflags & KPF_THP != 0
    }

    fn is_hugetlb(&self) -> bool {
        self.kpageflags & KPF_HUGE != 0
    }
}

/// [`PageResolver`] for VMs running as processes on this host.
///
/// A process cannot pin pages of another process, so the returned page is a snapshot of
/// the frame backing the address right after it was faulted in. Releasing it is a no-op.
pub struct PagemapResolver {
    kpageflags_path: PathBuf,
}

impl PagemapResolver {
    pub fn new() -> Self {
        Self::with_kpageflags("/proc/kpageflags")
    }

    pub fn with_kpageflags<P: AsRef<Path>>(path: P) -> Self {
        PagemapResolver {
            kpageflags_path: path.as_ref().to_path_buf(),
        }
    }

    /// Read one byte at `hva` from process `pid`, forcing the kernel to fault the page in
    fn fault_in(pid: u64, hva: u64) -> Result<usize, Errno> {
        let pid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        let mut byte = [0u8; 1];
        let mut local = [IoSliceMut::new(&mut byte)];
        let remote = [RemoteIoVec {
            base: hva as usize,
            len: 1,
        }];
        process_vm_readv(Pid::from_raw(pid), &mut local, &remote)
    }

    /// Flags of `pfn`. Unreadable flags are treated as a plain page
    fn kpageflags(&self, pfn: u64) -> u64 {
        let read = || -> std::io::Result<u64> {
            let file = File::open(&self.kpageflags_path)?;
            let mut buf = [0u8; 8];
            file.read_exact_at(&mut buf, pfn * 8)?;
            Ok(u64::from_ne_bytes(buf))
        };
        read().unwrap_or_else(|e| {
            warn!(
                "failed to read {:?} for pfn 0x{:x}, classifying as base page : {}",
                self.kpageflags_path, pfn, e
            );
            0
        })
    }
}

impl Default for PagemapResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PageResolver for PagemapResolver {
    fn pin_page(&self, space: AddressSpace, hva: u64) -> Result<Box<dyn PinnedPage>, PinError> {
        match Self::fault_in(space.pid, hva) {
            Ok(0) => return Err(PinError::NoPages),
            Ok(_) => (),
            Err(e) => {
                warn!("failed to fault in 0x{:x} of pid {} : {}", hva, space.pid, e);
                return Err(PinError::from_errno(e));
            }
        }

        let mut pagemap = LinuxPageMap::for_pid(space.pid).map_err(|e| {
            warn!("{:#}", e);
            PinError::from_errno(Errno::EFAULT)
        })?;
        let pfn = match pagemap.frame_of(hva) {
            Ok(Some(0)) => {
                warn!("pagemap of pid {} hides frame numbers. Are we root?", space.pid);
                return Err(PinError::from_errno(Errno::EPERM));
            }
            Ok(Some(pfn)) => pfn,
            //swapped out again between fault in and lookup
            Ok(None) => return Err(PinError::NoPages),
            Err(e) => {
                warn!("{:#}", e);
                return Err(PinError::from_errno(Errno::EFAULT));
            }
        };

        Ok(Box::new(ResidentPage {
            pfn,
            kpageflags: self.kpageflags(pfn),
        }))
    }
}
