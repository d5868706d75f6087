//! Two stage translation of a guest physical address: guest frame -> host virtual
//! address through the VM's memory slots, then host virtual address -> host physical
//! address by pinning the backing page.
use log::debug;
use strum::{Display, EnumIter};
use thiserror::Error;

use crate::registry::Vm;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Handle to the host address space a VM's memory lives in, i.e. the one of its owning
/// process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpace {
    pub pid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum PageKind {
    #[strum(serialize = "base")]
    Base,
    /// transparent huge page
    #[strum(serialize = "thp")]
    Thp,
    /// explicitly reserved huge page
    #[strum(serialize = "hugetlb")]
    Hugetlb,
}

impl PageKind {
    /// THP detection wins over hugetlb detection
    pub fn of(page: &dyn PinnedPage) -> PageKind {
        if page.is_trans_huge() {
            PageKind::Thp
        } else if page.is_hugetlb() {
            PageKind::Hugetlb
        } else {
            PageKind::Base
        }
    }
}

/// A page held in place by a [`PageResolver`]. Dropping the value releases the pin.
pub trait PinnedPage: Send {
    /// host physical frame number of the page
    fn pfn(&self) -> u64;
    fn is_trans_huge(&self) -> bool;
    fn is_hugetlb(&self) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    #[error("no page was pinned")]
    NoPages,
    /// Negative, errno style failure code
    #[error("pinning failed with code {0}")]
    Failed(i64),
}

impl PinError {
    pub fn from_errno(errno: nix::errno::Errno) -> PinError {
        PinError::Failed(-(errno as i64))
    }

    /// Number reported to the client: `0` if nothing was pinned, the negative code otherwise
    pub fn code(&self) -> i64 {
        match self {
            PinError::NoPages => 0,
            PinError::Failed(code) => *code,
        }
    }
}

pub trait PageResolver: Send + Sync {
    /// Pin exactly one page, the one starting at the page aligned `hva` in `space`.
    /// This may block the calling thread while the page is faulted in.
    fn pin_page(&self, space: AddressSpace, hva: u64) -> Result<Box<dyn PinnedPage>, PinError>;
}

/// Successful translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// exact host physical address, including the in-page offset
    pub phys: u64,
    pub kind: PageKind,
    /// guest physical address from the request
    pub gpa: u64,
    /// host virtual address, including the in-page offset
    pub hva: u64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    #[error("gpa 0x{gpa:x} has no valid host virtual address")]
    InvalidHva { gpa: u64 },
    #[error(transparent)]
    Pin(#[from] PinError),
}

/// Translate `gpa` of `vm` into a host physical address.
pub fn translate(
    vm: &dyn Vm,
    resolver: &dyn PageResolver,
    gpa: u64,
) -> Result<Translation, TranslateError> {
    let gfn = gpa >> PAGE_SHIFT;
    let offset = gpa & PAGE_OFFSET_MASK;

    let hva = vm
        .gfn_to_hva(gfn)
        .ok_or(TranslateError::InvalidHva { gpa })?
        | offset;

    let page = resolver
        .pin_page(vm.address_space(), hva & !PAGE_OFFSET_MASK)
        .map_err(|e| {
            debug!("pinning hva 0x{:x} of pid {} failed: {}", hva, vm.owner_pid(), e);
            e
        })?;

    let phys = (page.pfn() << PAGE_SHIFT) | offset;
    let kind = PageKind::of(page.as_ref());
    drop(page);

    Ok(Translation {
        phys,
        kind,
        gpa,
        hva,
    })
}

#[cfg(test)]
pub(crate) mod fake {
    //! Resolver that serves pages from a table and counts outstanding pins
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicI64, Ordering},
            Arc,
        },
    };

    use super::{AddressSpace, PageKind, PageResolver, PinError, PinnedPage};

    struct FakePage {
        pfn: u64,
        trans_huge: bool,
        hugetlb: bool,
        outstanding: Arc<AtomicI64>,
    }

    impl PinnedPage for FakePage {
        fn pfn(&self) -> u64 {
            self.pfn
        }

        fn is_trans_huge(&self) -> bool {
            self.trans_huge
        }

        fn is_hugetlb(&self) -> bool {
            self.hugetlb
        }
    }

    impl Drop for FakePage {
        fn drop(&mut self) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct FakeResolver {
        /// keyed by (pid, page aligned hva)
        pages: HashMap<(u64, u64), Result<(u64, bool, bool), PinError>>,
        outstanding: Arc<AtomicI64>,
    }

    impl FakeResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_page(mut self, pid: u64, hva: u64, pfn: u64, kind: PageKind) -> Self {
            let flags = match kind {
                PageKind::Base => (false, false),
                PageKind::Thp => (true, false),
                PageKind::Hugetlb => (false, true),
            };
            self.pages.insert((pid, hva), Ok((pfn, flags.0, flags.1)));
            self
        }

        /// page that reports both huge page flags
        pub fn with_compound_page(mut self, pid: u64, hva: u64, pfn: u64) -> Self {
            self.pages.insert((pid, hva), Ok((pfn, true, true)));
            self
        }

        pub fn with_failure(mut self, pid: u64, hva: u64, err: PinError) -> Self {
            self.pages.insert((pid, hva), Err(err));
            self
        }

        /// pins taken but not yet released
        pub fn outstanding(&self) -> i64 {
            self.outstanding.load(Ordering::SeqCst)
        }
    }

    impl PageResolver for FakeResolver {
        fn pin_page(
            &self,
            space: AddressSpace,
            hva: u64,
        ) -> Result<Box<dyn PinnedPage>, PinError> {
            assert_eq!(hva & 0xfff, 0, "resolver called with unaligned hva");
            let (pfn, trans_huge, hugetlb) = self
                .pages
                .get(&(space.pid, hva))
                .copied()
                .unwrap_or(Err(PinError::NoPages))?;

            self.outstanding.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                pfn,
                trans_huge,
                hugetlb,
                outstanding: self.outstanding.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use nix::errno::Errno;
    use strum::IntoEnumIterator;

    use super::fake::FakeResolver;
    use super::*;
    use crate::registry::{GuestVm, MemSlot};

    const PID: u64 = 100;
    const SLOT_HVA: u64 = 0x7f12_3400_0000;

    fn vm() -> GuestVm {
        GuestVm::new(
            PID,
            vec![MemSlot {
                base_gfn: 0,
                npages: 0x100,
                userspace_addr: SLOT_HVA,
            }],
        )
    }

    #[test]
    fn applies_offset_to_hva_and_phys() -> Result<()> {
        let resolver = FakeResolver::new().with_page(PID, SLOT_HVA + 0x1000, 0xabcde, PageKind::Base);

        let t = translate(&vm(), &resolver, 0x1234)?;
        assert_eq!(
            t,
            Translation {
                phys: 0xabcde234,
                kind: PageKind::Base,
                gpa: 0x1234,
                hva: SLOT_HVA + 0x1234,
            }
        );
        assert_eq!(resolver.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn classifies_pages() -> Result<()> {
        for kind in PageKind::iter() {
            let resolver = FakeResolver::new().with_page(PID, SLOT_HVA, 0x42, kind);
            assert_eq!(translate(&vm(), &resolver, 0x10)?.kind, kind);
        }

        let resolver = FakeResolver::new().with_compound_page(PID, SLOT_HVA, 0x42);
        assert_eq!(translate(&vm(), &resolver, 0)?.kind, PageKind::Thp);
        Ok(())
    }

    #[test]
    fn unmapped_gfn_never_reaches_resolver() {
        let resolver = FakeResolver::new();
        assert_eq!(
            translate(&vm(), &resolver, 0x100_123),
            Err(TranslateError::InvalidHva { gpa: 0x100_123 })
        );
        assert_eq!(resolver.outstanding(), 0);
    }

    #[test]
    fn pin_failures_are_distinct() {
        let resolver = FakeResolver::new()
            .with_failure(PID, SLOT_HVA + 0x2000, PinError::from_errno(Errno::EFAULT));

        let zero = translate(&vm(), &resolver, 0x1000).unwrap_err();
        assert_eq!(zero, TranslateError::Pin(PinError::NoPages));

        let hard = translate(&vm(), &resolver, 0x2000).unwrap_err();
        assert_eq!(hard, TranslateError::Pin(PinError::Failed(-14)));
        assert_eq!(resolver.outstanding(), 0);
    }

    #[test]
    fn pin_error_codes() {
        assert_eq!(PinError::NoPages.code(), 0);
        assert_eq!(PinError::from_errno(Errno::ENOMEM).code(), -12);
    }

    #[test]
    fn page_kind_names() {
        let names: Vec<String> = PageKind::iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["base", "thp", "hugetlb"]);
    }
}
