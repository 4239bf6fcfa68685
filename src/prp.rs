//! PRP (Physical Region Page) construction.
//!
//! Converts a position in a request's scatter-gather array into PRP entry
//! 1, PRP entry 2, and, when more than two pages are involved, a PRP list
//! staged in the command slot's preallocated list page.
//!
//! NVMe requires every PRP entry after the first to be page-aligned, so a
//! request whose interior SG elements are not page-aligned cannot be
//! carried by one command: the builder stops at the offending element and
//! the caller submits the remainder as a child command resuming there.

use crate::cmd::Sqe;
use crate::hal::DmaEntry;
use crate::sg::{SgElem, SgPosition};

/// Outcome of one builder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrpOutcome {
    /// Bytes covered by this command
    pub covered: u64,
    /// Whether the whole remaining transfer was covered (no split needed)
    pub complete: bool,
    /// PRP list entries written (0 = PRP1-only or PRP1+PRP2 direct)
    pub list_entries: usize,
}

/// Fill `sqe`'s data pointer for the transfer starting at `pos`.
///
/// `remaining` is the byte count still owed to the base request. The slot's
/// PRP list page is `prp_page`; `max_list` bounds the number of list
/// entries (maxTransfer / page). Splits always happen at an SG element
/// boundary, so `pos.offset` is zero by invariant.
///
/// Returns the bytes covered; the caller advances the base accounting and,
/// if `complete` is false, resumes from the updated position with a fresh
/// slot.
pub fn build(
    page_shift: u32,
    max_list: usize,
    sg: &[SgElem],
    pos: SgPosition,
    remaining: u64,
    prp_page: &DmaEntry,
    sqe: &mut Sqe,
) -> PrpOutcome {
    let page = 1u64 << page_shift;
    let page_mask = page - 1;

    debug_assert_eq!(pos.offset, 0);
    debug_assert!(pos.elem < sg.len());
    debug_assert!(remaining > 0);

    let mut elem = pos.elem;
    let mut dma_addr = sg[elem].ioa;
    let mut dma_len = sg[elem].len as u64;
    let offset = dma_addr & page_mask;

    // PRP1 may be offset into a page; only the first entry is allowed to.
    sqe.prp1 = dma_addr;
    sqe.prp2 = 0;

    let first_len = dma_len.min(page - offset);
    let mut length = remaining as i64 - first_len as i64;
    let mut covered = first_len;
    dma_addr += first_len;
    dma_len -= first_len;

    if length <= 0 {
        // Single-PRP fast path
        return PrpOutcome {
            covered,
            complete: true,
            list_entries: 0,
        };
    }

    // Stage a PRP list; it may be demoted to a direct PRP2 below.
    sqe.prp2 = prp_page.ioa;
    let list = prp_page.as_ptr::<u64>();
    let mut entries = 0usize;

    // Walk the rest of the SG array. Stop at the end of the transfer, or
    // at the first address that is not page-aligned (the split point), or
    // when the list page is full.
    while length > 0 && (dma_addr & page_mask) == 0 && entries < max_list {
        if dma_len > 0 {
            unsafe { core::ptr::write_volatile(list.add(entries), dma_addr) };
            entries += 1;
            let chunk = dma_len.min(page);
            length -= chunk as i64;
            covered += chunk;
            dma_addr += chunk;
            dma_len -= chunk;
        } else {
            elem += 1;
            if elem >= sg.len() {
                break;
            }
            dma_addr = sg[elem].ioa;
            dma_len = sg[elem].len as u64;
        }
    }

    let complete = length <= 0;

    if entries == 0 {
        // The transfer ended inside the first page chunk after all; no
        // list is needed and PRP2 must not point at an empty list.
        sqe.prp2 = 0;
    } else if entries == 1 && complete {
        // Exactly two pages total: the single list entry moves into PRP2
        // directly. Not legal on a split, where a list pointer and a data
        // pointer mean different things to the controller.
        sqe.prp2 = unsafe { core::ptr::read_volatile(list) };
        return PrpOutcome {
            covered,
            complete,
            list_entries: 0,
        };
    }

    PrpOutcome {
        covered,
        complete,
        list_entries: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::DmaDirection;

    const PAGE_SHIFT: u32 = 12;
    const MAX_LIST: usize = 512;

    struct ListPage {
        buf: alloc::boxed::Box<[u64; 512]>,
    }

    impl ListPage {
        fn new() -> ListPage {
            ListPage {
                buf: alloc::boxed::Box::new([0; 512]),
            }
        }

        fn entry(&self) -> DmaEntry {
            DmaEntry {
                va: self.buf.as_ptr() as *mut u8,
                ioa: 0xABC0_0000,
                size: 4096,
                dir: DmaDirection::FromHost,
            }
        }
    }

    fn run(sg: &[SgElem], pos: SgPosition, remaining: u64) -> (Sqe, PrpOutcome, ListPage) {
        let page = ListPage::new();
        let mut sqe = Sqe::default();
        let outcome = build(
            PAGE_SHIFT,
            MAX_LIST,
            sg,
            pos,
            remaining,
            &page.entry(),
            &mut sqe,
        );
        (sqe, outcome, page)
    }

    #[test]
    fn test_single_page_fast_path() {
        // 4 KiB read, one aligned element
        let sg = [SgElem { ioa: 0x1_0000_1000, len: 4096 }];
        let (sqe, outcome, _page) = run(&sg, SgPosition::default(), 4096);
        assert_eq!(sqe.prp1, 0x1_0000_1000);
        assert_eq!(sqe.prp2, 0);
        assert_eq!(outcome, PrpOutcome { covered: 4096, complete: true, list_entries: 0 });
    }

    #[test]
    fn test_offset_first_prp_within_page() {
        // First PRP may be offset into its page; a 1 KiB transfer starting
        // mid-page stays single-PRP.
        let sg = [SgElem { ioa: 0x5400, len: 1024 }];
        let (sqe, outcome, _page) = run(&sg, SgPosition::default(), 1024);
        assert_eq!(sqe.prp1, 0x5400);
        assert_eq!(sqe.prp2, 0);
        assert!(outcome.complete);
        assert_eq!(outcome.covered, 1024);
    }

    #[test]
    fn test_two_pages_promote_to_prp2() {
        // 8 KiB across two aligned elements: list entry promoted to PRP2
        let sg = [
            SgElem { ioa: 0x10_1000, len: 4096 },
            SgElem { ioa: 0x10_2000, len: 4096 },
        ];
        let (sqe, outcome, _page) = run(&sg, SgPosition::default(), 8192);
        assert_eq!(sqe.prp1, 0x10_1000);
        assert_eq!(sqe.prp2, 0x10_2000);
        assert_eq!(outcome, PrpOutcome { covered: 8192, complete: true, list_entries: 0 });
    }

    #[test]
    fn test_four_pages_use_list() {
        // 16 KiB spanning four aligned pages: PRP1 + list of three
        let sg = [
            SgElem { ioa: 0x20_1000, len: 4096 },
            SgElem { ioa: 0x20_2000, len: 4096 },
            SgElem { ioa: 0x20_3000, len: 4096 },
            SgElem { ioa: 0x20_4000, len: 4096 },
        ];
        let (sqe, outcome, page) = run(&sg, SgPosition::default(), 16384);
        assert_eq!(sqe.prp1, 0x20_1000);
        assert_eq!(sqe.prp2, page.entry().ioa);
        assert_eq!(outcome, PrpOutcome { covered: 16384, complete: true, list_entries: 3 });
        assert_eq!(&page.buf[..3], &[0x20_2000, 0x20_3000, 0x20_4000]);
    }

    #[test]
    fn test_contiguous_long_element() {
        // One 16 KiB physically contiguous element also yields a list
        let sg = [SgElem { ioa: 0x30_0000, len: 16384 }];
        let (sqe, outcome, page) = run(&sg, SgPosition::default(), 16384);
        assert_eq!(sqe.prp1, 0x30_0000);
        assert_eq!(outcome.covered, 16384);
        assert!(outcome.complete);
        assert_eq!(outcome.list_entries, 3);
        assert_eq!(&page.buf[..3], &[0x30_1000, 0x30_2000, 0x30_3000]);
    }

    #[test]
    fn test_split_at_unaligned_interior_element() {
        // 8 KiB aligned + 4 KiB at a non-page-aligned address: the builder
        // covers the first 8 KiB and reports the split.
        let sg = [
            SgElem { ioa: 0x40_1000, len: 8192 },
            SgElem { ioa: 0x40_A800, len: 4096 },
            SgElem { ioa: 0x40_B000, len: 4096 },
        ];
        let (sqe, outcome, _page) = run(&sg, SgPosition::default(), 16384);
        assert_eq!(sqe.prp1, 0x40_1000);
        // Two pages covered; the one list entry is promoted only on
        // complete coverage, so the list pointer stays.
        assert_eq!(outcome.covered, 8192);
        assert!(!outcome.complete);

        // Second child starts at the misaligned element
        let (sqe2, outcome2, _page2) = run(&sg, SgPosition { elem: 1, offset: 0 }, 8192);
        assert_eq!(sqe2.prp1, 0x40_A800);
        // The misaligned element itself is fully covered (its tail page
        // chunk is the final, short PRP entry), then the walk stops at the
        // next element.
        assert_eq!(outcome2.covered, 4096);
        assert!(!outcome2.complete);

        // Third child covers the rest; the children sum to the request.
        let (sqe3, outcome3, _page3) = run(&sg, SgPosition { elem: 2, offset: 0 }, 4096);
        assert_eq!(sqe3.prp1, 0x40_B000);
        assert_eq!(outcome3.covered, 4096);
        assert!(outcome3.complete);
        assert_eq!(8192 + outcome2.covered + outcome3.covered, 16384);
    }

    #[test]
    fn test_no_promotion_when_split_pending() {
        // Stopping one entry into the list with data remaining must NOT
        // promote that entry into PRP2.
        let sg = [
            SgElem { ioa: 0x50_1000, len: 8192 },
            SgElem { ioa: 0x50_3800, len: 4096 },
        ];
        let page = ListPage::new();
        let mut sqe = Sqe::default();
        let outcome = build(
            PAGE_SHIFT,
            MAX_LIST,
            &sg,
            SgPosition::default(),
            12288,
            &page.entry(),
            &mut sqe,
        );
        assert_eq!(outcome.covered, 8192);
        assert!(!outcome.complete);
        assert_eq!(outcome.list_entries, 1);
        // PRP2 still points at the list page, not the promoted entry
        assert_eq!(sqe.prp2, page.entry().ioa);
        assert_eq!(page.buf[0], 0x50_2000);
    }

    #[test]
    fn test_element_ending_short_of_page_boundary_splits() {
        // An element that ends mid-page forces a split before the next
        // element even if that element is aligned.
        let sg = [
            SgElem { ioa: 0x60_1000, len: 4096 + 0x800 },
            SgElem { ioa: 0x60_4000, len: 4096 },
        ];
        let (_sqe, outcome, _page) = run(&sg, SgPosition::default(), 4096 + 0x800 + 4096);
        assert_eq!(outcome.covered, 4096 + 0x800);
        assert!(!outcome.complete);
    }

    #[test]
    fn test_list_capacity_bound() {
        // A transfer larger than max_list + 1 pages stops at the bound.
        let sg = [SgElem { ioa: 0x100_0000, len: 6 * 4096 }];
        let page = ListPage::new();
        let mut sqe = Sqe::default();
        let outcome = build(
            PAGE_SHIFT,
            4,
            &sg,
            SgPosition::default(),
            6 * 4096,
            &page.entry(),
            &mut sqe,
        );
        // PRP1 page + 4 list entries
        assert_eq!(outcome.covered, 5 * 4096);
        assert!(!outcome.complete);
        assert_eq!(outcome.list_entries, 4);
    }
}
