//! A segment: a contiguous virtual range with uniform permissions, owning
//! one page table and (for code/data) describing the ELF-backed bytes that
//! populate it on first touch.
//!
//! Grounded on `segment.c`/`segment.h`. `load_page` is transcribed from
//! the byte-range table in the design: zero the destination frame, then
//! copy whichever sub-range of the ELF image (if any) covers this page.

use alloc::vec;

use platform::ram::Ram;
use platform::tlb::PAGE_SIZE;
use platform::vnode::Vnode;

use crate::coremap::Coremap;
use crate::error::{VmError, VmResult};
use crate::pagetable::{Entry, PageTable};
use crate::stats::{self, Stats};
use crate::swapfile::SwapStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
    Executable,
    Stack,
}

impl Permissions {
    pub fn is_writable(self) -> bool {
        matches!(self, Permissions::ReadWrite | Permissions::Stack)
    }
}

pub struct Segment {
    pub permissions: Permissions,
    seg_size_bytes: u32,
    file_offset: u32,
    base_vaddr: u32,
    num_pages: u32,
    seg_size_words: u32,
    page_table: Option<PageTable>,
}

impl Segment {
    pub const fn zeroed() -> Self {
        Segment {
            permissions: Permissions::ReadOnly,
            seg_size_bytes: 0,
            file_offset: 0,
            base_vaddr: 0,
            num_pages: 0,
            seg_size_words: 0,
            page_table: None,
        }
    }

    /// Records metadata for a code or data region. Requires read
    /// permission; `writable` wins over `executable` if both are set.
    pub fn define(
        &mut self,
        seg_size_bytes: u32,
        file_offset: u32,
        base_vaddr: u32,
        num_pages: u32,
        seg_size_words: u32,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> VmResult<()> {
        if !readable {
            return Err(VmError::BadArgument);
        }
        self.permissions = if writable {
            Permissions::ReadWrite
        } else if executable {
            Permissions::Executable
        } else {
            Permissions::ReadOnly
        };
        self.seg_size_bytes = seg_size_bytes;
        self.file_offset = file_offset;
        self.base_vaddr = base_vaddr;
        self.num_pages = num_pages;
        self.seg_size_words = seg_size_words;
        Ok(())
    }

    /// Defines an 18-page user stack and immediately creates its page table.
    pub fn define_stack(&mut self, base_vaddr: u32, num_pages: u32) -> VmResult<()> {
        self.permissions = Permissions::Stack;
        self.base_vaddr = base_vaddr;
        self.num_pages = num_pages;
        self.seg_size_bytes = 0;
        self.file_offset = 0;
        self.seg_size_words = num_pages * PAGE_SIZE;
        self.page_table = Some(PageTable::create(num_pages as usize, base_vaddr)?);
        Ok(())
    }

    /// Creates the page table for a non-stack segment, after `define`.
    pub fn prepare(&mut self) -> VmResult<()> {
        self.page_table = Some(PageTable::create(self.num_pages as usize, self.base_vaddr)?);
        Ok(())
    }

    pub fn base_vaddr(&self) -> u32 {
        self.base_vaddr
    }

    pub fn upper_bound(&self) -> u32 {
        self.base_vaddr + self.seg_size_words
    }

    pub fn contains(&self, vaddr: u32) -> bool {
        vaddr >= self.base_vaddr && vaddr < self.upper_bound()
    }

    pub fn page_table(&self) -> &PageTable {
        self.page_table.as_ref().expect("segment page table not prepared")
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        self.page_table.as_mut().expect("segment page table not prepared")
    }

    pub fn get_paddr(&self, vaddr: u32) -> Option<u32> {
        match self.page_table().get_entry(vaddr) {
            Entry::Resident(paddr) => Some(paddr),
            _ => None,
        }
    }

    pub fn add_pt_entry(&mut self, vaddr: u32, paddr: u32) {
        self.page_table_mut().add_entry(vaddr, paddr);
    }

    pub fn swap_out(&mut self, vaddr: u32, offset: u32) {
        self.page_table_mut().swap_out(vaddr, offset);
    }

    /// Reads the page back from swap into `paddr` and flips the entry resident.
    pub fn swap_in(&mut self, vaddr: u32, paddr: u32, swap: &SwapStore, stats: &Stats) {
        let offset = self.page_table().get_swap_offset(vaddr);
        swap.swap_in(paddr, offset, stats);
        self.page_table_mut().swap_in(vaddr, paddr);
    }

    /// Loads one page of this segment's ELF content into `paddr`, zeroing
    /// whatever the ELF image doesn't cover (BSS, or pages entirely past
    /// `seg_size_bytes`).
    pub fn load_page(&self, vaddr: u32, paddr: u32, vnode: &dyn Vnode, ram: &Ram, stats: &Stats) -> VmResult<()> {
        ram.phys_zero(paddr, PAGE_SIZE as usize);

        let seg_off_in_page = self.base_vaddr & (PAGE_SIZE - 1);
        let page_base = self.base_vaddr & !(PAGE_SIZE - 1);
        let index = (vaddr - page_base) / PAGE_SIZE;

        let (dest_offset, file_off, length) = if index == 0 {
            let length = self.seg_size_bytes.min(PAGE_SIZE - seg_off_in_page);
            (seg_off_in_page, self.file_offset, length)
        } else {
            let prev_pages_bytes = index * PAGE_SIZE - seg_off_in_page;
            let remaining = self.seg_size_bytes.saturating_sub(prev_pages_bytes);
            let length = remaining.min(PAGE_SIZE);
            (0, self.file_offset + prev_pages_bytes, length)
        };

        if length == 0 {
            stats.increment(stats::PAGE_FAULT_ZERO);
            return Ok(());
        }

        stats.increment(stats::PAGE_FAULT_DISK);
        stats.increment(stats::PAGE_FAULT_ELF);

        let mut buf = vec![0u8; length as usize];
        let read = vnode.read_at(file_off as u64, &mut buf).map_err(|_| VmError::ExecFormat)?;
        if read != length as usize {
            return Err(VmError::ExecFormat);
        }
        ram.phys_write(paddr + dest_offset, &buf);
        Ok(())
    }

    /// Deep-copies this segment: a fresh page table of the same geometry,
    /// with every resident page reallocated and byte-copied to a new frame
    /// and every swapped page duplicated into a new swap slot. No state is
    /// shared with the source, so destroying either copy independently is safe.
    pub fn copy(&self, coremap: &Coremap, swap: &SwapStore, ram: &Ram, stats: &Stats, new_owner: *mut crate::addrspace::AddressSpace) -> VmResult<Segment> {
        let mut dst = Segment {
            permissions: self.permissions,
            seg_size_bytes: self.seg_size_bytes,
            file_offset: self.file_offset,
            base_vaddr: self.base_vaddr,
            num_pages: self.num_pages,
            seg_size_words: self.seg_size_words,
            page_table: Some(PageTable::create(self.num_pages as usize, self.base_vaddr)?),
        };

        if let Some(src_pt) = &self.page_table {
            for (vaddr, entry) in src_pt.iter_resident_or_swapped() {
                match entry {
                    Entry::Resident(src_paddr) => {
                        let dst_paddr = coremap.alloc_user_page(vaddr, new_owner);
                        let mut buf = [0u8; PAGE_SIZE as usize];
                        ram.phys_read(src_paddr, &mut buf);
                        ram.phys_write(dst_paddr, &buf);
                        dst.add_pt_entry(vaddr, dst_paddr);
                    }
                    Entry::Swapped(src_offset) => {
                        let dst_offset = swap.copy_slot(src_offset, stats);
                        dst.swap_out_fresh(vaddr, dst_offset);
                    }
                    Entry::Empty => unreachable!("iterator only yields non-empty entries"),
                }
            }
        }

        Ok(dst)
    }

    /// Installs a swapped entry directly (used only by `copy`, which never
    /// passes through a resident intermediate state).
    fn swap_out_fresh(&mut self, vaddr: u32, offset: u32) {
        self.page_table_mut().install_swapped(vaddr, offset);
    }

    /// Releases every resident frame and swap slot, without destroying the
    /// page table structure itself (the caller drops it right after).
    pub fn clear_content(&mut self, coremap: &Coremap, swap: &SwapStore) {
        if let Some(pt) = &mut self.page_table {
            pt.clear_content(
                |paddr| coremap.free_user_page(paddr),
                |offset| swap.swap_free(offset),
            );
        }
    }
}
