//! A small simulated machine for exercising the DMA layer.
//!
//! - RAM is sparse and zero-filled, in 64-byte lines.
//! - The CPU has a write-back data cache. Cached mappings (the linear map and
//!   cacheable remaps) go through it; non-cacheable remaps go straight to RAM.
//! - Devices read and write RAM directly and never see the cache.
//! - The bounce engine copies through the CPU, like a software bounce buffer.
//!
//! Every call the DMA layer makes into the platform is appended to an event
//! log, so tests can check what happened and in which order.

#![allow(dead_code)]

use kernel_dma::platform::{
    BounceEngine, CacheMaintenance, ContiguousAllocator, LinearMap, OffsetLinearMap,
    PageAllocator, Remapper, Zone,
};
use kernel_dma::{AllocFlags, CacheOp, Device, DmaAttrs, DmaDirection, PageProtection};
use kernel_memory_addresses::{
    DeviceAddress, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

pub const LINE: u64 = 64;
pub const PAGE: u64 = Size4K::SIZE;

pub const LINEAR_BASE: u64 = 0xFFFF_8000_0000_0000;
pub const REMAP_BASE: u64 = 0xFFFF_0000_0000_0000;

pub const CMA_BASE: u64 = 0x5000_0000;
pub const CMA_PAGES: u64 = 1024;
pub const PRIVATE_BASE: u64 = 0x5800_0000;
pub const DMA_ZONE_BASE: u64 = 0x6000_0000;
pub const NORMAL_ZONE_BASE: u64 = 0x1_0000_0000;
pub const BOUNCE_BASE: u64 = 0x7000_0000;
pub const BOUNCE_SIZE: u64 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Zero { va: VirtualAddress, size: u64 },
    Flush { start: VirtualAddress, end: VirtualAddress },
    Sync { va: VirtualAddress, size: u64, op: CacheOp },
    BounceMap { phys: PhysicalAddress, handle: DeviceAddress, bounced: bool },
    BounceUnmap { handle: DeviceAddress },
    BounceSyncCpu { handle: DeviceAddress },
    BounceSyncDevice { handle: DeviceAddress },
    BounceAlloc { va: VirtualAddress, handle: DeviceAddress, blocking: bool },
    BounceFree { va: VirtualAddress, handle: DeviceAddress },
    Reserve { private: bool, pfn: u64, count: u64 },
    ReleaseContiguous { pfn: u64, count: u64 },
    AllocPages { pfn: u64, order: u32, zone: Zone },
    FreePages { pfn: u64, order: u32 },
    Remap { va: VirtualAddress, pfn: u64, size: u64, prot: PageProtection },
    FreeRemap { va: VirtualAddress, size: u64 },
    RemapPfn { user_va: VirtualAddress, pfn: u64, len: u64, prot: PageProtection },
}

#[derive(Debug, Clone, Copy)]
struct CacheLine {
    data: [u8; LINE as usize],
    dirty: bool,
}

#[derive(Debug, Clone, Copy)]
struct Remapping {
    pa: u64,
    size: u64,
    prot: PageProtection,
    /// How many times the range was handed out without being freed.
    aliases: u32,
}

#[derive(Debug, Clone, Copy)]
struct BounceSlot {
    orig: u64,
    size: u64,
    dir: DmaDirection,
}

/// A bitmap-managed contiguous area.
#[derive(Debug, Clone)]
struct Area {
    base_pfn: u64,
    used: Vec<bool>,
}

impl Area {
    fn new(base: u64, pages: u64) -> Self {
        Self {
            base_pfn: base / PAGE,
            used: vec![false; pages as usize],
        }
    }

    fn reserve(&mut self, count: u64, align_order: u32) -> Option<u64> {
        let count = count as usize;
        let step = 1usize << align_order;
        let mut index = 0;
        while index + count <= self.used.len() {
            if self.used[index..index + count].iter().all(|u| !u) {
                self.used[index..index + count].fill(true);
                return Some(self.base_pfn + index as u64);
            }
            index += step;
        }
        None
    }

    fn release(&mut self, pfn: u64, count: u64) -> bool {
        if pfn < self.base_pfn {
            return false;
        }
        let start = (pfn - self.base_pfn) as usize;
        let end = start + count as usize;
        if end > self.used.len() || !self.used[start..end].iter().all(|u| *u) {
            return false;
        }
        self.used[start..end].fill(false);
        true
    }

    fn used_pages(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

/// Machine state. Tests flip the `fail_*` knobs through [`Machine::state`].
pub struct State {
    ram: BTreeMap<u64, [u8; LINE as usize]>,
    cache: BTreeMap<u64, CacheLine>,
    remaps: BTreeMap<u64, Remapping>,
    next_remap: u64,
    last_remap: Option<u64>,

    cma_global: Option<Area>,
    cma_private: HashMap<u32, Area>,
    dma_zone_next: u64,
    normal_zone_next: u64,
    page_blocks: BTreeMap<u64, u32>,

    bounce_next: u64,
    bounce_slots: BTreeMap<u64, BounceSlot>,
    bounce_allocs: BTreeMap<u64, u64>,

    /// Bounce every streaming mapping, even if the device could reach the buffer.
    pub force_bounce: bool,
    pub fail_remap: bool,
    /// Hand out the most recent remap address again.
    pub repeat_remap: bool,
    pub fail_contiguous: bool,
    pub fail_pages: bool,
    pub fail_bounce_alloc: bool,
    /// Number of streaming maps that still succeed; `None` means unlimited.
    pub maps_before_failure: Option<usize>,

    events: Vec<Event>,
}

impl State {
    fn translate(&self, va: u64) -> (u64, bool) {
        if va >= LINEAR_BASE {
            return (va - LINEAR_BASE, true);
        }
        let (start, remap) = self
            .remaps
            .range(..=va)
            .next_back()
            .filter(|(start, r)| va < **start + r.size)
            .unwrap_or_else(|| panic!("access to unmapped address {va:#x}"));
        (remap.pa + (va - start), remap.prot.memory_type().is_cached())
    }

    fn ram_line(&self, pa_line: u64) -> [u8; LINE as usize] {
        self.ram.get(&pa_line).copied().unwrap_or([0; LINE as usize])
    }

    fn cache_line(&mut self, pa_line: u64) -> &mut CacheLine {
        let fill = self.ram_line(pa_line);
        self.cache.entry(pa_line).or_insert(CacheLine {
            data: fill,
            dirty: false,
        })
    }

    fn cpu_write(&mut self, va: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let (pa, cached) = self.translate(va + i as u64);
            let line = pa & !(LINE - 1);
            let at = (pa - line) as usize;
            if cached {
                let entry = self.cache_line(line);
                entry.data[at] = *byte;
                entry.dirty = true;
            } else {
                self.ram.entry(line).or_insert([0; LINE as usize])[at] = *byte;
            }
        }
    }

    fn cpu_read(&mut self, va: u64, len: u64) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let (pa, cached) = self.translate(va + i);
                let line = pa & !(LINE - 1);
                let at = (pa - line) as usize;
                if cached {
                    self.cache_line(line).data[at]
                } else {
                    self.ram_line(line)[at]
                }
            })
            .collect()
    }

    fn prefetch(&mut self, va: u64, len: u64) {
        for line_va in lines(va, len) {
            let (pa, cached) = self.translate(line_va);
            if cached {
                self.cache_line(pa & !(LINE - 1));
            }
        }
    }

    fn cache_op(&mut self, va: u64, size: u64, op: CacheOp) {
        for line_va in lines(va, size) {
            let (pa, _) = self.translate(line_va);
            let line = pa & !(LINE - 1);
            let Some(entry) = self.cache.get(&line).copied() else {
                continue;
            };
            if entry.dirty && matches!(op, CacheOp::Clean | CacheOp::CleanInvalidate) {
                self.ram.insert(line, entry.data);
                if let Some(e) = self.cache.get_mut(&line) {
                    e.dirty = false;
                }
            }
            if matches!(op, CacheOp::Invalidate | CacheOp::CleanInvalidate) {
                self.cache.remove(&line);
            }
        }
    }

    fn device_write(&mut self, pa: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let addr = pa + i as u64;
            let line = addr & !(LINE - 1);
            self.ram.entry(line).or_insert([0; LINE as usize])[(addr - line) as usize] = *byte;
        }
    }

    fn device_read(&self, pa: u64, len: u64) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let addr = pa + i;
                let line = addr & !(LINE - 1);
                self.ram_line(line)[(addr - line) as usize]
            })
            .collect()
    }

    /// CPU copy between two physical ranges through the linear map.
    fn cpu_copy(&mut self, from: u64, to: u64, len: u64) {
        let data = self.cpu_read(LINEAR_BASE + from, len);
        self.cpu_write(LINEAR_BASE + to, &data);
    }

    fn bounce_bump(&mut self, size: u64) -> Option<u64> {
        let size = size.div_ceil(PAGE) * PAGE;
        if self.bounce_next + size > BOUNCE_BASE + BOUNCE_SIZE {
            return None;
        }
        let pa = self.bounce_next;
        self.bounce_next += size;
        Some(pa)
    }

    fn cma_area(&mut self, dev: Option<&Device>) -> Option<&mut Area> {
        if let Some(dev) = dev
            && self.cma_private.contains_key(&dev.id().0)
        {
            return self.cma_private.get_mut(&dev.id().0);
        }
        self.cma_global.as_mut()
    }
}

fn lines(va: u64, len: u64) -> impl Iterator<Item = u64> {
    let start = va & !(LINE - 1);
    let end = va + len;
    (start..end).step_by(LINE as usize)
}

/// The simulated machine. Implements every platform trait.
pub struct Machine {
    linear: OffsetLinearMap,
    state: Mutex<State>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A machine with a 4 MiB global contiguous reservation.
    pub fn new() -> Self {
        Self {
            linear: OffsetLinearMap::new(VirtualAddress::new(LINEAR_BASE)),
            state: Mutex::new(State {
                ram: BTreeMap::new(),
                cache: BTreeMap::new(),
                remaps: BTreeMap::new(),
                next_remap: REMAP_BASE,
                last_remap: None,
                cma_global: Some(Area::new(CMA_BASE, CMA_PAGES)),
                cma_private: HashMap::new(),
                dma_zone_next: DMA_ZONE_BASE,
                normal_zone_next: NORMAL_ZONE_BASE,
                page_blocks: BTreeMap::new(),
                bounce_next: BOUNCE_BASE,
                bounce_slots: BTreeMap::new(),
                bounce_allocs: BTreeMap::new(),
                force_bounce: false,
                fail_remap: false,
                repeat_remap: false,
                fail_contiguous: false,
                fail_pages: false,
                fail_bounce_alloc: false,
                maps_before_failure: None,
                events: Vec::new(),
            }),
        }
    }

    /// No contiguous reservation at all.
    pub fn without_contiguous(self) -> Self {
        self.state().cma_global = None;
        self
    }

    /// Give device `id` a private reservation of `pages` pages.
    pub fn with_private_area(self, id: u32, pages: u64) -> Self {
        let base = PRIVATE_BASE + u64::from(id) * (16 << 20);
        self.state().cma_private.insert(id, Area::new(base, pages));
        self
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Cache maintenance calls in the order they were made.
    pub fn cache_ops(&self) -> Vec<(VirtualAddress, u64, CacheOp)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sync { va, size, op } => Some((va, size, op)),
                _ => None,
            })
            .collect()
    }

    pub fn linear_va(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.linear.phys_to_virt(pa).unwrap()
    }

    pub fn cpu_write(&self, va: VirtualAddress, data: &[u8]) {
        self.state().cpu_write(va.as_u64(), data);
    }

    pub fn cpu_read(&self, va: VirtualAddress, len: u64) -> Vec<u8> {
        self.state().cpu_read(va.as_u64(), len)
    }

    /// Speculatively pull lines into the cache, as a CPU may at any time.
    pub fn prefetch(&self, va: VirtualAddress, len: u64) {
        self.state().prefetch(va.as_u64(), len);
    }

    pub fn device_write(&self, dev: &Device, handle: DeviceAddress, data: &[u8]) {
        let pa = dev.dma_to_phys(handle).unwrap();
        self.state().device_write(pa.as_u64(), data);
    }

    pub fn device_read(&self, dev: &Device, handle: DeviceAddress, len: u64) -> Vec<u8> {
        let pa = dev.dma_to_phys(handle).unwrap();
        self.state().device_read(pa.as_u64(), len)
    }

    /// RAM contents, bypassing the cache.
    pub fn ram(&self, pa: PhysicalAddress, len: u64) -> Vec<u8> {
        self.state().device_read(pa.as_u64(), len)
    }

    pub fn dirty_lines(&self) -> usize {
        self.state().cache.values().filter(|l| l.dirty).count()
    }

    pub fn live_remaps(&self) -> usize {
        self.state().remaps.len()
    }

    pub fn remap_protection(&self, va: VirtualAddress) -> Option<PageProtection> {
        self.state().remaps.get(&va.as_u64()).map(|r| r.prot)
    }

    pub fn contiguous_used(&self) -> usize {
        self.state().cma_global.as_ref().map_or(0, Area::used_pages)
    }

    pub fn private_used(&self, id: u32) -> usize {
        self.state().cma_private.get(&id).map_or(0, Area::used_pages)
    }

    pub fn live_page_blocks(&self) -> usize {
        self.state().page_blocks.len()
    }

    pub fn live_bounce_allocs(&self) -> usize {
        self.state().bounce_allocs.len()
    }

    pub fn live_bounce_slots(&self) -> usize {
        self.state().bounce_slots.len()
    }

    fn push(&self, event: Event) {
        self.state().events.push(event);
    }
}

impl CacheMaintenance for Machine {
    fn flush_range(&self, start: VirtualAddress, end: VirtualAddress) {
        let mut state = self.state();
        let size = end.checked_sub(start).unwrap();
        state.cache_op(start.as_u64(), size, CacheOp::CleanInvalidate);
        state.events.push(Event::Flush { start, end });
    }

    fn sync_area(&self, start: VirtualAddress, size: u64, op: CacheOp) {
        let mut state = self.state();
        state.cache_op(start.as_u64(), size, op);
        state.events.push(Event::Sync {
            va: start,
            size,
            op,
        });
    }
}

impl BounceEngine for Machine {
    fn map(
        &self,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        _attrs: DmaAttrs,
    ) -> DeviceAddress {
        let mut state = self.state();
        if let Some(left) = state.maps_before_failure.as_mut() {
            if *left == 0 {
                return DeviceAddress::INVALID;
            }
            *left -= 1;
        }

        let reachable = phys.as_u64() + size - 1 <= dev.dma_mask();
        let (target, bounced) = if state.force_bounce || !reachable {
            let Some(bounce) = state.bounce_bump(size) else {
                return DeviceAddress::INVALID;
            };
            state.bounce_slots.insert(
                bounce,
                BounceSlot {
                    orig: phys.as_u64(),
                    size,
                    dir,
                },
            );
            if dir.device_reads() {
                state.cpu_copy(phys.as_u64(), bounce, size);
            }
            (bounce, true)
        } else {
            (phys.as_u64(), false)
        };

        let Ok(handle) = dev.phys_to_dma(PhysicalAddress::new(target)) else {
            return DeviceAddress::INVALID;
        };
        state.events.push(Event::BounceMap {
            phys,
            handle,
            bounced,
        });
        handle
    }

    fn unmap(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        _size: u64,
        _dir: DmaDirection,
        attrs: DmaAttrs,
    ) {
        let mut state = self.state();
        let pa = dev.dma_to_phys(handle).unwrap().as_u64();
        if let Some(slot) = state.bounce_slots.remove(&pa)
            && slot.dir.device_writes()
            && !attrs.contains(DmaAttrs::SKIP_CPU_SYNC)
        {
            state.cpu_copy(pa, slot.orig, slot.size);
        }
        state.events.push(Event::BounceUnmap { handle });
    }

    fn sync_for_cpu(&self, dev: &Device, handle: DeviceAddress, _size: u64, _dir: DmaDirection) {
        let mut state = self.state();
        let pa = dev.dma_to_phys(handle).unwrap().as_u64();
        if let Some(slot) = state.bounce_slots.get(&pa).copied()
            && slot.dir.device_writes()
        {
            state.cpu_copy(pa, slot.orig, slot.size);
        }
        state.events.push(Event::BounceSyncCpu { handle });
    }

    fn sync_for_device(&self, dev: &Device, handle: DeviceAddress, _size: u64, _dir: DmaDirection) {
        let mut state = self.state();
        let pa = dev.dma_to_phys(handle).unwrap().as_u64();
        if let Some(slot) = state.bounce_slots.get(&pa).copied()
            && slot.dir.device_reads()
        {
            state.cpu_copy(slot.orig, pa, slot.size);
        }
        state.events.push(Event::BounceSyncDevice { handle });
    }

    fn alloc_coherent(
        &self,
        dev: &Device,
        size: u64,
        _zone: Zone,
        flags: AllocFlags,
    ) -> Option<(VirtualAddress, DeviceAddress)> {
        let mut state = self.state();
        if state.fail_bounce_alloc {
            return None;
        }
        let pa = state.bounce_bump(size)?;
        state.bounce_allocs.insert(pa, size);
        let va = VirtualAddress::new(LINEAR_BASE + pa);
        let handle = dev.phys_to_dma(PhysicalAddress::new(pa)).ok()?;
        state.events.push(Event::BounceAlloc {
            va,
            handle,
            blocking: flags.can_block(),
        });
        Some((va, handle))
    }

    fn free_coherent(&self, dev: &Device, _size: u64, cpu_addr: VirtualAddress, handle: DeviceAddress) {
        let mut state = self.state();
        let pa = dev.dma_to_phys(handle).unwrap().as_u64();
        assert!(state.bounce_allocs.remove(&pa).is_some(), "foreign bounce free");
        state.events.push(Event::BounceFree {
            va: cpu_addr,
            handle,
        });
    }

    fn dma_supported(&self, _dev: &Device, mask: u64) -> bool {
        mask >= BOUNCE_BASE + BOUNCE_SIZE - 1
    }
}

impl ContiguousAllocator for Machine {
    fn has_area(&self, dev: Option<&Device>) -> bool {
        self.state().cma_area(dev).is_some()
    }

    fn is_private(&self, dev: &Device) -> bool {
        self.state().cma_private.contains_key(&dev.id().0)
    }

    fn reserve_pages(
        &self,
        dev: Option<&Device>,
        count: u64,
        align_order: u32,
    ) -> Option<PhysicalPage<Size4K>> {
        let mut state = self.state();
        if state.fail_contiguous {
            return None;
        }
        let private = dev.is_some_and(|d| state.cma_private.contains_key(&d.id().0));
        let pfn = state.cma_area(dev)?.reserve(count, align_order)?;
        state.events.push(Event::Reserve {
            private,
            pfn,
            count,
        });
        Some(PhysicalPage::from_pfn(pfn))
    }

    fn release_pages(&self, dev: Option<&Device>, page: PhysicalPage<Size4K>, count: u64) -> bool {
        let mut state = self.state();
        let Some(area) = state.cma_area(dev) else {
            return false;
        };
        let released = area.release(page.pfn(), count);
        if released {
            state.events.push(Event::ReleaseContiguous {
                pfn: page.pfn(),
                count,
            });
        }
        released
    }
}

impl PageAllocator for Machine {
    fn alloc_pages(&self, order: u32, zone: Zone) -> Option<PhysicalPage<Size4K>> {
        let mut state = self.state();
        if state.fail_pages {
            return None;
        }
        let block = PAGE << order;
        let next = match zone {
            Zone::Dma => &mut state.dma_zone_next,
            Zone::Normal => &mut state.normal_zone_next,
        };
        let pa = next.next_multiple_of(block);
        *next = pa + block;
        let pfn = pa / PAGE;
        state.page_blocks.insert(pfn, order);
        state.events.push(Event::AllocPages { pfn, order, zone });
        Some(PhysicalPage::from_pfn(pfn))
    }

    fn free_pages(&self, page: PhysicalPage<Size4K>, order: u32) {
        let mut state = self.state();
        assert_eq!(
            state.page_blocks.remove(&page.pfn()),
            Some(order),
            "free of a block that was not allocated"
        );
        state.events.push(Event::FreePages {
            pfn: page.pfn(),
            order,
        });
    }
}

impl Remapper for Machine {
    fn remap(
        &self,
        page: PhysicalPage<Size4K>,
        size: u64,
        prot: PageProtection,
    ) -> Option<VirtualAddress> {
        let mut state = self.state();
        if state.fail_remap {
            return None;
        }
        let repeated = state
            .last_remap
            .filter(|_| state.repeat_remap)
            .and_then(|va| state.remaps.get_mut(&va).map(|r| (va, r)));
        if let Some((va, remap)) = repeated {
            remap.aliases += 1;
            let va = VirtualAddress::new(va);
            state.events.push(Event::Remap {
                va,
                pfn: page.pfn(),
                size,
                prot,
            });
            return Some(va);
        }
        let va = state.next_remap;
        state.last_remap = Some(va);
        // Leave a guard page between ranges.
        state.next_remap += size + PAGE;
        state.remaps.insert(
            va,
            Remapping {
                pa: page.base().as_u64(),
                size,
                prot,
                aliases: 1,
            },
        );
        let va = VirtualAddress::new(va);
        state.events.push(Event::Remap {
            va,
            pfn: page.pfn(),
            size,
            prot,
        });
        Some(va)
    }

    fn free_remap(&self, va: VirtualAddress, size: u64) {
        let mut state = self.state();
        let remap = state
            .remaps
            .get_mut(&va.as_u64())
            .filter(|r| r.size == size)
            .unwrap_or_else(|| panic!("free_remap of {va:?} does not match a live remap"));
        remap.aliases -= 1;
        if remap.aliases == 0 {
            state.remaps.remove(&va.as_u64());
        }
        state.events.push(Event::FreeRemap { va, size });
    }

    fn remap_pfn_range(
        &self,
        user_va: VirtualAddress,
        pfn: u64,
        len: u64,
        prot: PageProtection,
    ) -> bool {
        let mut state = self.state();
        if state.fail_remap {
            return false;
        }
        state.events.push(Event::RemapPfn {
            user_va,
            pfn,
            len,
            prot,
        });
        true
    }
}

impl LinearMap for Machine {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.linear.phys_to_virt(pa)
    }

    fn zero_range(&self, va: VirtualAddress, size: u64) {
        let mut state = self.state();
        state.cpu_write(va.as_u64(), &vec![0; size as usize]);
        state.events.push(Event::Zero { va, size });
    }
}
