/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of JumboMem.
 *
 * JumboMem is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * JumboMem is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * JumboMem. If not, see <https://www.gnu.org/licenses/>.
 */

//! Allocator entry points and the arena split.
//!
//! The process has two arenas. The user arena hands out managed-region
//! memory, advancing a cursor through `[base, base+extent)` so that user data
//! pages to the peers. The internal arena serves the library itself from
//! memory guaranteed to lie outside the managed region, seeded by a static
//! block so that allocation works before anything else does.
//!
//! The routing key is whether the current call entered the library from
//! library code, not where a pointer happens to point.

use crate::{fatal, memory, sysinfo, threads};
use std::{
	cell::UnsafeCell,
	ffi::c_void,
	mem::size_of,
	ptr,
	sync::atomic::{
		AtomicBool,
		Ordering::{Acquire, Relaxed, Release},
	},
};

/// Block header size: total block length and block base, one word each.
const HDR: usize = 2 * size_of::<usize>();
/// Allocation granularity.
const ALIGN: usize = 16;
/// Minimum tail worth splitting off a free block.
const MIN_SPLIT: usize = 64;
/// Segment growth granularity for the internal arena.
const INTERNAL_SEGMENT: usize = 1 << 20;
/// Cursor growth granularity for the user arena.
const USER_SEGMENT: usize = 256 * 1024;
/// Bytes of statically allocated seed memory.
const SEED_SIZE: usize = 64 * 1024;

/// A node in an arena's free list, stored in the freed block itself.
struct FreeBlock {
	/// Total block length, header included.
	size: usize,
	next: *mut FreeBlock,
}

/// Where an arena's segments come from.
enum Source {
	/// The static seed, then mappings outside the managed region.
	Internal,
	/// The managed region's allocation cursor.
	Region,
}

/// A first-fit allocator over segments from one source.
struct Arena {
	/// Free list head.
	free: *mut FreeBlock,
	/// Current segment carve cursor and end.
	seg_cur: usize,
	seg_end: usize,
	source: Source,
}

impl Arena {
	const fn new(source: Source) -> Self {
		Self {
			free: ptr::null_mut(),
			seg_cur: 0,
			seg_end: 0,
			source,
		}
	}

	/// Obtains a fresh segment able to hold `total` bytes.
	///
	/// Returns `false` when the source is exhausted.
	fn new_segment(&mut self, total: usize) -> bool {
		match self.source {
			Source::Internal => {
				let len = total.max(INTERNAL_SEGMENT).div_ceil(ALIGN) * ALIGN;
				let jm = crate::try_jm();
				let seg = memory::alloc_outside_region(len, jm.map(|jm| &jm.region));
				self.seg_cur = seg as usize;
				self.seg_end = seg as usize + len;
				true
			}
			Source::Region => {
				let Some(jm) = crate::try_jm() else {
					return false;
				};
				let len = total.max(USER_SEGMENT).div_ceil(ALIGN) * ALIGN;
				let cur = jm.region.end_address.load(Acquire);
				let end = jm.region.base() as usize + jm.region.extent();
				if cur + len > end {
					// Retry with exactly what was asked before giving up
					if cur + total > end {
						log::debug!("failed to allocate {total} bytes of JumboMem memory");
						return false;
					}
					jm.region.end_address.store(cur + total, Release);
					self.seg_cur = cur;
					self.seg_end = cur + total;
					return true;
				}
				jm.region.end_address.store(cur + len, Release);
				log::debug!("allocated {len} bytes of JumboMem memory at address {cur:#x}");
				self.seg_cur = cur;
				self.seg_end = cur + len;
				true
			}
		}
	}

	/// Allocates `size` bytes, first-fit from the free list, else carved from
	/// the current segment.
	fn alloc(&mut self, size: usize) -> *mut u8 {
		let size = size.max(ALIGN).div_ceil(ALIGN) * ALIGN;
		let total = size + HDR;
		// First fit
		let mut link: *mut *mut FreeBlock = &mut self.free;
		unsafe {
			while !(*link).is_null() {
				let blk = *link;
				if (*blk).size >= total {
					*link = (*blk).next;
					let blk_size = (*blk).size;
					let base = blk as usize;
					if blk_size - total >= MIN_SPLIT {
						// Return the tail to the free list
						let tail = (base + total) as *mut FreeBlock;
						(*tail).size = blk_size - total;
						(*tail).next = self.free;
						self.free = tail;
						return self.finish(base, total);
					}
					return self.finish(base, blk_size);
				}
				link = &mut (*blk).next;
			}
		}
		// Carve from the segment
		if self.seg_end - self.seg_cur < total && !self.new_segment(total) {
			return ptr::null_mut();
		}
		let base = self.seg_cur;
		self.seg_cur += total;
		self.finish(base, total)
	}

	/// Writes the header for a block at `base` and returns its payload.
	fn finish(&mut self, base: usize, total: usize) -> *mut u8 {
		let payload = base + HDR;
		unsafe {
			((payload - 2 * size_of::<usize>()) as *mut usize).write(total);
			((payload - size_of::<usize>()) as *mut usize).write(base);
		}
		payload as *mut u8
	}

	/// Allocates `size` bytes aligned to `align` (a power of two).
	fn memalign(&mut self, align: usize, size: usize) -> *mut u8 {
		let align = align.max(ALIGN);
		let size = size.max(ALIGN).div_ceil(ALIGN) * ALIGN;
		let total = size + HDR + align;
		if self.seg_end - self.seg_cur < total && !self.new_segment(total) {
			return ptr::null_mut();
		}
		let base = self.seg_cur;
		self.seg_cur += total;
		let payload = (base + HDR).div_ceil(align) * align;
		unsafe {
			((payload - 2 * size_of::<usize>()) as *mut usize).write(total);
			((payload - size_of::<usize>()) as *mut usize).write(base);
		}
		payload as *mut u8
	}

	/// Returns a block to the free list.
	fn free(&mut self, payload: *mut u8) {
		let (total, base) = Self::block_of(payload);
		let blk = base as *mut FreeBlock;
		unsafe {
			(*blk).size = total;
			(*blk).next = self.free;
		}
		self.free = blk;
	}

	/// Grows or shrinks an allocation, copying as needed.
	fn realloc(&mut self, payload: *mut u8, new_size: usize) -> *mut u8 {
		let (total, base) = Self::block_of(payload);
		let capacity = base + total - payload as usize;
		if new_size <= capacity {
			return payload;
		}
		let new = self.alloc(new_size);
		if new.is_null() {
			return ptr::null_mut();
		}
		unsafe {
			ptr::copy_nonoverlapping(payload, new, capacity);
		}
		self.free(payload);
		new
	}

	/// Reads the header of the block owning `payload`.
	fn block_of(payload: *mut u8) -> (usize, usize) {
		unsafe {
			let total = ((payload as usize - 2 * size_of::<usize>()) as *const usize).read();
			let base = ((payload as usize - size_of::<usize>()) as *const usize).read();
			(total, base)
		}
	}
}

/// Statically allocated seed for the internal arena.
#[repr(align(16))]
struct Seed(UnsafeCell<[u8; SEED_SIZE]>);

unsafe impl Sync for Seed {}

static SEED: Seed = Seed(UnsafeCell::new([0; SEED_SIZE]));

/// An arena behind the mega-lock.
struct ArenaCell(UnsafeCell<Arena>);

unsafe impl Sync for ArenaCell {}

static INTERNAL_ARENA: ArenaCell = ArenaCell(UnsafeCell::new(Arena::new(Source::Internal)));
static USER_ARENA: ArenaCell = ArenaCell(UnsafeCell::new(Arena::new(Source::Region)));
static READY: AtomicBool = AtomicBool::new(false);

/// Whether the internal arena can serve allocations.
pub(crate) fn ready() -> bool {
	READY.load(Relaxed)
}

/// Seeds the internal arena. Idempotent.
pub(crate) fn initialize() {
	if READY.swap(true, Relaxed) {
		return;
	}
	let arena = unsafe { &mut *INTERNAL_ARENA.0.get() };
	arena.seg_cur = SEED.0.get() as usize;
	arena.seg_end = arena.seg_cur + SEED_SIZE;
	// Warm the path so later callers cannot hit a first-allocation surprise
	// at an awkward time
	let p = arena.alloc(16);
	arena.free(p);
}

/// Allocates library-internal memory without taking the mega-lock.
///
/// Needed to set up thread-local records, where taking the lock would
/// recurse. Returns null if the arena is not yet seeded.
pub(crate) fn internal_alloc_raw(size: usize) -> *mut u8 {
	if !ready() {
		return ptr::null_mut();
	}
	unsafe { (*INTERNAL_ARENA.0.get()).alloc(size) }
}

/// Counterpart of [`internal_alloc_raw`].
pub(crate) fn internal_free_raw(payload: *mut u8) {
	unsafe {
		(*INTERNAL_ARENA.0.get()).free(payload);
	}
}

/// Picks the arena for the current invocation.
///
/// # Safety
///
/// The mega-lock must be held.
unsafe fn current_arena() -> &'static mut Arena {
	if threads::internal_invocation() || crate::try_jm().is_none() {
		&mut *INTERNAL_ARENA.0.get()
	} else {
		&mut *USER_ARENA.0.get()
	}
}

/// Flags an exhausted allocation to the caller.
fn out_of_memory() -> *mut c_void {
	unsafe {
		*libc::__errno_location() = libc::ENOMEM;
	}
	ptr::null_mut()
}

/// Aborts if an internal allocation landed inside the managed region.
fn check_internal(p: *mut u8) {
	if p.is_null() || !threads::internal_invocation() {
		return;
	}
	if let Some(jm) = crate::try_jm() {
		if jm.region.contains(p as usize) {
			fatal!("internal error: internal buffer {p:p} is within the external range of memory");
		}
	}
}

/// `malloc` entry point.
pub unsafe fn malloc(size: libc::size_t) -> *mut c_void {
	let _guard = threads::critical();
	crate::ensure_initialized();
	log::trace!(
		"{} malloc({size})",
		if threads::internal_invocation() { "internal" } else { "external" }
	);
	let p = current_arena().alloc(size);
	if p.is_null() {
		return out_of_memory();
	}
	check_internal(p);
	p as *mut c_void
}

/// `calloc` entry point.
pub unsafe fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
	let Some(bytes) = nmemb.checked_mul(size) else {
		return out_of_memory();
	};
	let p = malloc(bytes);
	if !p.is_null() {
		ptr::write_bytes(p as *mut u8, 0, bytes);
	}
	p
}

/// `realloc` entry point.
pub unsafe fn realloc(old: *mut c_void, size: libc::size_t) -> *mut c_void {
	if old.is_null() {
		return malloc(size);
	}
	let _guard = threads::critical();
	crate::ensure_initialized();
	log::trace!(
		"{} realloc({old:p}, {size})",
		if threads::internal_invocation() { "internal" } else { "external" }
	);
	let p = current_arena().realloc(old as *mut u8, size);
	if p.is_null() {
		return out_of_memory();
	}
	check_internal(p);
	p as *mut c_void
}

/// `free` entry point.
pub unsafe fn free(p: *mut c_void) {
	if p.is_null() {
		return;
	}
	let _guard = threads::critical();
	crate::ensure_initialized();
	log::trace!(
		"{} free({p:p})",
		if threads::internal_invocation() { "internal" } else { "external" }
	);
	current_arena().free(p as *mut u8);
}

/// `memalign` entry point.
pub unsafe fn memalign(align: libc::size_t, size: libc::size_t) -> *mut c_void {
	if align == 0 || !align.is_power_of_two() {
		unsafe {
			*libc::__errno_location() = libc::EINVAL;
		}
		return ptr::null_mut();
	}
	let _guard = threads::critical();
	crate::ensure_initialized();
	let p = current_arena().memalign(align, size);
	if p.is_null() {
		return out_of_memory();
	}
	check_internal(p);
	p as *mut c_void
}

/// `valloc` entry point: page-aligned allocation.
pub unsafe fn valloc(size: libc::size_t) -> *mut c_void {
	memalign(sysinfo::os_page_size(), size)
}

/// `pvalloc` entry point: page-aligned allocation of a whole page multiple.
pub unsafe fn pvalloc(size: libc::size_t) -> *mut c_void {
	let page = sysinfo::os_page_size();
	memalign(page, size.div_ceil(page) * page)
}

/// Allocates a page-aligned internal buffer, aborting on failure.
pub(crate) fn internal_valloc(size: usize) -> *mut u8 {
	let page = sysinfo::os_page_size();
	let p = unsafe { (*INTERNAL_ARENA.0.get()).memalign(page, size) };
	if p.is_null() {
		fatal!("failed to allocate {size} bytes of memory");
	}
	p
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_arena() -> Arena {
		let seg = Box::leak(vec![0u8; 1 << 20].into_boxed_slice());
		let mut a = Arena::new(Source::Internal);
		a.seg_cur = seg.as_mut_ptr() as usize;
		// Keep 16-alignment regardless of what the allocator returned
		a.seg_cur = a.seg_cur.div_ceil(ALIGN) * ALIGN;
		a.seg_end = seg.as_mut_ptr() as usize + (1 << 20) - ALIGN;
		a
	}

	#[test]
	fn alloc_is_aligned_and_writable() {
		let mut a = test_arena();
		for size in [1, 7, 16, 100, 4096] {
			let p = a.alloc(size);
			assert!(!p.is_null());
			assert_eq!(p as usize % ALIGN, 0);
			unsafe {
				ptr::write_bytes(p, 0xA5, size);
			}
		}
	}

	#[test]
	fn free_list_reuse() {
		let mut a = test_arena();
		let p = a.alloc(128);
		a.free(p);
		let q = a.alloc(128);
		assert_eq!(p, q);
	}

	#[test]
	fn realloc_preserves_contents() {
		let mut a = test_arena();
		let p = a.alloc(32);
		unsafe {
			for i in 0..32 {
				p.add(i).write(i as u8);
			}
		}
		let q = a.realloc(p, 4096);
		assert!(!q.is_null());
		unsafe {
			for i in 0..32 {
				assert_eq!(q.add(i).read(), i as u8);
			}
		}
	}

	#[test]
	fn memalign_respects_alignment() {
		let mut a = test_arena();
		for align in [16, 64, 4096] {
			let p = a.memalign(align, 100);
			assert!(!p.is_null());
			assert_eq!(p as usize % align, 0);
			a.free(p);
		}
	}

	#[test]
	fn exhaustion_returns_null() {
		let seg = Box::leak(vec![0u8; 4096].into_boxed_slice());
		let mut a = Arena::new(Source::Region);
		a.seg_cur = (seg.as_mut_ptr() as usize).div_ceil(ALIGN) * ALIGN;
		a.seg_end = seg.as_mut_ptr() as usize + 4096;
		// Region-source arenas cannot grow without an initialized library
		assert!(!a.alloc(64).is_null());
		assert!(a.alloc(1 << 20).is_null());
	}
}
