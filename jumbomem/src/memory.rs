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

//! The managed region: a contiguous virtual address range whose contents are
//! paged to and from peers.
//!
//! Only one page of the range is actually reserved up front; logical pages
//! gain and lose anonymous backing as the fault handler brings them in and
//! evicts them. All mapping operations work at logical-page granularity.

use crate::{
	config::{BaseAddr, Config},
	fatal,
	transport::PageLocation,
	util,
};
use std::{io, sync::atomic::AtomicUsize};

/// The managed region.
pub struct Region {
	/// Base of the range.
	base: *mut u8,
	/// Total bytes in the range.
	extent: usize,
	/// Logical page size.
	page_size: usize,
	/// OS page size.
	os_page_size: usize,
	/// Number of peers the range is striped over.
	#[cfg_attr(feature = "block-dist", allow(dead_code))]
	num_peers: usize,
	/// Bytes managed by each peer.
	#[cfg_attr(not(feature = "block-dist"), allow(dead_code))]
	peer_bytes: usize,
	/// Number of logical pages the master may cache locally.
	local_pages: AtomicUsize,
	/// First byte past what the user allocator has handed out.
	pub end_address: AtomicUsize,
	/// Whether newly mapped pages are locked into RAM.
	mlock: bool,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
	/// Reserves an address range of `extent` bytes and returns the region.
	///
	/// Placement starts just past the end of the data segment, adjusted by
	/// `JM_BASEADDR`; if that spot is unavailable and the user did not pin an
	/// address, the kernel chooses one.
	pub fn new(config: &Config, extent: usize, num_peers: usize, peer_bytes: usize) -> io::Result<Self> {
		let page_size = config.page_size;
		// Just past the data segment, rounded up to a logical page
		let brk = unsafe { libc::sbrk(0) } as usize;
		let default_start = brk.div_ceil(page_size) * page_size;
		let (start, retries_allowed) = match config.base_addr {
			BaseAddr::Default => (default_start, true),
			BaseAddr::Absolute(addr) => (addr, false),
			BaseAddr::Delta(delta) => ((default_start as isize + delta) as usize, false),
		};
		// Reserve a single page to anchor the range; the rest of the extent
		// stays unmapped until pages fault in
		let base = unsafe {
			libc::mmap(
				start as *mut _,
				page_size,
				libc::PROT_NONE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
				-1,
				0,
			)
		};
		let base = if base != libc::MAP_FAILED {
			base as *mut u8
		} else if retries_allowed {
			log::debug!(
				"failed to map address space at {start:#x} ({}); trying elsewhere",
				util::last_error()
			);
			let base = unsafe {
				libc::mmap(
					std::ptr::null_mut(),
					page_size,
					libc::PROT_NONE,
					libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
					-1,
					0,
				)
			};
			if base == libc::MAP_FAILED {
				return Err(util::last_error());
			}
			base as *mut u8
		} else {
			return Err(util::last_error());
		};
		// Round up in case the kernel returned something unaligned to the
		// logical page size
		let base = ((base as usize).div_ceil(page_size) * page_size) as *mut u8;
		log::debug!("global address space = [{base:p}, {:#x}]", base as usize + extent);
		Ok(Self {
			base,
			extent,
			page_size,
			os_page_size: config.os_page_size,
			num_peers,
			peer_bytes,
			local_pages: AtomicUsize::new(0),
			end_address: AtomicUsize::new(base as usize),
			mlock: config.mlock,
		})
	}

	/// Base of the managed range.
	pub fn base(&self) -> *mut u8 {
		self.base
	}

	/// Total bytes in the managed range.
	pub fn extent(&self) -> usize {
		self.extent
	}

	/// The logical page size.
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	/// The OS page size.
	pub fn os_page_size(&self) -> usize {
		self.os_page_size
	}

	/// The local cache budget, in logical pages.
	pub fn local_pages(&self) -> usize {
		self.local_pages.load(std::sync::atomic::Ordering::Relaxed)
	}

	/// Sets the local cache budget.
	pub fn set_local_pages(&self, pages: usize) {
		self.local_pages.store(pages, std::sync::atomic::Ordering::Relaxed);
	}

	/// Whether `[addr, addr+len)` lies entirely inside the managed range.
	pub fn contains_range(&self, addr: usize, len: usize) -> bool {
		addr >= self.base as usize && addr + len <= self.base as usize + self.extent
	}

	/// Whether `addr` lies inside the managed range.
	pub fn contains(&self, addr: usize) -> bool {
		addr >= self.base as usize && addr < self.base as usize + self.extent
	}

	/// Rounds `addr` down to a logical page boundary.
	pub fn round_down(&self, addr: usize) -> usize {
		addr / self.page_size * self.page_size
	}

	/// The page number of the page containing `addr`.
	pub fn page_number(&self, addr: usize) -> u32 {
		((addr - self.base as usize) / self.page_size) as u32
	}

	/// The address of the given page.
	pub fn page_address(&self, pagenum: u32) -> *mut u8 {
		(self.base as usize + pagenum as usize * self.page_size) as *mut u8
	}

	/// The peer and peer-local offset storing the page at `addr`.
	#[cfg(not(feature = "block-dist"))]
	pub fn location(&self, addr: usize) -> PageLocation {
		// Round-robin: adjacent pages go to adjacent peers
		let pagenum = self.page_number(addr) as usize;
		PageLocation {
			peer: pagenum % self.num_peers,
			offset: pagenum / self.num_peers * self.page_size,
		}
	}

	/// The peer and peer-local offset storing the page at `addr`.
	#[cfg(feature = "block-dist")]
	pub fn location(&self, addr: usize) -> PageLocation {
		// Block: fill one peer's memory before using any of the next peer's
		let off = addr - self.base as usize;
		PageLocation {
			peer: off / self.peer_bytes,
			offset: off % self.peer_bytes,
		}
	}

	/// Assigns anonymous backing store to `[addr, addr+len)` with the given
	/// protection, locking it into RAM when configured. Failure is fatal.
	pub fn assign_backing_store(&self, addr: *mut u8, len: usize, prot: i32) {
		if let Err(e) = unsafe { util::mmap_fixed(addr, len, prot) } {
			fatal!("failed to assign backing store to {len} bytes of address space ({e})");
		}
		if self.mlock {
			if let Err(e) = unsafe { util::mlock(addr, len) } {
				log::trace!("mlock({addr:p}, {len}) failed ({e})");
			}
		}
	}

	/// Removes the backing store from `[addr, addr+len)`. Failure is fatal.
	///
	/// No explicit `munlock` is needed; unmapping implies it.
	pub fn remove_backing_store(&self, addr: *mut u8, len: usize) {
		if let Err(e) = unsafe { util::munmap(addr, len) } {
			fatal!("failed to remove backing store from {len} bytes of address space ({e})");
		}
	}
}

/// Maps `len` bytes of anonymous memory guaranteed to lie outside the managed
/// range, for library-internal use.
///
/// `region_end` hints the kernel past the managed range; the result is
/// checked, since handing library memory out of the managed range would let
/// the fault handler recurse into itself.
pub fn alloc_outside_region(len: usize, region: Option<&Region>) -> *mut u8 {
	let hint = region
		.map(|r| r.base as usize + r.extent)
		.unwrap_or(0) as *mut u8;
	let addr = match unsafe { util::mmap_hint(hint, len, libc::PROT_READ | libc::PROT_WRITE) } {
		Ok(addr) => addr,
		Err(e) => fatal!("failed to allocate {len} bytes of internal memory ({e})"),
	};
	if let Some(r) = region {
		if (addr as usize) < r.base as usize + r.extent && addr as usize + len > r.base as usize {
			fatal!("internal error: internal buffer {addr:p} is within the external range of memory");
		}
	}
	addr
}

#[cfg(test)]
mod tests {
	use super::*;

	fn region(page_size: usize, pages_per_peer: usize, peers: usize) -> Region {
		let peer_bytes = page_size * pages_per_peer;
		Region {
			base: (1 << 30) as *mut u8,
			extent: peer_bytes * peers,
			page_size,
			os_page_size: 4096,
			num_peers: peers,
			peer_bytes,
			local_pages: AtomicUsize::new(0),
			end_address: AtomicUsize::new(1 << 30),
			mlock: false,
		}
	}

	#[test]
	fn page_arithmetic() {
		let r = region(8192, 16, 4);
		let base = r.base as usize;
		assert_eq!(r.page_number(base), 0);
		assert_eq!(r.page_number(base + 8191), 0);
		assert_eq!(r.page_number(base + 8192), 1);
		assert_eq!(r.round_down(base + 10000), base + 8192);
		assert_eq!(r.page_address(3) as usize, base + 3 * 8192);
		assert!(r.contains(base));
		assert!(r.contains(base + r.extent() - 1));
		assert!(!r.contains(base + r.extent()));
	}

	#[cfg(not(feature = "block-dist"))]
	#[test]
	fn round_robin_striping() {
		let r = region(8192, 16, 4);
		let base = r.base as usize;
		// Adjacent pages land on adjacent peers
		for page in 0..8usize {
			let loc = r.location(base + page * 8192);
			assert_eq!(loc.peer, page % 4);
			assert_eq!(loc.offset, page / 4 * 8192);
		}
	}

	#[cfg(feature = "block-dist")]
	#[test]
	fn block_striping() {
		let r = region(8192, 16, 4);
		let base = r.base as usize;
		let loc = r.location(base);
		assert_eq!((loc.peer, loc.offset), (0, 0));
		let loc = r.location(base + 16 * 8192);
		assert_eq!((loc.peer, loc.offset), (1, 0));
	}
}
