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

//! Interception of memory-mapping entry points.

use crate::{fatal, fault, intercept, threads, util};
use std::ffi::{c_int, c_ulong, c_void};

/// `mmap` wrapper: keeps external mappings out of the managed region.
///
/// A fixed or hinted request, or any internal one, passes through. Otherwise
/// the mapping goes below the managed region by advancing the data segment
/// while room remains, then above it. A result inside the region is fatal.
pub unsafe fn mmap(
	start: *mut c_void,
	length: libc::size_t,
	prot: c_int,
	flags: c_int,
	fd: c_int,
	offset: libc::off_t,
) -> *mut c_void {
	let _guard = threads::critical();
	let jm = crate::try_jm();
	if !start.is_null() || threads::internal_invocation() || jm.is_none() {
		return intercept::real_mmap(start, length, prot, flags, fd, offset);
	}
	let jm = jm.unwrap();
	let base = jm.region.base() as usize;
	let extent = jm.region.extent();
	let os_page = jm.region.os_page_size();
	// Try to place the mapping below the managed region by growing the data
	// segment over the gap
	let data_end = (libc::sbrk(0) as usize).div_ceil(os_page) * os_page;
	if data_end + length < base && libc::brk((data_end + length) as *mut c_void) == 0 {
		let addr = intercept::real_mmap(
			data_end as *mut c_void,
			length,
			prot,
			flags | libc::MAP_FIXED,
			fd,
			offset,
		);
		let a = addr as usize;
		if addr != libc::MAP_FAILED && !(a >= base && a < base + extent) {
			return addr;
		}
		log::debug!("failed to mmap() memory at address {data_end:#x}; retrying elsewhere");
	}
	// Ask for an address just past the managed region
	let addr = intercept::real_mmap(
		(base + extent) as *mut c_void,
		length,
		prot,
		flags,
		fd,
		offset,
	);
	if addr == libc::MAP_FAILED {
		fatal!(
			"mmap() failed to allocate {length} bytes at or above address {:#x} ({})",
			base + extent,
			util::last_error()
		);
	}
	let a = addr as usize;
	if a >= base && a < base + extent {
		fatal!(
			"failed to prevent mmap() from allocating {length} bytes within [{base:#x}, {:#x}]",
			base + extent
		);
	}
	addr
}

/// `ioctl` wrapper: prefaults the page behind the argument pointer so the
/// kernel never observes an unmapped address.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.ioctl
		.unwrap_or_else(|| fatal!("ioctl() was called but its next definition was not found"));
	if let Some(jm) = crate::try_jm() {
		fault::touch_region(argp as *const u8, jm.region.page_size());
	}
	real(fd, request, argp)
}
