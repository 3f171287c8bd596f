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

//! Interception of bulk I/O entry points.
//!
//! A read or write whose buffer lives in the managed region cannot be handed
//! to the kernel whole: only part of the region is ever mapped. The wrappers
//! split such requests into chunks, prefaulting each chunk's pages first, and
//! adapt the chunk size to what the kernel demonstrably accepts.
//!
//! `open` is also intercepted so that programs sizing themselves from the
//! kernel's memory-information file see the managed region's capacity rather
//! than the node's.

use crate::{fatal, fault, sysinfo, threads};
use std::ffi::{CStr, c_char, c_int, c_void};

/// Consecutive outcomes needed before the search jumps.
const MAX_CONSECUTIVE: u32 = 3;

/// Binary search for the largest chunk the kernel accepts.
///
/// The initial upper bound of twice the local cache is a tunable estimate,
/// not a derived constant.
pub(crate) struct Chunker {
	os_page: usize,
	/// Lower bound known to succeed.
	successful: usize,
	/// Upper bound known to fail.
	unsuccessful: usize,
	/// Largest chunk that ever succeeded.
	max_successful: usize,
	consec_successes: u32,
	consec_failures: u32,
	last_chunk: usize,
}

impl Chunker {
	pub fn new(os_page: usize, cache_bytes: usize) -> Self {
		let successful = os_page;
		Self {
			os_page,
			successful,
			unsuccessful: (2 * cache_bytes).saturating_sub(successful).max(2 * os_page),
			max_successful: successful,
			consec_successes: 0,
			consec_failures: 0,
			last_chunk: 0,
		}
	}

	/// The next chunk size to try, at most `remaining`.
	///
	/// Returns `None` when even a single page cannot get through.
	pub fn next(&mut self, remaining: usize) -> Option<usize> {
		if self.consec_successes == MAX_CONSECUTIVE {
			self.successful = self.last_chunk;
			self.consec_successes = 0;
		} else if self.consec_failures == MAX_CONSECUTIVE {
			self.unsuccessful = self.last_chunk;
			self.consec_failures = 0;
			if self.unsuccessful <= self.os_page {
				return None;
			}
			if self.unsuccessful == self.successful {
				// What used to succeed now fails; restart the search and
				// hope for the best
				self.successful = self.os_page;
				self.unsuccessful = 2 * self.max_successful - self.successful;
			}
		}
		let chunk = ((self.successful + self.unsuccessful) / 2).min(remaining);
		self.last_chunk = chunk;
		Some(chunk)
	}

	/// Records the last chunk's outcome.
	pub fn record(&mut self, ok: bool) {
		if ok {
			self.consec_successes += 1;
			self.consec_failures = 0;
			self.max_successful = self.max_successful.max(self.last_chunk);
		} else {
			self.consec_failures += 1;
			self.consec_successes = 0;
		}
	}
}

/// Performs a bulk operation on `[base, base+total)` in adaptively sized
/// chunks, prefaulting each chunk before handing it to `op`.
///
/// Buffers fully or partially outside the managed region go through in one
/// call.
pub(crate) unsafe fn chunked_rw(
	base: *mut u8,
	total: usize,
	is_read: bool,
	op: &mut dyn FnMut(*mut u8, usize) -> libc::ssize_t,
) -> libc::ssize_t {
	let pass_through = match crate::try_jm() {
		None => true,
		Some(jm) => {
			let b = jm.region.base() as usize;
			(base as usize) < b || base as usize + total >= b + jm.region.extent()
		}
	};
	if pass_through {
		return op(base, total);
	}
	let jm = crate::jm();
	let mut chunker = Chunker::new(
		jm.region.os_page_size(),
		jm.region.local_pages() * jm.region.page_size(),
	);
	log::trace!(
		"{} {total} bytes of data one chunk at a time",
		if is_read { "reading" } else { "writing" }
	);
	let mut done = 0usize;
	while done < total {
		let Some(chunk) = chunker.next(total - done) else {
			break;
		};
		// Force the chunk into the local cache before the kernel sees it
		fault::touch_region(base.add(done), chunk);
		let n = op(base.add(done), chunk);
		if n < 1 {
			chunker.record(false);
			log::trace!("chunk of {chunk} bytes failed at offset {done}");
			continue;
		}
		chunker.record(true);
		done += n as usize;
	}
	done as libc::ssize_t
}

/// `read` wrapper.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: libc::size_t) -> libc::ssize_t {
	let real = crate::intercept::real()
		.read
		.unwrap_or_else(|| fatal!("read() was called but its next definition was not found"));
	chunked_rw(buf as *mut u8, count, true, &mut |p, n| unsafe {
		*libc::__errno_location() = 0;
		real(fd, p as *mut c_void, n)
	})
}

/// `write` wrapper.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: libc::size_t) -> libc::ssize_t {
	let real = crate::intercept::real()
		.write
		.unwrap_or_else(|| fatal!("write() was called but its next definition was not found"));
	chunked_rw(buf as *mut u8, count, false, &mut |p, n| unsafe {
		*libc::__errno_location() = 0;
		real(fd, p as *const c_void, n)
	})
}

/// `fread` wrapper.
pub unsafe fn fread(
	ptr: *mut c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	let real = crate::intercept::real()
		.fread
		.unwrap_or_else(|| fatal!("fread() was called but its next definition was not found"));
	if size == 0 {
		return 0;
	}
	let done = chunked_rw(ptr as *mut u8, size * nmemb, true, &mut |p, n| unsafe {
		libc::clearerr(stream);
		real(p as *mut c_void, 1, n, stream) as libc::ssize_t
	});
	done as libc::size_t / size
}

/// `fread_unlocked` wrapper.
pub unsafe fn fread_unlocked(
	ptr: *mut c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	let real = crate::intercept::real().fread_unlocked.unwrap_or_else(|| {
		fatal!("fread_unlocked() was called but its next definition was not found")
	});
	if size == 0 {
		return 0;
	}
	let done = chunked_rw(ptr as *mut u8, size * nmemb, true, &mut |p, n| unsafe {
		libc::clearerr(stream);
		real(p as *mut c_void, 1, n, stream) as libc::ssize_t
	});
	done as libc::size_t / size
}

/// `fwrite` wrapper.
pub unsafe fn fwrite(
	ptr: *const c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	let real = crate::intercept::real()
		.fwrite
		.unwrap_or_else(|| fatal!("fwrite() was called but its next definition was not found"));
	if size == 0 {
		return 0;
	}
	let done = chunked_rw(ptr as *mut u8, size * nmemb, false, &mut |p, n| unsafe {
		libc::clearerr(stream);
		real(p as *const c_void, 1, n, stream) as libc::ssize_t
	});
	done as libc::size_t / size
}

/// `fwrite_unlocked` wrapper.
pub unsafe fn fwrite_unlocked(
	ptr: *const c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	let real = crate::intercept::real().fwrite_unlocked.unwrap_or_else(|| {
		fatal!("fwrite_unlocked() was called but its next definition was not found")
	});
	if size == 0 {
		return 0;
	}
	let done = chunked_rw(ptr as *mut u8, size * nmemb, false, &mut |p, n| unsafe {
		libc::clearerr(stream);
		real(p as *const c_void, 1, n, stream) as libc::ssize_t
	});
	done as libc::size_t / size
}

/// Builds the synthesized memory-information content.
///
/// "Total" becomes the managed region's extent; "free" is the extent minus
/// what the node itself already considers used.
fn fake_meminfo(real_content: &str, extent: usize) -> String {
	let mut out = String::with_capacity(real_content.len());
	let values = sysinfo::parse_meminfo(real_content, &["MemTotal:", "MemFree:"]);
	let (total, free) = (values[0].unwrap_or(0), values[1].unwrap_or(0));
	for line in real_content.lines() {
		if line.starts_with("MemTotal:") {
			out.push_str(&format!("MemTotal:     {:8} kB\n", extent / 1024));
		} else if line.starts_with("MemFree:") {
			let used = total.saturating_sub(free);
			out.push_str(&format!(
				"MemFree:      {:8} kB\n",
				extent.saturating_sub(used) / 1024
			));
		} else {
			out.push_str(line);
			out.push('\n');
		}
	}
	out
}

/// `open` wrapper: external opens of the kernel memory-information file get a
/// synthesized replacement.
pub unsafe fn open(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.open
		.unwrap_or_else(|| fatal!("open() was called but its next definition was not found"));
	let is_meminfo = !pathname.is_null()
		&& CStr::from_ptr(pathname).to_bytes() == sysinfo::MEMINFO_FILE.as_bytes();
	if threads::internal_invocation() || !is_meminfo || crate::try_jm().is_none() {
		return real(pathname, flags, mode);
	}
	let jm = crate::jm();
	let Ok(content) = std::fs::read_to_string(sysinfo::MEMINFO_FILE) else {
		return -1;
	};
	let fake = fake_meminfo(&content, jm.region.extent());
	// Materialize it as an unlinked temporary file and hand back its
	// descriptor
	let file = libc::tmpfile();
	if file.is_null() {
		return -1;
	}
	let written = libc::fwrite(fake.as_ptr() as *const c_void, 1, fake.len(), file);
	if written != fake.len() || libc::fseek(file, 0, libc::SEEK_SET) == -1 {
		return -1;
	}
	libc::fileno(file)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunker_stays_bounded() {
		let cache = 1 << 20;
		let mut c = Chunker::new(4096, cache);
		// A fully successful run must never try more than twice the cache
		for _ in 0..1000 {
			let chunk = c.next(usize::MAX >> 1).unwrap();
			assert!(chunk < 2 * cache);
			c.record(true);
		}
	}

	#[test]
	fn chunker_grows_on_success() {
		let mut c = Chunker::new(4096, 1 << 20);
		let first = c.next(usize::MAX >> 1).unwrap();
		for _ in 0..10 {
			c.record(true);
			c.next(usize::MAX >> 1).unwrap();
		}
		c.record(true);
		let later = c.next(usize::MAX >> 1).unwrap();
		assert!(later > first);
	}

	#[test]
	fn chunker_shrinks_on_failure() {
		let mut c = Chunker::new(4096, 1 << 20);
		let first = c.next(usize::MAX >> 1).unwrap();
		for _ in 0..MAX_CONSECUTIVE {
			c.record(false);
			c.next(usize::MAX >> 1).unwrap();
		}
		c.record(false);
		let later = c.next(usize::MAX >> 1).unwrap();
		assert!(later < first);
	}

	#[test]
	fn chunker_gives_up_below_a_page() {
		let mut c = Chunker::new(4096, 8192);
		// Fail everything: the failing boundary collapses to a page and the
		// search aborts
		for _ in 0..100 {
			match c.next(usize::MAX >> 1) {
				Some(_) => c.record(false),
				None => return,
			}
		}
		panic!("chunker never gave up");
	}

	#[test]
	fn meminfo_synthesis() {
		let real = "MemTotal:       16316068 kB\n\
			MemFree:         8043940 kB\n\
			Shmem:             12345 kB\n";
		let extent = 64usize << 30;
		let fake = fake_meminfo(real, extent);
		let values = sysinfo::parse_meminfo(&fake, &["MemTotal:", "MemFree:", "Shmem:"]);
		assert_eq!(values[0], Some(extent / 1024 * 1024));
		let used = (16316068 - 8043940) * 1024;
		assert_eq!(values[1], Some((extent - used) / 1024 * 1024));
		assert_eq!(values[2], Some(12345 * 1024));
	}
}
