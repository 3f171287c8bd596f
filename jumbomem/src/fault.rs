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

//! The page-fault handler: converts segmentation faults inside the managed
//! region into remote paging operations.

use crate::{
	Jm, MutState,
	config::Prefetch,
	fatal, intercept,
	policy::Residence,
	threads, util,
};
use std::{mem, ptr};

/// A pending split-phase operation on one page.
pub(crate) struct PendingIo {
	/// Address the operation refers to; null when nothing is pending.
	pub addr: *mut u8,
	/// Transport handle of the operation in flight.
	pub handle: Option<crate::transport::Handle>,
	/// Page-sized staging buffer, when transfers cannot use the managed
	/// region directly.
	pub buffer: *mut u8,
	/// Final protection flags for a fetch; clean flag for an eviction.
	pub extra: i32,
}

impl PendingIo {
	pub const fn idle() -> Self {
		Self {
			addr: ptr::null_mut(),
			handle: None,
			buffer: ptr::null_mut(),
			extra: 0,
		}
	}
}

/// The kernel dispositions seen before ours was installed, two deep, so the
/// caller's handler can be re-exposed and restored.
pub(crate) struct SignalShadow {
	pub prev: libc::sigaction,
	pub prev_prev: libc::sigaction,
}

/// Starts fetching the page at `addr` into place.
fn fetch_begin(jm: &Jm, st: &mut MutState, addr: *mut u8, prot: i32) {
	st.fetch.addr = addr;
	st.fetch.extra = prot;
	let buf = if jm.config.extra_memcpy {
		st.fetch.buffer
	} else {
		addr
	};
	let loc = jm.region.location(addr as usize);
	st.fetch.handle = Some(unsafe { jm.transport.fetch_begin(loc, buf, jm.region.page_size()) });
}

/// Waits for the pending fetch and installs the page's final protection.
fn fetch_end(jm: &Jm, st: &mut MutState) {
	let Some(handle) = st.fetch.handle.take() else {
		fatal!("internal error: completing a page fetch that never began");
	};
	unsafe {
		jm.transport.fetch_end(handle);
	}
	let page_size = jm.region.page_size();
	if jm.config.extra_memcpy {
		unsafe {
			ptr::copy_nonoverlapping(st.fetch.buffer, st.fetch.addr, page_size);
		}
	}
	if st.fetch.extra != (libc::PROT_READ | libc::PROT_WRITE) {
		log::debug!(
			"changing the permissions of page {:p} to {:#x}",
			st.fetch.addr,
			st.fetch.extra
		);
		if let Err(e) = unsafe { util::mprotect(st.fetch.addr, page_size, st.fetch.extra) } {
			fatal!("failed to set access permissions on page {:p} ({e})", st.fetch.addr);
		}
	}
	st.fetch.addr = ptr::null_mut();
	st.stats.pages_received += 1;
}

/// Starts evicting the page at `addr`.
///
/// A clean page needs no transfer; its mapping is simply dropped. With
/// asynchronous eviction, write access is revoked while the transfer is in
/// flight so that stray stores fault rather than silently vanish.
fn evict_begin(jm: &Jm, st: &mut MutState, addr: *mut u8, clean: bool) {
	st.evict.addr = addr;
	st.evict.extra = clean as i32;
	let page_size = jm.region.page_size();
	if !clean {
		let loc = jm.region.location(addr as usize);
		let handle = if jm.config.extra_memcpy {
			unsafe {
				ptr::copy_nonoverlapping(addr, st.evict.buffer, page_size);
				jm.transport.evict_begin(loc, st.evict.buffer, page_size)
			}
		} else {
			unsafe { jm.transport.evict_begin(loc, addr, page_size) }
		};
		st.evict.handle = Some(handle);
	}
	if jm.config.async_evict {
		if let Err(e) = unsafe { util::mprotect(addr, page_size, libc::PROT_READ) } {
			fatal!("failed to revoke write access to page {addr:p} ({e})");
		}
	} else {
		evict_end(jm, st);
	}
}

/// Waits for the pending eviction and releases the victim's backing store.
fn evict_end(jm: &Jm, st: &mut MutState) {
	if st.evict.extra == 0 {
		let Some(handle) = st.evict.handle.take() else {
			fatal!("internal error: completing a page eviction that never began");
		};
		unsafe {
			jm.transport.evict_end(handle);
		}
		st.stats.pages_sent += 1;
	} else {
		st.stats.clean_evictions += 1;
	}
	jm.region.remove_backing_store(st.evict.addr, jm.region.page_size());
	st.evict.addr = ptr::null_mut();
}

/// Waits for the pending prefetch to land in its buffer.
fn prefetch_end(jm: &Jm, st: &mut MutState) {
	let Some(handle) = st.prefetch.handle.take() else {
		fatal!("internal error: completing a prefetch that never began");
	};
	unsafe {
		jm.transport.fetch_end(handle);
	}
	st.stats.pages_received += 1;
}

/// Picks and launches the next prefetch candidate.
fn start_prefetch(jm: &Jm, st: &mut MutState, rounded: *mut u8) {
	let page_size = jm.region.page_size();
	let candidate = match st.effective_prefetch {
		Prefetch::Next => (rounded as usize).wrapping_add(page_size),
		Prefetch::Delta => {
			let prev = st.prefetch_prev;
			let c = (rounded as usize).wrapping_add((rounded as usize).wrapping_sub(prev));
			st.prefetch_prev = rounded as usize;
			c
		}
		Prefetch::None => fatal!("internal error: prefetch started with prefetching disabled"),
	};
	// Cancel if the candidate is out of range or already resident
	let resident = jm.region.contains(candidate)
		&& matches!(
			st.policy.residence(jm.region.page_number(candidate), false),
			Residence::Resident(_)
		);
	if !jm.region.contains(candidate) || resident {
		st.prefetch.addr = ptr::null_mut();
		return;
	}
	st.prefetch.addr = candidate as *mut u8;
	let loc = jm.region.location(candidate);
	st.prefetch.handle =
		Some(unsafe { jm.transport.fetch_begin(loc, st.prefetch.buffer, page_size) });
}

/// Completes a pending prefetch and brings the faulted page in, overlapping
/// the eviction with whichever transfer is still needed.
fn complete_prefetch(
	jm: &Jm,
	st: &mut MutState,
	rounded: *mut u8,
	prot: i32,
	victim: Option<*mut u8>,
	clean: bool,
) {
	let page_size = jm.region.page_size();
	if !st.prefetch.addr.is_null() {
		// Something was prefetched; was it the page we want?
		prefetch_end(jm, st);
		if st.prefetch.addr == rounded {
			if let Some(victim) = victim {
				evict_begin(jm, st, victim, clean);
			}
			unsafe {
				ptr::copy_nonoverlapping(st.prefetch.buffer, rounded, page_size);
			}
			st.stats.good_prefetches += 1;
			if prot != (libc::PROT_READ | libc::PROT_WRITE) {
				log::debug!("changing the permissions of prefetched page {rounded:p} to {prot:#x}");
				if let Err(e) = unsafe { util::mprotect(rounded, page_size, prot) } {
					fatal!("failed to set access permissions on page {rounded:p} ({e})");
				}
			}
		} else {
			// Wrong page: discard it and fetch the right one
			fetch_begin(jm, st, rounded, prot);
			if let Some(victim) = victim {
				evict_begin(jm, st, victim, clean);
			}
			fetch_end(jm, st);
			st.stats.bad_prefetches += 1;
		}
	} else {
		fetch_begin(jm, st, rounded, prot);
		if let Some(victim) = victim {
			evict_begin(jm, st, victim, clean);
		}
		fetch_end(jm, st);
	}
}

/// Completes whatever operations are still in flight. Used at teardown.
pub(crate) fn drain_pending(jm: &Jm, st: &mut MutState) {
	if st.effective_prefetch != Prefetch::None && !st.prefetch.addr.is_null() {
		prefetch_end(jm, st);
		st.prefetch.addr = ptr::null_mut();
	}
	if !st.evict.addr.is_null() {
		evict_end(jm, st);
	}
	if !st.fetch.addr.is_null() {
		fetch_end(jm, st);
	}
}

/// The fault-class signal handler.
///
/// Converts faults inside the managed region into page replacements. Faults
/// outside the region reinstall the previously observed disposition and
/// return, so the access replays under the default delivery path.
pub(crate) extern "C" fn segv_handler(
	signum: libc::c_int,
	info: *mut libc::siginfo_t,
	_context: *mut libc::c_void,
) {
	// Only one thread services faults; everyone else parks here
	let _guard = threads::critical();
	if threads::must_exit_handler_now() {
		return;
	}
	let Some(jm) = crate::try_jm() else {
		return;
	};
	let st = unsafe { jm.state_mut() };
	let fault_addr = unsafe { (*info).si_addr() } as usize;
	let page_size = jm.region.page_size();
	let rounded = jm.region.round_down(fault_addr) as *mut u8;
	if !jm.region.contains(rounded as usize) {
		// A real segmentation fault: step aside and let the previous
		// disposition take effect when the access replays
		log::debug!("unknown address {fault_addr:#x} faulted");
		restore_previous_handler(st, signum);
		return;
	}
	if st.fault_address != 0 {
		fatal!(
			"faulted on address {fault_addr:#x} while processing the fault on address {:#x}",
			st.fault_address
		);
	}
	st.fault_address = fault_addr;
	log::debug!("address {fault_addr:#x} faulted");
	// No other user thread may observe the page while its data is in flight
	threads::freeze_other_threads(jm.config.freeze_timeout_ms, jm.config.freeze_fatal);
	let pagenum = jm.region.page_number(rounded as usize);
	if let Residence::Resident(prot) = st.policy.residence(pagenum, true) {
		// Minor fault: the page only needs its permissions widened
		if let Err(e) = unsafe { util::mprotect(rounded, page_size, prot) } {
			fatal!("failed to set the protection flags for the page at address {rounded:p} ({e})");
		}
		st.stats.minor_faults += 1;
		st.fault_address = 0;
		return;
	}
	st.stats.major_faults += 1;
	let start_us = util::current_time_us();
	// Wait for the previous eviction (if any) to complete
	if !st.evict.addr.is_null() {
		evict_end(jm, st);
	}
	let rep = st.policy.find_replacement(pagenum);
	let victim = rep.victim.map(|v| jm.region.page_address(v));
	jm.region
		.assign_backing_store(rounded, page_size, libc::PROT_READ | libc::PROT_WRITE);
	if st.effective_prefetch != Prefetch::None {
		complete_prefetch(jm, st, rounded, rep.new_prot, victim, rep.clean);
		start_prefetch(jm, st, rounded);
	} else {
		fetch_begin(jm, st, rounded, rep.new_prot);
		if let Some(victim) = victim {
			evict_begin(jm, st, victim, rep.clean);
		}
		fetch_end(jm, st);
	}
	let stop_us = util::current_time_us();
	st.stats.record_fault_time(stop_us.saturating_sub(start_us));
	st.stats.maybe_heartbeat(stop_us);
	st.stats.record_delta(pagenum as i64);
	st.fault_address = 0;
}

/// Installs the fault handler, remembering the previous disposition.
pub(crate) fn install_handler(st: &mut MutState) {
	let mut act: libc::sigaction = unsafe { mem::zeroed() };
	let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
		segv_handler;
	act.sa_sigaction = handler as usize;
	unsafe {
		libc::sigemptyset(&mut act.sa_mask);
	}
	act.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_NODEFER;
	let mut prev: libc::sigaction = unsafe { mem::zeroed() };
	if unsafe { intercept::real_sigaction(libc::SIGSEGV, &act, &mut prev) } == -1 {
		fatal!("failed to install a SIGSEGV handler ({})", util::last_error());
	}
	st.shadow.prev = prev;
	st.shadow.prev_prev = prev;
}

/// Reinstalls the previously observed disposition for the fault signal.
pub(crate) fn restore_previous_handler(st: &MutState, signum: libc::c_int) {
	if unsafe { intercept::real_sigaction(signum, &st.shadow.prev, ptr::null_mut()) } == -1 {
		fatal!("failed to restore the SIGSEGV handler ({})", util::last_error());
	}
}

/// Touches a range of addresses to fault them into the local cache.
///
/// Walks the range in reverse so that its beginning is the most likely part
/// to stay resident, repeating passes until a pass observes no misses (or a
/// bounded number of passes when the policy cannot say). Must not be called
/// from inside the fault handler.
pub fn touch_region(addr: *const u8, len: usize) {
	let Some(jm) = crate::try_jm() else {
		return;
	};
	let base = jm.region.base() as usize;
	let extent = jm.region.extent();
	let addr = addr as usize;
	// Any part out of the managed region means the kernel can already see it
	if addr < base || addr + len >= base + extent {
		return;
	}
	let page_size = jm.region.page_size();
	// No point touching more than can be cached locally
	let len = len.min(jm.region.local_pages() * page_size);
	let start = jm.region.round_down(addr);
	let _guard = threads::critical();
	// Short-lived state borrows: every touch below may re-enter the fault
	// handler, which takes its own borrow
	let residence = |p: usize| {
		let st = unsafe { jm.state_mut() };
		st.policy.residence(jm.region.page_number(p), false)
	};
	let valid_test = residence(start) != Residence::Unknown;
	let min_iters = 3;
	let mut nonresident = len;
	let mut iter = 0;
	loop {
		let mut last = start + (len / page_size + 1) * page_size;
		if last >= base + extent {
			last -= page_size;
		}
		let prev_nonresident = nonresident;
		nonresident = 0;
		let mut p = last;
		while p >= start {
			if residence(p) == Residence::NotResident {
				nonresident += 1;
			}
			unsafe {
				util::touch_byte(p as *const u8);
			}
			p -= page_size;
		}
		let keep_going = if valid_test {
			if nonresident == 0 {
				false
			} else if nonresident < prev_nonresident {
				true
			} else {
				iter < min_iters
			}
		} else {
			iter < min_iters
		};
		iter += 1;
		if !keep_going {
			break;
		}
	}
	if nonresident == 0 {
		log::trace!("all pages are resident after {iter} iteration(s)");
	} else {
		log::trace!("some page may still not be resident after {iter} iteration(s)");
	}
}
