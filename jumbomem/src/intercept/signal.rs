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

//! Interception of signal installation and masking.
//!
//! The fault signal's kernel disposition must stay ours. When user code
//! installs a handler for it, the request lands in a two-deep shadow and the
//! previous shadow entry is reported back; the kernel never hears about it.
//! When user code masks signals, the fault signal is quietly stripped from
//! the set. Internal invocations pass through untouched.

use crate::{fatal, threads};
use std::ffi::c_int;

/// Whether the fault-signal shadow is available (the library is initialized).
fn shadow_ready() -> bool {
	crate::try_jm().is_some()
}

/// `signal` wrapper: pretends to install a handler for the fault signal.
pub unsafe fn signal(signum: c_int, handler: libc::sighandler_t) -> libc::sighandler_t {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.signal
		.unwrap_or_else(|| fatal!("signal() was called but its next definition was not found"));
	if signum != libc::SIGSEGV || threads::internal_invocation() || !shadow_ready() {
		return real(signum, handler);
	}
	// Pretend to execute the installation
	let jm = crate::jm();
	let st = jm.state_mut();
	st.shadow.prev_prev.sa_sigaction = st.shadow.prev.sa_sigaction;
	st.shadow.prev.sa_sigaction = handler;
	st.shadow.prev_prev.sa_sigaction
}

/// `sigaction` wrapper: shadows installations on the fault signal and strips
/// it from other signals' masks.
pub unsafe fn sigaction(
	signum: c_int,
	act: *const libc::sigaction,
	oldact: *mut libc::sigaction,
) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.sigaction
		.unwrap_or_else(|| fatal!("sigaction() was called but its next definition was not found"));
	if threads::internal_invocation() || !shadow_ready() {
		return real(signum, act, oldact);
	}
	if signum != libc::SIGSEGV {
		// Pass through, minus the fault signal in the handler's mask
		if !act.is_null() {
			let mut newact = *act;
			libc::sigdelset(&mut newact.sa_mask, libc::SIGSEGV);
			return real(signum, &newact, oldact);
		}
		return real(signum, act, oldact);
	}
	// Only pretend to touch the fault signal's disposition
	let jm = crate::jm();
	let st = jm.state_mut();
	if !oldact.is_null() {
		*oldact = st.shadow.prev;
	}
	if !act.is_null() {
		st.shadow.prev_prev = st.shadow.prev;
		st.shadow.prev = *act;
	}
	0
}

/// Strips the fault signal from `set`, returning the copy to pass through.
unsafe fn stripped(set: *const libc::sigset_t) -> libc::sigset_t {
	let mut copy = *set;
	libc::sigdelset(&mut copy, libc::SIGSEGV);
	copy
}

/// `sigprocmask` wrapper.
pub unsafe fn sigprocmask(
	how: c_int,
	set: *const libc::sigset_t,
	oldset: *mut libc::sigset_t,
) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.sigprocmask
		.unwrap_or_else(|| fatal!("sigprocmask() was called but its next definition was not found"));
	if !threads::internal_invocation() && !set.is_null() {
		let newset = stripped(set);
		real(how, &newset, oldset)
	} else {
		real(how, set, oldset)
	}
}

/// `pthread_sigmask` wrapper.
pub unsafe fn pthread_sigmask(
	how: c_int,
	set: *const libc::sigset_t,
	oldset: *mut libc::sigset_t,
) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real().pthread_sigmask.unwrap_or_else(|| {
		fatal!("pthread_sigmask() was called but its next definition was not found")
	});
	if !threads::internal_invocation() && !set.is_null() {
		let newset = stripped(set);
		real(how, &newset, oldset)
	} else {
		real(how, set, oldset)
	}
}

/// `sigtimedwait` wrapper: the fault signal cannot be claimed by waiters.
pub unsafe fn sigtimedwait(
	set: *const libc::sigset_t,
	info: *mut libc::siginfo_t,
	timeout: *const libc::timespec,
) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real().sigtimedwait.unwrap_or_else(|| {
		fatal!("sigtimedwait() was called but its next definition was not found")
	});
	if !threads::internal_invocation() && !set.is_null() {
		let newset = stripped(set);
		real(&newset, info, timeout)
	} else {
		real(set, info, timeout)
	}
}

/// `sigwaitinfo` wrapper: the fault signal cannot be claimed by waiters.
pub unsafe fn sigwaitinfo(set: *const libc::sigset_t, info: *mut libc::siginfo_t) -> c_int {
	let _guard = threads::critical();
	let real = crate::intercept::real()
		.sigwaitinfo
		.unwrap_or_else(|| fatal!("sigwaitinfo() was called but its next definition was not found"));
	if !threads::internal_invocation() && !set.is_null() {
		let newset = stripped(set);
		real(&newset, info)
	} else {
		real(set, info)
	}
}
