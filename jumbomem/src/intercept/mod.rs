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

//! Interception of external entry points.
//!
//! For every overridden symbol, the next definition in the dynamic-link chain
//! is looked up once and cached; wrappers do their extra work and then invoke
//! it. Without `RTLD_NEXT` resolution (static linking, unusual loaders) the
//! wrappers fall back to the C library directly: the paging core still works,
//! but user code that re-masks the fault signal can no longer be stopped.

pub mod io;
pub mod mem;
pub mod signal;
pub mod thread;

use crate::util;
use std::{
	ffi::{c_char, c_int, c_ulong, c_void},
	mem::transmute_copy,
	sync::{OnceLock, atomic::AtomicUsize},
};

pub(crate) type SignalFn = unsafe extern "C" fn(c_int, libc::sighandler_t) -> libc::sighandler_t;
pub(crate) type SigactionFn =
	unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;
pub(crate) type SigmaskFn =
	unsafe extern "C" fn(c_int, *const libc::sigset_t, *mut libc::sigset_t) -> c_int;
pub(crate) type SigtimedwaitFn = unsafe extern "C" fn(
	*const libc::sigset_t,
	*mut libc::siginfo_t,
	*const libc::timespec,
) -> c_int;
pub(crate) type SigwaitinfoFn =
	unsafe extern "C" fn(*const libc::sigset_t, *mut libc::siginfo_t) -> c_int;
pub(crate) type MmapFn = unsafe extern "C" fn(
	*mut c_void,
	libc::size_t,
	c_int,
	c_int,
	c_int,
	libc::off_t,
) -> *mut c_void;
pub(crate) type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int;
pub(crate) type OpenFn = unsafe extern "C" fn(*const c_char, c_int, libc::mode_t) -> c_int;
pub(crate) type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, libc::size_t) -> libc::ssize_t;
pub(crate) type WriteFn =
	unsafe extern "C" fn(c_int, *const c_void, libc::size_t) -> libc::ssize_t;
pub(crate) type FreadFn =
	unsafe extern "C" fn(*mut c_void, libc::size_t, libc::size_t, *mut libc::FILE) -> libc::size_t;
pub(crate) type FwriteFn = unsafe extern "C" fn(
	*const c_void,
	libc::size_t,
	libc::size_t,
	*mut libc::FILE,
) -> libc::size_t;
pub(crate) type PthreadCreateFn = unsafe extern "C" fn(
	*mut libc::pthread_t,
	*const libc::pthread_attr_t,
	extern "C" fn(*mut c_void) -> *mut c_void,
	*mut c_void,
) -> c_int;

/// Cached pointers to the next definition of every intercepted symbol.
pub(crate) struct RealFns {
	pub signal: Option<SignalFn>,
	pub sigaction: Option<SigactionFn>,
	pub sigprocmask: Option<SigmaskFn>,
	pub pthread_sigmask: Option<SigmaskFn>,
	pub sigtimedwait: Option<SigtimedwaitFn>,
	pub sigwaitinfo: Option<SigwaitinfoFn>,
	pub mmap: Option<MmapFn>,
	pub ioctl: Option<IoctlFn>,
	pub open: Option<OpenFn>,
	pub read: Option<ReadFn>,
	pub write: Option<WriteFn>,
	pub fread: Option<FreadFn>,
	pub fread_unlocked: Option<FreadFn>,
	pub fwrite: Option<FwriteFn>,
	pub fwrite_unlocked: Option<FwriteFn>,
	pub pthread_create: Option<PthreadCreateFn>,
}

static REAL: OnceLock<RealFns> = OnceLock::new();

/// Default stack size for threads created without one, derived from the
/// process stack rlimit.
pub(crate) static DEFAULT_STACK_SIZE: AtomicUsize = AtomicUsize::new(2 * 1024 * 1024);

/// Looks up the next definition of `name` in the dynamic-link chain.
///
/// A missing symbol is not immediately fatal; the caller decides what to do
/// if the function is actually needed.
unsafe fn lookup<T>(name: &'static str) -> Option<T> {
	debug_assert!(name.ends_with('\0'));
	let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
	if sym.is_null() {
		None
	} else {
		Some(transmute_copy::<*mut c_void, T>(&sym))
	}
}

fn resolve() -> RealFns {
	unsafe {
		RealFns {
			signal: lookup("signal\0"),
			sigaction: lookup("sigaction\0"),
			sigprocmask: lookup("sigprocmask\0"),
			pthread_sigmask: lookup("pthread_sigmask\0"),
			sigtimedwait: lookup("sigtimedwait\0"),
			sigwaitinfo: lookup("sigwaitinfo\0"),
			mmap: lookup("mmap\0"),
			ioctl: lookup("ioctl\0"),
			open: lookup("open\0"),
			read: lookup("read\0"),
			write: lookup("write\0"),
			fread: lookup("fread\0"),
			fread_unlocked: lookup("fread_unlocked\0"),
			fwrite: lookup("fwrite\0"),
			fwrite_unlocked: lookup("fwrite_unlocked\0"),
			pthread_create: lookup("pthread_create\0"),
		}
	}
}

/// The cached symbol table, resolving it on first use.
pub(crate) fn real() -> &'static RealFns {
	REAL.get_or_init(resolve)
}

/// Resolves every override early and sizes the default thread stack.
pub(crate) fn initialize() {
	let fns = real();
	if fns.sigaction.is_none() {
		log::warn!("JumboMem is unable to intercept existing functions; many programs will fail");
	}
	// Default thread stacks mirror the process stack limit
	let mut limits = libc::rlimit {
		rlim_cur: 0,
		rlim_max: 0,
	};
	if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limits) } == -1 {
		log::trace!(
			"failed to determine the limits on stack size ({}); using a default size for new threads",
			util::last_error()
		);
	} else if limits.rlim_cur != libc::RLIM_INFINITY {
		DEFAULT_STACK_SIZE.store(
			limits.rlim_cur as usize,
			std::sync::atomic::Ordering::Relaxed,
		);
	}
}

/// Invokes the next `sigaction`, falling back to libc when interposition is
/// unavailable.
pub(crate) unsafe fn real_sigaction(
	signum: c_int,
	act: *const libc::sigaction,
	old: *mut libc::sigaction,
) -> c_int {
	match real().sigaction {
		Some(f) => f(signum, act, old),
		None => libc::sigaction(signum, act, old),
	}
}

/// Invokes the next `mmap`, falling back to libc.
pub(crate) unsafe fn real_mmap(
	addr: *mut c_void,
	len: libc::size_t,
	prot: c_int,
	flags: c_int,
	fd: c_int,
	offset: libc::off_t,
) -> *mut c_void {
	match real().mmap {
		Some(f) => f(addr, len, prot, flags, fd, offset),
		None => libc::mmap(addr, len, prot, flags, fd, offset),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_core_symbols() {
		// In a normally linked test binary, RTLD_NEXT reaches libc
		let fns = real();
		assert!(fns.read.is_some());
		assert!(fns.write.is_some());
		assert!(fns.sigaction.is_some());
		assert!(fns.mmap.is_some());
	}
}
