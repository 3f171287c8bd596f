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

//! Interception of thread creation.
//!
//! Two jobs: make sure every thread runs on an explicitly provided stack
//! (never one carved from the managed region by a foreign allocator), and
//! wrap the start routine so the fault signal is unblocked before user code
//! runs.

use crate::{fatal, intercept, memory, threads};
use std::{ffi::c_void, mem, sync::atomic::Ordering::Relaxed};

/// `pthread_create` wrapper.
pub unsafe fn pthread_create(
	thread: *mut libc::pthread_t,
	attr: *const libc::pthread_attr_t,
	start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
	arg: *mut c_void,
) -> libc::c_int {
	let real = intercept::real().pthread_create.unwrap_or_else(|| {
		fatal!("pthread_create() was called but its next definition was not found")
	});
	let args = Box::into_raw(Box::new(threads::ThreadStart {
		start: start_routine,
		arg,
	}));
	// Work on our own copy of the attributes so a missing stack can be
	// supplied
	let mut local_attr: libc::pthread_attr_t = mem::zeroed();
	let created_attr = attr.is_null();
	if created_attr {
		if libc::pthread_attr_init(&mut local_attr) != 0 {
			fatal!("failed to initialize thread attributes");
		}
	} else {
		local_attr = *attr;
	}
	let mut stack_addr: *mut c_void = std::ptr::null_mut();
	let mut stack_size: libc::size_t = 0;
	if libc::pthread_attr_getstack(&local_attr, &mut stack_addr, &mut stack_size) != 0 {
		fatal!("failed to retrieve the thread stack from the given attributes");
	}
	if stack_size == 0 {
		// No caller-supplied stack: provide one from outside the managed
		// region. It is never reclaimed; there is no reliable point after
		// the thread exits at which to free it.
		let size = intercept::DEFAULT_STACK_SIZE.load(Relaxed);
		let stack = {
			let _guard = threads::critical();
			memory::alloc_outside_region(size, crate::try_jm().map(|jm| &jm.region))
		};
		if libc::pthread_attr_setstack(&mut local_attr, stack as *mut c_void, size) != 0 {
			fatal!("failed to set the thread stack");
		}
	}
	let res = real(
		thread,
		&local_attr,
		threads::thread_start_routine,
		args as *mut c_void,
	);
	if created_attr {
		libc::pthread_attr_destroy(&mut local_attr);
	}
	if res != 0 {
		// The thread never started; reclaim the wrapper arguments
		drop(Box::from_raw(args));
	}
	res
}
