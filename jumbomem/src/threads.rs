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

//! The concurrency core: the process-wide mega-lock, per-thread records and
//! the freeze protocol.
//!
//! The library is effectively single-threaded: every path that touches
//! library state serializes on one mutex. Each thread counts its nesting
//! depth so that recursive entries do not re-acquire the lock, and the fault
//! handler can force every other user thread to park on the lock before a
//! page swap.

use crate::{fatal, util};
use std::{
	cell::{Cell, UnsafeCell},
	ffi::c_void,
	mem::{MaybeUninit, size_of},
	ptr,
	sync::{
		Once,
		atomic::{
			AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize,
			Ordering::{Acquire, Relaxed, Release, SeqCst},
		},
	},
};

/// `blocked` value marking a terminated thread, so freeze polls skip it
/// forever.
const BLOCKED_FOREVER: u32 = u32::MAX;

/// Number of thread records that can be handed out before the allocator is
/// up.
const MAX_STATIC_RECORDS: usize = 8;

/// A plain pthread mutex. The standard library's locks may allocate or park
/// in ways that are not reentrancy-tolerant inside a signal handler.
struct RawMutex(UnsafeCell<libc::pthread_mutex_t>);

unsafe impl Sync for RawMutex {}

impl RawMutex {
	const fn new() -> Self {
		Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER))
	}

	fn lock(&self) {
		if unsafe { libc::pthread_mutex_lock(self.0.get()) } != 0 {
			fatal!("failed to acquire the thread mega-lock");
		}
	}

	fn unlock(&self) {
		if unsafe { libc::pthread_mutex_unlock(self.0.get()) } != 0 {
			fatal!("failed to release the thread mega-lock");
		}
	}
}

/// The process-wide mega-lock.
static MEGALOCK: RawMutex = RawMutex::new();
/// Serializes creation of thread records.
static INIT_LOCK: RawMutex = RawMutex::new();

/// Head of the singly-linked list of thread records. Mutated under the
/// mega-lock.
static THREAD_LIST: AtomicPtr<ThreadRecord> = AtomicPtr::new(ptr::null_mut());

/// Process-wide flag marking every running thread as library-internal, used
/// while the transport spawns helper threads.
static PROCESS_INTERNAL: AtomicBool = AtomicBool::new(false);

/// Per-thread record, one per thread that ever entered the library.
pub struct ThreadRecord {
	/// Pthread handle, for signalling.
	tid: libc::pthread_t,
	/// Kernel thread ID, for run-state probes. -1 if unknown.
	kernel_tid: libc::pid_t,
	/// Non-zero while the thread waits on the mega-lock;
	/// [`BLOCKED_FOREVER`] once it terminated.
	blocked: AtomicU32,
	/// Nesting depth of library entries. The lock is taken only on 0 -> 1.
	internal_depth: AtomicU32,
	/// Number of pending orders to bail out of the fault handler.
	cancel_handler: AtomicI32,
	/// The thread belongs to the transport, not the user.
	internal: bool,
	/// The record came from the arena and may be freed.
	freeable: bool,
	/// Next record in the list.
	next: AtomicPtr<ThreadRecord>,
}

thread_local! {
	/// Cache of the calling thread's record.
	static SELF_RECORD: Cell<*mut ThreadRecord> = const { Cell::new(ptr::null_mut()) };
}

/// Key whose destructor marks a terminating thread as forever blocked.
static KEY_ONCE: Once = Once::new();
static KEY: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Marks a terminating thread's record, so it is never signalled again.
extern "C" fn thread_destructor(record: *mut c_void) {
	let record = record as *mut ThreadRecord;
	unsafe {
		(*record).blocked.store(BLOCKED_FOREVER, SeqCst);
	}
}

/// Statically allocated records, used before the arena can allocate.
struct StaticRecords(UnsafeCell<[MaybeUninit<ThreadRecord>; MAX_STATIC_RECORDS]>);

unsafe impl Sync for StaticRecords {}

static STATIC_RECORDS: StaticRecords =
	StaticRecords(UnsafeCell::new([const { MaybeUninit::uninit() }; MAX_STATIC_RECORDS]));
static STATIC_RECORDS_USED: AtomicUsize = AtomicUsize::new(0);

/// Creates and registers the calling thread's record.
fn create_record() -> *mut ThreadRecord {
	INIT_LOCK.lock();
	// Lost the race: another path created our record meanwhile
	let existing = SELF_RECORD.try_with(Cell::get).unwrap_or(ptr::null_mut());
	if !existing.is_null() {
		INIT_LOCK.unlock();
		return existing;
	}
	let freeable = crate::alloc::ready();
	let record = if freeable {
		crate::alloc::internal_alloc_raw(size_of::<ThreadRecord>()) as *mut ThreadRecord
	} else {
		let idx = STATIC_RECORDS_USED.fetch_add(1, SeqCst);
		if idx >= MAX_STATIC_RECORDS {
			fatal!("failed to allocate {MAX_STATIC_RECORDS} static blocks of thread information");
		}
		unsafe { (*STATIC_RECORDS.0.get())[idx].as_mut_ptr() }
	};
	if record.is_null() {
		fatal!("failed to allocate a thread record");
	}
	unsafe {
		record.write(ThreadRecord {
			tid: libc::pthread_self(),
			kernel_tid: util::gettid(),
			blocked: AtomicU32::new(0),
			internal_depth: AtomicU32::new(0),
			cancel_handler: AtomicI32::new(0),
			internal: false,
			freeable,
			next: AtomicPtr::new(ptr::null_mut()),
		});
	}
	KEY_ONCE.call_once(|| {
		let mut key: libc::pthread_key_t = 0;
		if unsafe { libc::pthread_key_create(&mut key, Some(thread_destructor)) } != 0 {
			fatal!("pthread_key_create() failed");
		}
		KEY.store(key as usize, SeqCst);
	});
	unsafe {
		if libc::pthread_setspecific(KEY.load(SeqCst) as libc::pthread_key_t, record as *const _)
			!= 0
		{
			fatal!("pthread_setspecific() failed");
		}
	}
	let _ = SELF_RECORD.try_with(|c| c.set(record));
	// Insert at the head of the list under the mega-lock: a concurrent
	// freeze must either see this thread or know it cannot yet touch the
	// managed region
	enter_critical();
	unsafe {
		(*record).internal = PROCESS_INTERNAL.load(SeqCst);
		(*record).next.store(THREAD_LIST.load(Acquire), Relaxed);
	}
	THREAD_LIST.store(record, Release);
	exit_critical();
	INIT_LOCK.unlock();
	record
}

/// Returns the calling thread's record, creating it on first entry.
fn record() -> *mut ThreadRecord {
	let cached = SELF_RECORD.try_with(Cell::get).unwrap_or(ptr::null_mut());
	if !cached.is_null() {
		return cached;
	}
	// The thread-local may be gone during thread teardown; the pthread key
	// outlives it
	let key = KEY.load(SeqCst);
	if key != usize::MAX {
		let p =
			unsafe { libc::pthread_getspecific(key as libc::pthread_key_t) } as *mut ThreadRecord;
		if !p.is_null() {
			let _ = SELF_RECORD.try_with(|c| c.set(p));
			return p;
		}
	}
	create_record()
}

/// Enters the library's critical section.
///
/// Only the outermost entry takes the mega-lock; recursive entries just
/// deepen the count.
pub fn enter_critical() {
	let r = unsafe { &*record() };
	r.blocked.store(1, SeqCst);
	if r.internal_depth.load(Relaxed) == 0 {
		MEGALOCK.lock();
	}
	r.blocked.store(0, SeqCst);
	r.internal_depth.fetch_add(1, Relaxed);
}

/// Leaves the library's critical section, releasing the mega-lock on the
/// outermost exit.
pub fn exit_critical() {
	let r = unsafe { &*record() };
	let depth = r.internal_depth.fetch_sub(1, Relaxed);
	if depth == 1 {
		MEGALOCK.unlock();
	}
}

/// RAII critical-section guard.
pub struct Critical(());

impl Drop for Critical {
	fn drop(&mut self) {
		exit_critical();
	}
}

/// Enters the critical section until the guard drops.
pub fn critical() -> Critical {
	enter_critical();
	Critical(())
}

/// The calling thread's nesting depth.
pub fn internal_depth() -> u32 {
	unsafe { (*record()).internal_depth.load(Relaxed) }
}

/// Overrides the calling thread's nesting depth. Used by the fatal-error path
/// to unwind bookkeeping it cannot pop normally.
pub fn set_internal_depth(depth: u32) {
	unsafe {
		(*record()).internal_depth.store(depth, Relaxed);
	}
}

/// Whether the current call entered the library from library code rather than
/// from the user.
///
/// The depth threshold is 1 because the asking wrapper has already entered
/// once itself.
pub fn internal_invocation() -> bool {
	PROCESS_INTERNAL.load(SeqCst) || internal_depth() > 1
}

/// Marks every thread created from now on as transport-internal.
pub fn set_process_internal(internal: bool) {
	PROCESS_INTERNAL.store(internal, SeqCst);
}

/// Consumes one pending bail-out order, if any.
///
/// The fault handler calls this right after acquiring the mega-lock; a
/// positive count means this thread was frozen and the page it faulted on has
/// been dealt with, so it must simply return and re-fault if needed.
pub fn must_exit_handler_now() -> bool {
	let r = unsafe { &*record() };
	if r.cancel_handler.load(SeqCst) > 0 {
		r.cancel_handler.fetch_sub(1, SeqCst);
		true
	} else {
		false
	}
}

/// Freezes all other user threads.
///
/// Sends the fault signal to every live, unblocked, non-internal thread so it
/// parks on the mega-lock, then waits until each one is parked or blocked in
/// the kernel. Threads that cannot be signalled anymore are unlinked. Must be
/// called with the mega-lock held.
pub fn freeze_other_threads(timeout_ms: u64, timeout_fatal: bool) {
	let self_tid = unsafe { libc::pthread_self() };
	// Pass 1: order every candidate into its signal handler
	let mut link: &AtomicPtr<ThreadRecord> = &THREAD_LIST;
	loop {
		let cur = link.load(Acquire);
		if cur.is_null() {
			break;
		}
		let r = unsafe { &*cur };
		let other = unsafe { libc::pthread_equal(self_tid, r.tid) } == 0;
		if other && r.blocked.load(SeqCst) == 0 && !r.internal {
			log::trace!("signalling thread {} (LWP {}) to freeze", r.tid, r.kernel_tid);
			if unsafe { libc::pthread_kill(r.tid, libc::SIGSEGV) } == libc::ESRCH {
				// The thread is dead; drop it from future consideration
				let next = r.next.load(Acquire);
				let freeable = r.freeable;
				link.store(next, Release);
				if freeable {
					crate::alloc::internal_free_raw(cur as *mut u8);
				}
				continue;
			}
		}
		link = &r.next;
	}
	// Pass 2: wait for every candidate to park
	let start_ms = util::current_time_ms();
	let mut cur = THREAD_LIST.load(Acquire);
	while !cur.is_null() {
		let r = unsafe { &*cur };
		let other = unsafe { libc::pthread_equal(self_tid, r.tid) } == 0;
		if other && !r.internal {
			loop {
				// Parked on the mega-lock (or terminated)
				if r.blocked.load(SeqCst) != 0 {
					break;
				}
				// Blocked in the kernel: it will enter its handler and park
				// as soon as it wakes
				let state = util::thread_state(r.kernel_tid);
				if state == 'D' || state == 'Z' || state == 'T' {
					break;
				}
				if util::current_time_ms() - start_ms > timeout_ms {
					if timeout_fatal {
						fatal!(
							"thread {} (LWP {}) failed to freeze after {timeout_ms} ms",
							r.tid,
							r.kernel_tid
						);
					}
					log::debug!(
						"thread {} (LWP {}) failed to freeze after {timeout_ms} ms; proceeding anyway",
						r.tid,
						r.kernel_tid
					);
					break;
				}
				unsafe {
					libc::sched_yield();
				}
			}
		}
		cur = r.next.load(Acquire);
	}
	// Pass 3: tell every frozen thread to leave its handler as soon as it
	// gets the lock
	let mut cur = THREAD_LIST.load(Acquire);
	while !cur.is_null() {
		let r = unsafe { &*cur };
		let other = unsafe { libc::pthread_equal(self_tid, r.tid) } == 0;
		if other && !r.internal {
			r.cancel_handler.fetch_add(1, SeqCst);
		}
		cur = r.next.load(Acquire);
	}
}

/// Arguments carried from an intercepted `pthread_create` to the wrapped
/// start routine.
pub struct ThreadStart {
	/// The user's start routine.
	pub start: extern "C" fn(*mut c_void) -> *mut c_void,
	/// The user's argument.
	pub arg: *mut c_void,
}

/// Start-routine prologue for intercepted thread creation.
///
/// Low-level thread-spawn helpers may block every signal around the clone and
/// restore the mask through paths the interception layer cannot see, so the
/// fault signal is unblocked here before the user routine runs.
pub extern "C" fn thread_start_routine(arg: *mut c_void) -> *mut c_void {
	{
		let _guard = critical();
		unsafe {
			let mut set: libc::sigset_t = std::mem::zeroed();
			if libc::sigemptyset(&mut set) == -1 {
				fatal!("sigemptyset() failed");
			}
			if libc::sigaddset(&mut set, libc::SIGSEGV) == -1 {
				fatal!("sigaddset() failed to add the fault signal");
			}
			if libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) != 0 {
				fatal!("pthread_sigmask() failed to unblock the fault signal");
			}
		}
	}
	let args = unsafe { Box::from_raw(arg as *mut ThreadStart) };
	(args.start)(args.arg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn critical_section_nests() {
		assert_eq!(internal_depth(), 0);
		{
			let _a = critical();
			assert_eq!(internal_depth(), 1);
			assert!(!internal_invocation());
			{
				let _b = critical();
				assert_eq!(internal_depth(), 2);
				assert!(internal_invocation());
			}
			assert_eq!(internal_depth(), 1);
		}
		assert_eq!(internal_depth(), 0);
	}

	#[test]
	fn cancel_orders_are_one_shot() {
		let r = unsafe { &*record() };
		r.cancel_handler.store(2, SeqCst);
		assert!(must_exit_handler_now());
		assert!(must_exit_handler_now());
		assert!(!must_exit_handler_now());
	}

	#[test]
	fn threads_get_distinct_records() {
		let own = record() as usize;
		let other = std::thread::spawn(|| record() as usize).join().unwrap();
		assert_ne!(own, other);
	}
}
