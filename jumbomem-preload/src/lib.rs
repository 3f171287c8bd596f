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

//! C-ABI shims for preloading ahead of the C library.
//!
//! Every symbol here shadows a libc entry point and forwards to the library's
//! wrapper, which does its work and then calls the next definition in the
//! link chain. The ELF constructor initializes the library before `main`;
//! the destructor tears it down at exit.
//!
//! `open` and `ioctl` are variadic in C; the shims take the fixed shapes the
//! wrappers care about, which match the SysV calling convention for the
//! variadic originals.

use std::ffi::{c_char, c_int, c_ulong, c_void};

extern "C" fn init() {
	let _ = jumbomem::initialize();
}

extern "C" fn fini() {
	jumbomem::finalize();
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;

#[used]
#[link_section = ".fini_array"]
static FINI: extern "C" fn() = fini;

// Allocator entry points

#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::calloc(nmemb, size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::realloc(ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
	jumbomem::alloc::free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: libc::size_t, size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::memalign(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::valloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: libc::size_t) -> *mut c_void {
	jumbomem::alloc::pvalloc(size)
}

// Signal installation and masking

#[no_mangle]
pub unsafe extern "C" fn signal(
	signum: c_int,
	handler: libc::sighandler_t,
) -> libc::sighandler_t {
	jumbomem::intercept::signal::signal(signum, handler)
}

#[no_mangle]
pub unsafe extern "C" fn sigaction(
	signum: c_int,
	act: *const libc::sigaction,
	oldact: *mut libc::sigaction,
) -> c_int {
	jumbomem::intercept::signal::sigaction(signum, act, oldact)
}

#[no_mangle]
pub unsafe extern "C" fn sigprocmask(
	how: c_int,
	set: *const libc::sigset_t,
	oldset: *mut libc::sigset_t,
) -> c_int {
	jumbomem::intercept::signal::sigprocmask(how, set, oldset)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_sigmask(
	how: c_int,
	set: *const libc::sigset_t,
	oldset: *mut libc::sigset_t,
) -> c_int {
	jumbomem::intercept::signal::pthread_sigmask(how, set, oldset)
}

#[no_mangle]
pub unsafe extern "C" fn sigtimedwait(
	set: *const libc::sigset_t,
	info: *mut libc::siginfo_t,
	timeout: *const libc::timespec,
) -> c_int {
	jumbomem::intercept::signal::sigtimedwait(set, info, timeout)
}

#[no_mangle]
pub unsafe extern "C" fn sigwaitinfo(
	set: *const libc::sigset_t,
	info: *mut libc::siginfo_t,
) -> c_int {
	jumbomem::intercept::signal::sigwaitinfo(set, info)
}

// Memory mapping

#[no_mangle]
pub unsafe extern "C" fn mmap(
	addr: *mut c_void,
	length: libc::size_t,
	prot: c_int,
	flags: c_int,
	fd: c_int,
	offset: libc::off_t,
) -> *mut c_void {
	jumbomem::intercept::mem::mmap(addr, length, prot, flags, fd, offset)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
	jumbomem::intercept::mem::ioctl(fd, request, argp)
}

// Bulk I/O

#[no_mangle]
pub unsafe extern "C" fn open(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
	jumbomem::intercept::io::open(pathname, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: libc::size_t) -> libc::ssize_t {
	jumbomem::intercept::io::read(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn write(
	fd: c_int,
	buf: *const c_void,
	count: libc::size_t,
) -> libc::ssize_t {
	jumbomem::intercept::io::write(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn fread(
	ptr: *mut c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	jumbomem::intercept::io::fread(ptr, size, nmemb, stream)
}

#[no_mangle]
pub unsafe extern "C" fn fread_unlocked(
	ptr: *mut c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	jumbomem::intercept::io::fread_unlocked(ptr, size, nmemb, stream)
}

#[no_mangle]
pub unsafe extern "C" fn fwrite(
	ptr: *const c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	jumbomem::intercept::io::fwrite(ptr, size, nmemb, stream)
}

#[no_mangle]
pub unsafe extern "C" fn fwrite_unlocked(
	ptr: *const c_void,
	size: libc::size_t,
	nmemb: libc::size_t,
	stream: *mut libc::FILE,
) -> libc::size_t {
	jumbomem::intercept::io::fwrite_unlocked(ptr, size, nmemb, stream)
}

// Thread creation

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
	thread: *mut libc::pthread_t,
	attr: *const libc::pthread_attr_t,
	start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
	arg: *mut c_void,
) -> c_int {
	jumbomem::intercept::thread::pthread_create(thread, attr, start_routine, arg)
}
