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

//! Interception-layer behavior against a live managed region.

use jumbomem::transport::MemTransport;
use std::{
	env,
	fs::File,
	io::Read,
	os::fd::FromRawFd,
	process::Command,
	sync::OnceLock,
};

const PAGE_SIZE: usize = 16384;
const PAGES_PER_PEER: usize = 16;
const BUDGET: usize = 16;
const NUM_PEERS: usize = 4;

fn setup() -> (usize, usize) {
	static REGION: OnceLock<(usize, usize)> = OnceLock::new();
	*REGION.get_or_init(|| {
		env::set_var("JM_PAGESIZE", PAGE_SIZE.to_string());
		env::set_var("JM_LOCAL_PAGES", BUDGET.to_string());
		let transport = MemTransport::new(NUM_PEERS, PAGES_PER_PEER * PAGE_SIZE).unwrap();
		jumbomem::initialize_with(Box::new(transport)).unwrap();
		jumbomem::region_bounds().unwrap()
	})
}

#[test]
fn meminfo_reports_the_region() {
	let (_, extent) = setup();
	let fd = unsafe {
		jumbomem::intercept::io::open(b"/proc/meminfo\0".as_ptr() as *const _, libc::O_RDONLY, 0)
	};
	assert!(fd >= 0);
	let mut content = String::new();
	unsafe { File::from_raw_fd(fd) }
		.read_to_string(&mut content)
		.unwrap();
	let total = content
		.lines()
		.find_map(|l| l.strip_prefix("MemTotal:"))
		.and_then(|l| l.trim().strip_suffix("kB").map(str::trim))
		.and_then(|v| v.parse::<usize>().ok())
		.expect("MemTotal missing from the synthesized file");
	assert_eq!(total, extent / 1024);
}

#[test]
fn mmap_avoids_the_region() {
	let (base, extent) = setup();
	for _ in 0..8 {
		let len = 64 * 1024;
		let addr = unsafe {
			jumbomem::intercept::mem::mmap(
				std::ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};
		assert_ne!(addr, libc::MAP_FAILED);
		let a = addr as usize;
		// Entirely below or entirely above the managed range
		assert!(a + len <= base || a >= base + extent);
		unsafe {
			// The memory is actually usable
			(addr as *mut u8).write_volatile(1);
		}
	}
}

extern "C" fn user_segv_handler(_: libc::c_int) {
	// Prove the handler ran by exiting with a recognizable status
	unsafe {
		libc::_exit(42);
	}
}

/// Child half of `user_handler_chains_for_foreign_faults`: installs a handler
/// through the intercepted installer, then faults outside the managed region.
fn chain_child() -> ! {
	setup();
	unsafe {
		let mut act: libc::sigaction = std::mem::zeroed();
		act.sa_sigaction = user_segv_handler as usize;
		libc::sigemptyset(&mut act.sa_mask);
		// Lands in the shadow; the kernel disposition stays the library's
		let res = jumbomem::intercept::signal::sigaction(
			libc::SIGSEGV,
			&act,
			std::ptr::null_mut(),
		);
		assert_eq!(res, 0);
		// A genuine wild access: the library must step aside and let the
		// shadowed handler take the replayed fault
		let _ = std::ptr::read_volatile(8 as *const u8);
		libc::_exit(1)
	}
}

#[test]
fn user_handler_chains_for_foreign_faults() {
	if env::var("JM_TEST_CHAIN_CHILD").is_ok() {
		chain_child();
	}
	let exe = env::current_exe().unwrap();
	let status = Command::new(exe)
		.args(["--exact", "user_handler_chains_for_foreign_faults", "--test-threads=1"])
		.env("JM_TEST_CHAIN_CHILD", "1")
		.status()
		.unwrap();
	assert_eq!(status.code(), Some(42));
}

#[test]
fn chunked_write_covers_the_request() {
	let (base, _) = setup();
	// A buffer spanning twice the local cache cannot be handed to the
	// kernel whole
	let len = 2 * BUDGET * PAGE_SIZE;
	let devnull = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_WRONLY) };
	assert!(devnull >= 0);
	let n = unsafe {
		jumbomem::intercept::io::write(devnull, base as *const _, len)
	};
	unsafe {
		libc::close(devnull);
	}
	assert_eq!(n, len as libc::ssize_t);
}
