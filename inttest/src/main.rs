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

//! Integration tests for JumboMem.
//!
//! Pages a buffer larger than the local cache through an in-process loopback
//! transport and checks that every byte comes back intact, single- and
//! multi-threaded.
//!
//! Usage: `inttest [<mebibytes>]`

use crate::util::TestResult;
use jumbomem::transport::MemTransport;
use std::{env, process::exit};

mod paging;
mod util;

/// Number of loopback peers backing the managed region.
const NUM_PEERS: usize = 4;

struct Test {
	name: &'static str,
	desc: &'static str,
	start: fn() -> TestResult,
}

/// The list of tests to perform, in order: later tests depend on the
/// region contents earlier ones left behind.
const TESTS: &[Test] = &[
	Test {
		name: "fill",
		desc: "Write a counting pattern over the whole managed region",
		start: paging::fill,
	},
	Test {
		name: "sum",
		desc: "Read every word back and compare against the closed form",
		start: paging::sum,
	},
	Test {
		name: "threaded_sum",
		desc: "Sum disjoint slices from 8 threads concurrently",
		start: || paging::threaded_sum(8),
	},
	Test {
		name: "accounting",
		desc: "Check fault counts against the eviction discipline",
		start: paging::accounting,
	},
	Test {
		name: "chunked_read",
		desc: "Read a file into the region through the adaptive chunker",
		start: paging::chunked_read,
	},
];

fn main() {
	let mut args = env::args().skip(1);
	let mebibytes: usize = args
		.next()
		.map(|s| s.parse().expect("the number of mebibytes must be a positive integer"))
		.unwrap_or(64);
	let total = mebibytes << 20;
	// Keep the cache small enough that the region cannot fit locally,
	// unless the caller pinned the knobs already
	if env::var("JM_PAGESIZE").is_err() {
		env::set_var("JM_PAGESIZE", "65536");
	}
	if env::var("JM_LOCAL_PAGES").is_err() {
		let page_size: usize = env::var("JM_PAGESIZE").unwrap().parse().unwrap();
		env::set_var("JM_LOCAL_PAGES", format!("{}", (total / page_size / 4).max(2)));
	}
	let transport =
		MemTransport::new(NUM_PEERS, total / NUM_PEERS).expect("failed to create peers");
	jumbomem::initialize_with(Box::new(transport)).expect("failed to initialize JumboMem");
	println!();
	println!("[START]");
	let mut success = 0;
	for test in TESTS {
		println!("[TEST] {}", test.name);
		println!("[DESC] {}", test.desc);
		match (test.start)() {
			Ok(_) => {
				success += 1;
				println!("[OK]")
			}
			Err(err) => println!("[KO] {}", err.0),
		}
	}
	let total_tests = TESTS.len();
	println!("[SUCCESS] {success}/{total_tests}");
	println!("[END]");
	jumbomem::finalize();
	if success < total_tests {
		exit(1);
	}
}
