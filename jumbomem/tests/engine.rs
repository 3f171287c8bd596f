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

//! End-to-end paging through real page faults, FIFO replacement.
//!
//! The whole scenario runs as one test: later phases depend on what earlier
//! phases left in the region.

use jumbomem::transport::MemTransport;
use std::{env, slice, sync::OnceLock};

/// Logical page size used by the scenario.
const PAGE_SIZE: usize = 16384;
/// Pages each of the four peers contributes.
const PAGES_PER_PEER: usize = 16;
/// Local cache budget in pages.
const BUDGET: usize = 16;
const NUM_PEERS: usize = 4;

fn setup() -> (usize, usize) {
	static REGION: OnceLock<(usize, usize)> = OnceLock::new();
	*REGION.get_or_init(|| {
		env::set_var("JM_PAGESIZE", PAGE_SIZE.to_string());
		env::set_var("JM_LOCAL_PAGES", BUDGET.to_string());
		env::set_var("JM_PAGEREPLACE", "fifo");
		// Freeze acknowledgement can be slow on a loaded machine
		env::set_var("JM_FREEZE_TIMEOUT", "10000");
		let transport = MemTransport::new(NUM_PEERS, PAGES_PER_PEER * PAGE_SIZE).unwrap();
		jumbomem::initialize_with(Box::new(transport)).unwrap();
		jumbomem::region_bounds().unwrap()
	})
}

/// The wrapping sum of `i + 1` over `[first, first + count)`.
fn expected_sum(first: usize, count: usize) -> u32 {
	let upto = |n: usize| (n as u128 * (n as u128 + 1) / 2) as u32;
	upto(first + count).wrapping_sub(upto(first))
}

#[test]
fn paging_end_to_end() {
	let (base, extent) = setup();
	assert_eq!(extent, NUM_PEERS * PAGES_PER_PEER * PAGE_SIZE);
	assert_eq!(jumbomem::local_page_budget(), Some(BUDGET));
	let words = unsafe { slice::from_raw_parts_mut(base as *mut u32, extent / 4) };

	// Write a counting pattern over four times more memory than the cache
	// holds, then read every word back
	for (i, w) in words.iter_mut().enumerate() {
		*w = (i as u32).wrapping_add(1);
	}
	let mut sum = 0u32;
	for w in words.iter() {
		sum = sum.wrapping_add(*w);
	}
	assert_eq!(sum, expected_sum(0, words.len()));

	// Every miss past the cold-mapped prefix must have faulted, and with a
	// full cache every major fault evicts exactly one page. FIFO considers
	// every victim dirty, so evictions all hit the wire.
	let stats = jumbomem::statistics().unwrap();
	let total_pages = (extent / PAGE_SIZE) as u64;
	assert!(stats.major_faults >= total_pages - BUDGET as u64);
	assert_eq!(stats.pages_sent, stats.major_faults);
	assert_eq!(stats.clean_evictions, 0);

	// Concurrent disjoint readers race the pager, not each other
	let threads = 8;
	let count = words.len() / threads;
	std::thread::scope(|s| {
		let handles: Vec<_> = (0..threads)
			.map(|t| {
				let slice = &words[t * count..(t + 1) * count];
				s.spawn(move || {
					let mut sum = 0u32;
					for w in slice {
						sum = sum.wrapping_add(*w);
					}
					sum
				})
			})
			.collect();
		for (t, h) in handles.into_iter().enumerate() {
			assert_eq!(h.join().unwrap(), expected_sum(t * count, count));
		}
	});

	// Rewrites through the paging path must stick
	words[0] = 0xdead_beef;
	let last = words.len() - 1;
	words[last] = 0x1234_5678;
	for w in words[1..last].iter_mut() {
		*w = 1;
	}
	assert_eq!(words[0], 0xdead_beef);
	assert_eq!(words[last], 0x1234_5678);
}
