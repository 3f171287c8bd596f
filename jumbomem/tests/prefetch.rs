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

//! Prefetch accounting under a strictly increasing access pattern.

use jumbomem::transport::MemTransport;
use std::env;

const PAGE_SIZE: usize = 16384;
const PAGES_PER_PEER: usize = 16;
const BUDGET: usize = 16;
const NUM_PEERS: usize = 4;

#[test]
fn next_prefetch_hits_every_time() {
	env::set_var("JM_PAGESIZE", PAGE_SIZE.to_string());
	env::set_var("JM_LOCAL_PAGES", BUDGET.to_string());
	env::set_var("JM_PAGEREPLACE", "nru");
	env::set_var("JM_PREFETCH", "next");
	// Keep reference bits from decaying mid-test
	env::set_var("JM_NRU_INTERVAL", "3600000");
	let transport = MemTransport::new(NUM_PEERS, PAGES_PER_PEER * PAGE_SIZE).unwrap();
	jumbomem::initialize_with(Box::new(transport)).unwrap();
	let (base, extent) = jumbomem::region_bounds().unwrap();
	let total_pages = extent / PAGE_SIZE;

	// Touch one byte per page, strictly increasing: after the first miss,
	// every fault finds its page already prefetched
	for page in 0..total_pages {
		let p = (base + page * PAGE_SIZE) as *mut u8;
		unsafe {
			p.write_volatile(page as u8);
		}
	}
	let stats = jumbomem::statistics().unwrap();
	assert!(stats.major_faults >= (total_pages - BUDGET) as u64);
	assert_eq!(stats.good_prefetches, stats.major_faults - 1);
	assert_eq!(stats.bad_prefetches, 0);

	// The data went through the prefetch buffer and still reads back
	for page in 0..total_pages {
		let p = (base + page * PAGE_SIZE) as *const u8;
		assert_eq!(unsafe { p.read_volatile() }, page as u8);
	}
}
