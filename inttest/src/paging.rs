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

//! Paging tests: write the whole managed region, then read it back from one
//! or many threads.

use crate::{
	log, test_assert, test_assert_eq,
	util::{TestResult, expected_partial_sum, expected_sum, region_words},
};

/// Writes `i + 1` into every word of the region.
pub fn fill() -> TestResult {
	let words = unsafe { region_words() };
	log!("Writing {} {}-byte words into the region", words.len(), 4);
	for (i, w) in words.iter_mut().enumerate() {
		*w = (i as u32).wrapping_add(1);
	}
	Ok(())
}

/// Sums the whole region and compares against the closed form.
///
/// With more remote pages than fit locally, every page round-trips through
/// the transport at least once.
pub fn sum() -> TestResult {
	let words = unsafe { region_words() };
	log!("Summing the region");
	let mut sum = 0u32;
	for w in words.iter() {
		sum = sum.wrapping_add(*w);
	}
	test_assert_eq!(sum, expected_sum(words.len()));
	Ok(())
}

/// Checks that the eviction discipline held: faults happened, and the
/// resident set never exceeded the budget.
pub fn accounting() -> TestResult {
	let stats = jumbomem::statistics().expect("library not initialized");
	let budget = jumbomem::local_page_budget().unwrap();
	let page_size = jumbomem::page_size().unwrap();
	let (_, extent) = jumbomem::region_bounds().unwrap();
	let total_pages = extent / page_size;
	log!(
		"{} major faults, {} minor faults over {total_pages} pages ({budget} local)",
		stats.major_faults,
		stats.minor_faults
	);
	// Touching more distinct pages than fit locally must have faulted at
	// least the difference
	test_assert!(stats.major_faults >= (total_pages - budget) as u64);
	Ok(())
}

/// Sums disjoint slices of the region from several threads at once.
pub fn threaded_sum(num_threads: usize) -> TestResult {
	let words = unsafe { region_words() };
	let count = words.len() / num_threads;
	log!("Summing {num_threads} disjoint slices of {count} words");
	let results: Vec<_> = std::thread::scope(|s| {
		(0..num_threads)
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
			.collect::<Vec<_>>()
			.into_iter()
			.map(|h| h.join().expect("summing thread panicked"))
			.collect()
	});
	for (t, sum) in results.into_iter().enumerate() {
		test_assert_eq!(sum, expected_partial_sum(t * count, count));
	}
	Ok(())
}

/// Reads a file into the managed region through the chunked read path.
pub fn chunked_read() -> TestResult {
	let (base, _) = jumbomem::region_bounds().unwrap();
	let base = base as *mut u8;
	// Pull pseudo-random data into the region, then verify the tail is
	// intact after the far end of the region was churned
	let len = (jumbomem::local_page_budget().unwrap() * jumbomem::page_size().unwrap()) / 2;
	let fd = unsafe { libc::open(b"/dev/urandom\0".as_ptr() as *const _, libc::O_RDONLY) };
	test_assert!(fd >= 0);
	let mut done = 0usize;
	while done < len {
		let n = unsafe {
			jumbomem::intercept::io::read(fd, base.add(done) as *mut _, len - done)
		};
		test_assert!(n > 0);
		done += n as usize;
	}
	unsafe {
		libc::close(fd);
	}
	let tail: Vec<u8> =
		unsafe { std::slice::from_raw_parts(base.add(len - 64), 64) }.to_vec();
	let words = unsafe { region_words() };
	for w in words.iter_mut().rev().take(1024) {
		*w = w.wrapping_add(1);
	}
	let after = unsafe { std::slice::from_raw_parts(base.add(len - 64), 64) };
	test_assert_eq!(after, &tail[..]);
	Ok(())
}
