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

//! Utility features.

use std::error::Error;

pub struct TestError(pub String);

impl<E: Error> From<E> for TestError {
	fn from(err: E) -> Self {
		TestError(err.to_string())
	}
}

/// Result of a test.
pub type TestResult = Result<(), TestError>;

/// Test assertion.
#[macro_export]
macro_rules! test_assert {
	($predicate:expr) => {{
		let pred = ($predicate);
		if !pred {
			return Err($crate::util::TestError(format!(
				"Assertion failed: {}",
				stringify!($predicate)
			)));
		}
	}};
}

/// Test assertion with comparison.
#[macro_export]
macro_rules! test_assert_eq {
	($a:expr, $b:expr) => {{
		let a = ($a);
		let b = ($b);
		if a != b {
			return Err($crate::util::TestError(format!(
				"Assertion failed\n\tleft: `{:?}`\n\tright: `{:?}`",
				a, b
			)));
		}
	}};
}

/// Prints a log.
#[macro_export]
macro_rules! log {
	($($arg:tt)*) => {{
		println!("[LOG] {}", format_args!($($arg)*));
	}};
}

/// The managed region as a slice of 32-bit words.
///
/// # Safety
///
/// The library must be initialized; every access may fault and page.
pub unsafe fn region_words() -> &'static mut [u32] {
	let (base, extent) = jumbomem::region_bounds().expect("library not initialized");
	std::slice::from_raw_parts_mut(base as *mut u32, extent / 4)
}

/// The sum the self-test expects after writing `i + 1` into each of `n`
/// words, in wrapping arithmetic.
pub fn expected_sum(n: usize) -> u32 {
	// n(n+1)/2, truncated to the word width
	(n as u128 * (n as u128 + 1) / 2) as u32
}

/// The wrapping sum of `i + 1` for `i` in `[first, first+count)`.
pub fn expected_partial_sum(first: usize, count: usize) -> u32 {
	expected_sum(first + count).wrapping_sub(expected_sum(first))
}
