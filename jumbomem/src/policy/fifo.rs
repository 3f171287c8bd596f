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

//! First-in, first-out page replacement.

use super::{Replacement, Residence};
use crate::fatal;

/// FIFO replacement: a circular array of resident page numbers and a single
/// eviction cursor.
pub struct Fifo {
	/// Resident page numbers, in load order.
	used: Vec<u32>,
	/// Maximum number of resident pages.
	total: usize,
	/// Index of the next page to evict.
	next_evict: usize,
}

impl Fifo {
	/// Creates the policy with the given page budget.
	pub fn new(total: usize) -> (Self, usize) {
		if total < 1 {
			fatal!("a minimum of one local page is needed for FIFO page replacement to function properly");
		}
		let p = Self {
			used: Vec::with_capacity(total),
			total,
			next_evict: 0,
		};
		(p, total)
	}

	/// FIFO keeps no per-page index, so a faulted page is never resident and
	/// an informational query cannot be answered.
	pub fn residence(&self, promote: bool) -> Residence {
		if promote {
			// The page faulted, and this policy never maps pages read-only
			Residence::NotResident
		} else {
			Residence::Unknown
		}
	}

	/// Victim is whatever the cursor points at; the cursor then advances.
	pub fn find_replacement(&mut self, pagenum: u32) -> Replacement {
		// New pages are mapped read/write and old pages are always considered
		// dirty
		if self.used.len() < self.total {
			self.used.push(pagenum);
			log::debug!("{}/{} pages are now in use", self.used.len(), self.total);
			return Replacement {
				new_prot: libc::PROT_READ | libc::PROT_WRITE,
				victim: None,
				clean: false,
			};
		}
		let victim = self.used[self.next_evict];
		self.used[self.next_evict] = pagenum;
		self.next_evict = (self.next_evict + 1) % self.total;
		Replacement {
			new_prot: libc::PROT_READ | libc::PROT_WRITE,
			victim: Some(victim),
			clean: false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_in_load_order() {
		let (mut p, total) = Fifo::new(3);
		assert_eq!(total, 3);
		for page in 0..3 {
			assert_eq!(p.find_replacement(page).victim, None);
		}
		// Once full, victims come back in the order pages were loaded
		for page in 3..10 {
			let r = p.find_replacement(page);
			assert_eq!(r.victim, Some(page - 3));
			assert!(!r.clean);
		}
	}

	#[test]
	fn residence_is_unknown_for_queries() {
		let (p, _) = Fifo::new(1);
		assert_eq!(p.residence(false), Residence::Unknown);
		assert_eq!(p.residence(true), Residence::NotResident);
	}
}
