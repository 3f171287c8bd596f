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

//! Uniform random page replacement.

use super::{Replacement, Residence};
use crate::fatal;
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Random replacement over the dense set of resident pages.
pub struct Random {
	/// Resident page numbers.
	used: Vec<u32>,
	/// Maximum number of resident pages.
	total: usize,
	/// Most recently loaded page, excluded from selection to avoid an
	/// immediate re-fetch.
	prev_page: Option<u32>,
	rng: SmallRng,
}

impl Random {
	/// Creates the policy with the given page budget.
	pub fn new(total: usize, seed: u64) -> (Self, usize) {
		if total < 2 {
			fatal!("a minimum of two local pages is needed for random page replacement to function properly");
		}
		let p = Self {
			used: Vec::with_capacity(total),
			total,
			prev_page: None,
			rng: SmallRng::seed_from_u64(seed),
		};
		(p, total)
	}

	/// Random keeps no per-page index, so a faulted page is never resident
	/// and an informational query cannot be answered.
	pub fn residence(&self, promote: bool) -> Residence {
		if promote {
			Residence::NotResident
		} else {
			Residence::Unknown
		}
	}

	/// Picks a victim uniformly at random, rejecting the most recently loaded
	/// page.
	pub fn find_replacement(&mut self, pagenum: u32) -> Replacement {
		if self.used.len() < self.total {
			self.used.push(pagenum);
			self.prev_page = Some(pagenum);
			log::debug!("{}/{} pages are now in use", self.used.len(), self.total);
			return Replacement {
				new_prot: libc::PROT_READ | libc::PROT_WRITE,
				victim: None,
				clean: false,
			};
		}
		let (slot, victim) = loop {
			let slot = self.rng.gen_range(0..self.used.len());
			let victim = self.used[slot];
			if Some(victim) != self.prev_page {
				break (slot, victim);
			}
		};
		log::debug!("replacing page {} of {}", slot + 1, self.total);
		self.used[slot] = pagenum;
		self.prev_page = Some(pagenum);
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
	fn never_evicts_most_recent() {
		let (mut p, _) = Random::new(2, 42);
		assert_eq!(p.find_replacement(100).victim, None);
		assert_eq!(p.find_replacement(200).victim, None);
		// With two pages, the victim is forced to be the older one
		assert_eq!(p.find_replacement(0).victim, Some(100));
		assert_eq!(p.find_replacement(1).victim, Some(200));
		for page in 2..50 {
			assert_eq!(p.find_replacement(page).victim, Some(page - 2));
		}
	}

	#[test]
	fn victims_are_resident_pages() {
		let (mut p, _) = Random::new(8, 7);
		let mut resident: Vec<u32> = (0..8).collect();
		for page in 0..8 {
			p.find_replacement(page);
		}
		for page in 8..100 {
			let victim = p.find_replacement(page).victim.unwrap();
			let idx = resident.iter().position(|p| *p == victim).unwrap();
			resident[idx] = page;
		}
	}
}
