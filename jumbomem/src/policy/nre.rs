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

//! Not-recently-evicted page replacement.
//!
//! Like random replacement, but a bounded queue remembers the slots of recent
//! victims and a candidate found in the queue is retried a bounded number of
//! times. The final candidate is accepted regardless, so selection always
//! terminates.

use super::{Replacement, Residence};
use crate::{config::Config, fatal, pagetable::PageTable};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::collections::VecDeque;

/// Not-recently-evicted replacement.
pub struct Nre {
	/// Resident pages.
	table: PageTable<()>,
	/// Dense slot indices of recent victims.
	recent: VecDeque<u32>,
	/// Number of entries in a full queue.
	queue_len: usize,
	/// Number of times to retry a bad selection.
	max_retries: usize,
	rng: SmallRng,
}

impl Nre {
	/// Creates the policy with the given page budget.
	///
	/// The budget is shaved to pay for the page table unless the user pinned
	/// it explicitly.
	pub fn new(config: &Config, local_pages: usize, seed: u64) -> (Self, usize) {
		let total = if config.local_pages_env {
			local_pages
		} else {
			let shaved = crate::pagetable::shaved_capacity(
				local_pages,
				config.page_size,
				PER_ENTRY_BYTES,
			);
			log::debug!(
				"reducing the number of locally cacheable pages from {local_pages} to {shaved} to accommodate a page table"
			);
			shaved
		};
		if total < 2 {
			fatal!("a minimum of two local pages is needed for NRE page replacement to function properly");
		}
		log::info!(
			"JumboMem will keep track of the most recent {} evictions; poor selections will be retried {} times",
			config.nre_entries,
			config.nre_retries
		);
		let p = Self {
			table: PageTable::new(total),
			recent: VecDeque::with_capacity(config.nre_entries + 1),
			queue_len: config.nre_entries,
			max_retries: config.nre_retries,
			rng: SmallRng::seed_from_u64(seed),
		};
		(p, total)
	}

	/// A resident page always has read/write protection.
	pub fn residence(&self, pagenum: u32) -> Residence {
		if self.table.find(pagenum).is_some() {
			Residence::Resident(libc::PROT_READ | libc::PROT_WRITE)
		} else {
			Residence::NotResident
		}
	}

	/// Picks a random victim, retrying selections that were recently evicted.
	pub fn find_replacement(&mut self, pagenum: u32) -> Replacement {
		let prot = libc::PROT_READ | libc::PROT_WRITE;
		if self.table.used() < self.table.capacity() {
			self.table.insert(pagenum, ());
			log::debug!("{}/{} pages are now in use", self.table.used(), self.table.capacity());
			return Replacement {
				new_prot: prot,
				victim: None,
				clean: false,
			};
		}
		let mut retries = 0;
		let (slot, victim) = loop {
			let slot = self.rng.gen_range(0..self.table.used()) as u32;
			let (victim, _) = self.table.at(slot as usize);
			if !self.recent.contains(&slot) || retries >= self.max_retries {
				break (slot, victim);
			}
			retries += 1;
			log::trace!("page {victim} was recently evicted, selecting alternate #{retries}");
		};
		if self.queue_len > 0 {
			self.recent.push_back(slot);
			if self.recent.len() > self.queue_len {
				self.recent.pop_front();
			}
		}
		log::debug!("replacing page {} of {}", slot + 1, self.table.capacity());
		self.table.delete(victim);
		self.table.insert(pagenum, ());
		Replacement {
			new_prot: prot,
			victim: Some(victim),
			clean: false,
		}
	}
}

/// Estimated bookkeeping bytes per resident page (table entry plus hash
/// index).
const PER_ENTRY_BYTES: usize = 24;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn test_config(entries: usize, retries: usize) -> Config {
		Config {
			nre_entries: entries,
			nre_retries: retries,
			local_pages_env: true,
			page_size: 4096,
			..test_defaults()
		}
	}

	fn test_defaults() -> Config {
		Config {
			debug: 0,
			os_page_size: 4096,
			page_size: 4096,
			prefetch: Default::default(),
			async_evict: false,
			extra_memcpy: false,
			mlock: false,
			policy: Default::default(),
			nre_entries: 32,
			nre_retries: 5,
			nru_interval_ms: 5000,
			nru_readwrite: true,
			heartbeat_s: None,
			freeze_timeout_ms: 1000,
			freeze_fatal: true,
			slave_mem: None,
			master_mem: None,
			local_pages_env: false,
			reduce_mem: false,
			base_addr: Default::default(),
			expected_rank: 0,
		}
	}

	#[test]
	fn tracks_residence() {
		let (mut p, _) = Nre::new(&test_config(4, 2), 4, 1);
		assert_eq!(p.residence(7), Residence::NotResident);
		p.find_replacement(7);
		assert_eq!(
			p.residence(7),
			Residence::Resident(libc::PROT_READ | libc::PROT_WRITE)
		);
	}

	#[test]
	fn avoids_recent_victims() {
		// A queue long enough to remember every slot, so consecutive victims
		// must come from different slots until retries are exhausted
		let (mut p, _) = Nre::new(&test_config(16, 1000), 16, 3);
		for page in 0..16 {
			p.find_replacement(page);
		}
		let mut victims = Vec::new();
		for page in 16..24 {
			victims.push(p.find_replacement(page).victim.unwrap());
		}
		// No page can be evicted twice here: every victim was just reloaded,
		// and its slot sits in the recent queue
		let mut dedup = victims.clone();
		dedup.sort_unstable();
		dedup.dedup();
		assert_eq!(dedup.len(), victims.len());
	}

	#[test]
	fn accepts_final_candidate_when_queue_saturated() {
		// With a queue remembering everything and no retries allowed, the
		// first candidate is always accepted; selection must still terminate
		let (mut p, _) = Nre::new(&test_config(64, 0), 4, 9);
		for page in 0..4 {
			p.find_replacement(page);
		}
		for page in 4..40 {
			assert!(p.find_replacement(page).victim.is_some());
		}
	}
}
