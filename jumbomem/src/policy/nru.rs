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

//! Not-recently-used page replacement.
//!
//! Every resident page carries a referenced bit and a modified bit, forming
//! four classes. Eviction picks a random page from the smallest-numbered
//! non-empty class. The referenced bits decay periodically so that old
//! activity stops protecting a page.
//!
//! The class-sorted side index is rebuilt lazily: selection first trusts it,
//! and only re-sorts (one O(N) bucket sort) when the picked entry turns out to
//! be of the wrong class.

use super::{Replacement, Residence};
use crate::{config::Config, fatal, pagetable::PageTable, util};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::mem;

/// Per-page NRU state.
#[derive(Clone, Copy, Default)]
pub struct NruFlags {
	/// The page has been referenced.
	referenced: bool,
	/// The page has been modified.
	modified: bool,
}

impl NruFlags {
	/// The page's NRU class, 0..=3.
	fn class(self) -> usize {
		(self.referenced as usize) * 2 + self.modified as usize
	}
}

/// Not-recently-used replacement.
pub struct Nru {
	/// Resident pages with their reference/modify bits.
	table: PageTable<NruFlags>,
	/// Slot indices, bucket-sorted by class when `sorted` is set.
	by_class: Vec<u32>,
	/// Whether `by_class` reflects the current flags.
	sorted: bool,
	/// Number of resident pages in each class.
	class_size: [usize; 4],
	/// Whether newly loaded pages are mapped read/write rather than
	/// read-only.
	readwrite: bool,
	/// Milliseconds between reference-bit clears.
	interval_ms: u64,
	/// Time of the last reference-bit clear, in milliseconds.
	last_clear_ms: u64,
	/// Evictions per class, reported at finalization.
	class_evictions: [u64; 4],
	rng: SmallRng,
}

impl Nru {
	/// Creates the policy with the given page budget.
	///
	/// The budget is shaved to pay for the per-page bookkeeping unless the
	/// user pinned it explicitly.
	pub fn new(config: &Config, local_pages: usize, seed: u64) -> (Self, usize) {
		let per_entry = mem::size_of::<NruFlags>() + PER_ENTRY_INDEX_BYTES;
		let total = if config.local_pages_env {
			local_pages
		} else {
			let shaved =
				crate::pagetable::shaved_capacity(local_pages, config.page_size, per_entry);
			log::debug!(
				"reducing the number of locally cacheable pages from {local_pages} to {shaved} to accommodate NRU data"
			);
			shaved
		};
		if total < 1 {
			fatal!("a minimum of one local page is needed for NRU page replacement to function properly");
		}
		log::info!(
			"NRU reference bits will be cleared every {} milliseconds; newly loaded pages will be marked {}",
			config.nru_interval_ms,
			if config.nru_readwrite { "read/write" } else { "read-only" }
		);
		let p = Self {
			table: PageTable::new(total),
			by_class: Vec::with_capacity(total),
			sorted: false,
			class_size: [0; 4],
			readwrite: config.nru_readwrite,
			interval_ms: config.nru_interval_ms,
			last_clear_ms: util::current_time_ms(),
			class_evictions: [0; 4],
			rng: SmallRng::seed_from_u64(seed),
		};
		(p, total)
	}

	/// Clears all reference bits once per interval.
	fn maybe_clear_reference_bits(&mut self) {
		let now = util::current_time_ms();
		if now.saturating_sub(self.last_clear_ms) < self.interval_ms {
			return;
		}
		log::debug!("resetting all NRU reference bits");
		let mut sizes = [0usize; 4];
		self.table.for_each_mut(|_, flags| {
			flags.referenced = false;
			sizes[flags.class()] += 1;
		});
		self.class_size = sizes;
		self.sorted = false;
		self.last_clear_ms = now;
	}

	/// Rebuilds `by_class` with a bucket sort over the dense slot space.
	fn sort_by_class(&mut self) {
		if self.sorted {
			return;
		}
		let used = self.table.used();
		let mut sizes = [0usize; 4];
		for slot in 0..used {
			let (_, flags) = self.table.at(slot);
			sizes[flags.class()] += 1;
		}
		let mut offsets = [0usize; 4];
		offsets[1] = sizes[0];
		offsets[2] = offsets[1] + sizes[1];
		offsets[3] = offsets[2] + sizes[2];
		self.by_class.resize(used, 0);
		for slot in 0..used {
			let (_, flags) = self.table.at(slot);
			let class = flags.class();
			self.by_class[offsets[class]] = slot as u32;
			offsets[class] += 1;
		}
		self.class_size = sizes;
		self.sorted = true;
	}

	/// Says whether `pagenum` is resident.
	///
	/// A promoting query comes from a write fault on a read-only page: the
	/// page moves to class 3 and gains write access.
	pub fn residence(&mut self, pagenum: u32, promote: bool) -> Residence {
		self.maybe_clear_reference_bits();
		let Some(flags) = self.table.find_mut(pagenum) else {
			return Residence::NotResident;
		};
		if promote {
			let old_class = flags.class();
			flags.referenced = true;
			flags.modified = true;
			let new_class = flags.class();
			if new_class != old_class {
				self.class_size[old_class] -= 1;
				self.class_size[new_class] += 1;
				self.sorted = false;
			}
		}
		Residence::Resident(libc::PROT_READ | libc::PROT_WRITE)
	}

	/// Picks a victim from the smallest-numbered non-empty class.
	pub fn find_replacement(&mut self, pagenum: u32) -> Replacement {
		self.maybe_clear_reference_bits();
		let mut victim = None;
		let mut clean = false;
		if self.table.used() >= self.table.capacity() {
			let class = (0..4)
				.find(|c| self.class_size[*c] > 0)
				.unwrap_or_else(|| fatal!("internal error: no NRU class has any page"));
			// by_class is probably still sorted, in which case the target
			// class starts at offset zero. Trust it first; sort and retry
			// once on a stale pick.
			let offset = self.rng.gen_range(0..self.class_size[class]);
			let mut slot = self.by_class.get(offset).copied().unwrap_or(0) as usize;
			let stale = !self.sorted || {
				let (_, flags) = self.table.at(slot);
				flags.class() != class
			};
			if stale {
				self.sort_by_class();
				slot = self.by_class[offset] as usize;
			}
			let (victim_page, flags) = self.table.at(slot);
			let flags = *flags;
			clean = !flags.modified;
			self.class_size[class] -= 1;
			self.class_evictions[class] += 1;
			log::debug!(
				"replacing page {} of {} (a class {class} page)",
				victim_page + 1,
				self.table.capacity()
			);
			self.table.delete(victim_page);
			victim = Some(victim_page);
		} else {
			self.by_class.push(self.table.used() as u32);
			log::debug!("{}/{} pages are now in use", self.table.used() + 1, self.table.capacity());
		}
		// Track the incoming page; the detached slot (if any) is recycled so
		// by_class stays consistent
		let flags = NruFlags {
			referenced: true,
			modified: self.readwrite,
		};
		self.class_size[flags.class()] += 1;
		self.table.insert(pagenum, flags);
		self.sorted = false;
		Replacement {
			new_prot: if self.readwrite {
				libc::PROT_READ | libc::PROT_WRITE
			} else {
				libc::PROT_READ
			},
			victim,
			clean,
		}
	}

	/// Reports evictions by class.
	pub fn report(&self) {
		log::info!("evictions by NRU class:");
		log::info!("   class 0 (unreferenced, unmodified): {}", self.class_evictions[0]);
		log::info!("   class 1 (unreferenced, modified):   {}", self.class_evictions[1]);
		log::info!("   class 2 (referenced, unmodified):   {}", self.class_evictions[2]);
		log::info!("   class 3 (referenced, modified):     {}", self.class_evictions[3]);
	}
}

/// Estimated index bytes per resident page beyond the flags themselves (hash
/// index entry plus the class-sorted slot).
const PER_ENTRY_INDEX_BYTES: usize = 28;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn nru(total: usize, readwrite: bool) -> Nru {
		let config = Config {
			nru_readwrite: readwrite,
			// Long enough that tests never see a decay
			nru_interval_ms: u64::MAX / 2,
			local_pages_env: true,
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
			heartbeat_s: None,
			freeze_timeout_ms: 1000,
			freeze_fatal: true,
			slave_mem: None,
			master_mem: None,
			reduce_mem: false,
			base_addr: Default::default(),
			expected_rank: 0,
		};
		Nru::new(&config, total, 3).0
	}

	#[test]
	fn readwrite_pages_are_class_three() {
		let mut p = nru(2, true);
		let r = p.find_replacement(0);
		assert_eq!(r.new_prot, libc::PROT_READ | libc::PROT_WRITE);
		assert_eq!(r.victim, None);
		assert_eq!(p.class_size, [0, 0, 0, 1]);
	}

	#[test]
	fn readonly_mode_promotes_on_write() {
		let mut p = nru(2, false);
		let r = p.find_replacement(0);
		assert_eq!(r.new_prot, libc::PROT_READ);
		// Loaded read-only: referenced but not modified (class 2)
		assert_eq!(p.class_size, [0, 0, 1, 0]);
		// A write fault on the resident page promotes it to class 3
		let res = p.residence(0, true);
		assert_eq!(res, Residence::Resident(libc::PROT_READ | libc::PROT_WRITE));
		assert_eq!(p.class_size, [0, 0, 0, 1]);
	}

	#[test]
	fn evicts_from_lowest_class() {
		let mut p = nru(4, false);
		for page in 0..4 {
			p.find_replacement(page);
		}
		// Promote pages 0 and 1 to class 3; pages 2 and 3 stay in class 2
		p.residence(0, true);
		p.residence(1, true);
		// The next eviction must come from class 2
		let victim = p.find_replacement(10).victim.unwrap();
		assert!(victim == 2 || victim == 3);
		// Unmodified pages are clean
		assert!(p.find_replacement(11).clean);
	}

	#[test]
	fn clean_tracking_follows_modified_bit() {
		let mut p = nru(2, true);
		p.find_replacement(0);
		p.find_replacement(1);
		// Both pages were loaded read/write, so both are dirty
		let r = p.find_replacement(2);
		assert!(!r.clean);
	}

	#[test]
	fn reference_decay_reshuffles_classes() {
		let mut p = nru(2, true);
		p.find_replacement(0);
		p.find_replacement(1);
		assert_eq!(p.class_size, [0, 0, 0, 2]);
		p.interval_ms = 0;
		p.maybe_clear_reference_bits();
		// Referenced bits dropped: class 3 becomes class 1
		assert_eq!(p.class_size, [0, 2, 0, 0]);
	}
}
