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

//! Page-replacement policies.
//!
//! All policies answer the same two questions under the mega-lock: is this
//! page resident, and which resident page should make room for a faulted one.
//! Per-policy private state lives in the variant.

mod fifo;
mod nre;
mod nru;
mod random;

use crate::{
	config::{Config, PolicyKind},
	util,
};
pub use fifo::Fifo;
pub use nre::Nre;
pub use nru::Nru;
pub use random::Random;

/// Answer to a residence query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Residence {
	/// The page is resident; on promotion, install the given protection.
	Resident(i32),
	/// The page is not resident.
	NotResident,
	/// The policy cannot answer; prefetching must stay disabled.
	Unknown,
}

/// Outcome of a replacement decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Replacement {
	/// Protection to install on the incoming page.
	pub new_prot: i32,
	/// Page number of the victim, or `None` while the cache is not yet full.
	pub victim: Option<u32>,
	/// Whether the victim may be dropped without writing it back.
	pub clean: bool,
}

/// A page-replacement policy instance.
///
/// The set of variants is closed; dispatch is a plain `match`.
pub enum Policy {
	/// First-in, first-out.
	Fifo(Fifo),
	/// Uniform random.
	Random(Random),
	/// Not-recently-evicted.
	Nre(Nre),
	/// Not-recently-used.
	Nru(Nru),
}

impl Policy {
	/// Creates the policy selected by `config`, sized for `local_pages`.
	///
	/// Policies that keep per-page bookkeeping shave the budget to make room
	/// for it, unless the user pinned the page count explicitly. Returns the
	/// policy and the final budget.
	pub fn new(config: &Config, local_pages: usize) -> (Self, usize) {
		let seed = (unsafe { libc::getpid() } as u64).wrapping_mul(util::current_time_us());
		match config.policy {
			PolicyKind::Fifo => {
				let (p, n) = Fifo::new(local_pages);
				(Self::Fifo(p), n)
			}
			PolicyKind::Random => {
				let (p, n) = Random::new(local_pages, seed);
				(Self::Random(p), n)
			}
			PolicyKind::Nre => {
				let (p, n) = Nre::new(config, local_pages, seed);
				(Self::Nre(p), n)
			}
			PolicyKind::Nru => {
				let (p, n) = Nru::new(config, local_pages, seed);
				(Self::Nru(p), n)
			}
		}
	}

	/// Says whether `pagenum` is resident.
	///
	/// With `promote` set, the query is on behalf of a fault on that page:
	/// the policy may update its bookkeeping and the returned protection is
	/// what the fault handler must install. Without it, the query is purely
	/// informational (prefetch candidacy, region touching).
	pub fn residence(&mut self, pagenum: u32, promote: bool) -> Residence {
		match self {
			Self::Fifo(p) => p.residence(promote),
			Self::Random(p) => p.residence(promote),
			Self::Nre(p) => p.residence(pagenum),
			Self::Nru(p) => p.residence(pagenum, promote),
		}
	}

	/// Chooses a victim for a miss on `pagenum` and records the page as
	/// resident.
	///
	/// Called exactly once per miss, under the mega-lock.
	pub fn find_replacement(&mut self, pagenum: u32) -> Replacement {
		match self {
			Self::Fifo(p) => p.find_replacement(pagenum),
			Self::Random(p) => p.find_replacement(pagenum),
			Self::Nre(p) => p.find_replacement(pagenum),
			Self::Nru(p) => p.find_replacement(pagenum),
		}
	}

	/// Whether the policy answers residence queries precisely enough for
	/// prefetching to work.
	pub fn supports_prefetch(&self) -> bool {
		matches!(self, Self::Nru(_))
	}

	/// The policy's name, for diagnostics.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Fifo(_) => "fifo",
			Self::Random(_) => "random",
			Self::Nre(_) => "nre",
			Self::Nru(_) => "nru",
		}
	}

	/// Reports end-of-run policy statistics.
	pub fn report(&self) {
		if let Self::Nru(p) = self {
			p.report();
		}
	}
}
