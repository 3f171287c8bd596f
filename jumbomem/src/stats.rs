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

//! Fault-path statistics and the heartbeat.

use crate::util;
use std::mem;

/// A page delta beyond this many pages is tallied as unpredictable.
const MAX_PAGE_DELTA: i64 = 4;

/// Returns the process's major-fault count so far.
fn major_faults_os() -> i64 {
	let mut usage: libc::rusage = unsafe { mem::zeroed() };
	unsafe {
		libc::getrusage(libc::RUSAGE_SELF, &mut usage);
	}
	usage.ru_majflt as i64
}

/// Counters kept by the fault path. All updates happen under the mega-lock.
pub struct Stats {
	/// Major faults serviced by the library.
	pub major_faults: u64,
	/// Minor faults (permission promotions).
	pub minor_faults: u64,
	/// Total, minimum and maximum time spent servicing a major fault.
	pub total_fault_us: u64,
	pub min_fault_us: u64,
	pub max_fault_us: u64,
	/// Prefetches whose data was used / discarded.
	pub good_prefetches: u64,
	pub bad_prefetches: u64,
	/// Pages pushed to and pulled from peers.
	pub pages_sent: u64,
	pub pages_received: u64,
	/// Evictions that needed no communication.
	pub clean_evictions: u64,
	/// Tallies of deltas between consecutive faulted pages; the middle slot
	/// collects the unpredictable ones.
	deltas: [u64; (MAX_PAGE_DELTA * 2 + 1) as usize],
	/// How often the delta matched / differed from the previous delta.
	predictable_deltas: u64,
	unpredictable_deltas: u64,
	prev_fault_page: i64,
	prev_delta: i64,
	/// Heartbeat interval in seconds, if enabled.
	heartbeat_s: Option<u64>,
	first_heartbeat_s: u64,
	last_heartbeat_s: u64,
	/// OS-level major faults at initialization.
	initial_majflt: i64,
}

impl Stats {
	/// Creates the counters, arming the heartbeat if configured.
	pub fn new(heartbeat_s: Option<u64>) -> Self {
		let now_s = util::current_time_us() / 1_000_000;
		Self {
			major_faults: 0,
			minor_faults: 0,
			total_fault_us: 0,
			min_fault_us: u64::MAX,
			max_fault_us: 0,
			good_prefetches: 0,
			bad_prefetches: 0,
			pages_sent: 0,
			pages_received: 0,
			clean_evictions: 0,
			deltas: Default::default(),
			predictable_deltas: 0,
			unpredictable_deltas: 0,
			prev_fault_page: 0,
			prev_delta: 0,
			heartbeat_s,
			first_heartbeat_s: now_s,
			last_heartbeat_s: now_s,
			initial_majflt: major_faults_os(),
		}
	}

	/// Accounts the time one major fault took.
	pub fn record_fault_time(&mut self, us: u64) {
		self.total_fault_us += us;
		self.min_fault_us = self.min_fault_us.min(us);
		self.max_fault_us = self.max_fault_us.max(us);
	}

	/// Tracks how predictable the fault stream is.
	pub fn record_delta(&mut self, fault_page: i64) {
		let delta = fault_page - self.prev_fault_page;
		if (-MAX_PAGE_DELTA..=MAX_PAGE_DELTA).contains(&delta) {
			self.deltas[(delta + MAX_PAGE_DELTA) as usize] += 1;
		} else {
			self.deltas[MAX_PAGE_DELTA as usize] += 1;
		}
		if delta == self.prev_delta {
			self.predictable_deltas += 1;
		} else {
			self.unpredictable_deltas += 1;
		}
		self.prev_fault_page = fault_page;
		self.prev_delta = delta;
	}

	/// Prints a status line when the heartbeat interval elapsed.
	pub fn maybe_heartbeat(&mut self, now_us: u64) {
		let Some(interval) = self.heartbeat_s else {
			return;
		};
		let now_s = now_us / 1_000_000;
		if now_s - self.last_heartbeat_s <= interval {
			return;
		}
		self.last_heartbeat_s = now_s;
		log::info!(
			"major faults after {} seconds: {} OS, {} JumboMem",
			self.last_heartbeat_s - self.first_heartbeat_s,
			major_faults_os() - self.initial_majflt,
			self.major_faults
		);
	}

	/// Prints the end-of-run statistics.
	pub fn report(&self, page_size: usize, prefetching: bool) {
		log::info!(
			"total number of JumboMem page faults: {} major, {} minor",
			self.major_faults,
			self.minor_faults
		);
		if self.major_faults > 0 {
			log::info!(
				"JumboMem major-fault handling time (min/mean/max usecs): {} {} {}",
				self.min_fault_us,
				self.total_fault_us / self.major_faults,
				self.max_fault_us
			);
		}
		if self.total_fault_us > 0 {
			let bytes = page_size as u64 * (self.pages_sent + self.pages_received);
			log::info!(
				"mean JumboMem major-fault handling rate: {:.1} MB/s",
				1e6 * bytes as f64 / (self.total_fault_us as f64 * 1048576.0)
			);
		}
		if prefetching {
			log::info!(
				"useful prefetches: {}; wasted prefetches: {}",
				self.good_prefetches,
				self.bad_prefetches
			);
		}
		log::info!(
			"evictions of clean pages: {}; evictions of dirty pages: {}",
			self.clean_evictions,
			self.pages_sent
		);
		log::info!(
			"total communication: {} pages sent and {} pages received",
			self.pages_sent,
			self.pages_received
		);
		log::info!("fault deltas:");
		let mid = MAX_PAGE_DELTA as usize;
		for i in 1..=mid {
			log::info!("   +/- {i} page(s): {} faults", self.deltas[mid + i] + self.deltas[mid - i]);
		}
		log::info!("   +/- other:     {} faults", self.deltas[mid]);
		let total = self.predictable_deltas + self.unpredictable_deltas;
		if total != 0 {
			log::info!(
				"trivially predictable fault deltas: {:.1}%",
				100.0 * self.predictable_deltas as f64 / total as f64
			);
		}
	}
}

/// A read-only copy of the counters, for callers outside the library.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
	pub major_faults: u64,
	pub minor_faults: u64,
	pub good_prefetches: u64,
	pub bad_prefetches: u64,
	pub pages_sent: u64,
	pub pages_received: u64,
	pub clean_evictions: u64,
}

impl From<&Stats> for StatsSnapshot {
	fn from(s: &Stats) -> Self {
		Self {
			major_faults: s.major_faults,
			minor_faults: s.minor_faults,
			good_prefetches: s.good_prefetches,
			bad_prefetches: s.bad_prefetches,
			pages_sent: s.pages_sent,
			pages_received: s.pages_received,
			clean_evictions: s.clean_evictions,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delta_histogram() {
		let mut s = Stats::new(None);
		// A strictly increasing one-page stride is fully predictable after
		// the first two faults
		for page in 0..10 {
			s.record_delta(page);
		}
		assert_eq!(s.deltas[(MAX_PAGE_DELTA + 1) as usize], 9);
		assert!(s.predictable_deltas >= 8);
		// A wild jump lands in the middle bucket, shared with delta zero
		// (which the very first fault produced)
		s.record_delta(1000);
		assert_eq!(s.deltas[MAX_PAGE_DELTA as usize], 2);
	}

	#[test]
	fn fault_times() {
		let mut s = Stats::new(None);
		s.record_fault_time(10);
		s.record_fault_time(30);
		s.record_fault_time(20);
		assert_eq!(s.min_fault_us, 10);
		assert_eq!(s.max_fault_us, 30);
		assert_eq!(s.total_fault_us, 60);
	}
}
