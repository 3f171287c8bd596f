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

//! In-process transport backed by one-sided memory copies.
//!
//! Each peer is an anonymous mapping inside the master process. Transfers
//! complete inside `begin`; `end` only retires the handle. This is the
//! loopback equivalent of a one-sided put/get transport and is what the
//! self-test harness runs against.

use super::{Handle, PageLocation, Transport};
use crate::fatal;
use memmap2::MmapMut;
use std::{
	cell::UnsafeCell,
	ptr,
	sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed},
};

/// Maximum outstanding operations of each kind.
const MAX_PENDING: usize = 2;

/// One peer's memory.
struct PeerBuf(UnsafeCell<MmapMut>);

/// In-process loopback transport.
pub struct MemTransport {
	/// Per-peer backing memory.
	peers: Vec<PeerBuf>,
	/// Bytes contributed by each peer.
	peer_bytes: usize,
	/// Outstanding fetches.
	pending_fetches: AtomicUsize,
	/// Outstanding evictions.
	pending_evicts: AtomicUsize,
	/// Handle generator.
	next_handle: AtomicU64,
}

// Accesses to peer memory are serialized by the mega-lock
unsafe impl Send for MemTransport {}
unsafe impl Sync for MemTransport {}

impl MemTransport {
	/// Creates `peer_count` peers, each contributing `peer_bytes` bytes.
	pub fn new(peer_count: usize, peer_bytes: usize) -> std::io::Result<Self> {
		let mut peers = Vec::with_capacity(peer_count);
		for _ in 0..peer_count {
			peers.push(PeerBuf(UnsafeCell::new(MmapMut::map_anon(peer_bytes)?)));
		}
		Ok(Self {
			peers,
			peer_bytes,
			pending_fetches: AtomicUsize::new(0),
			pending_evicts: AtomicUsize::new(0),
			next_handle: AtomicU64::new(1),
		})
	}

	/// Returns a pointer into the given peer's memory, after bounds checks.
	fn peer_ptr(&self, loc: PageLocation, len: usize) -> *mut u8 {
		if loc.peer >= self.peers.len() {
			fatal!("internal error: peer {} does not exist", loc.peer);
		}
		if loc.offset + len > self.peer_bytes {
			fatal!(
				"internal error: offset {} + {len} overruns a peer contributing {} bytes",
				loc.offset,
				self.peer_bytes
			);
		}
		let map = unsafe { &mut *self.peers[loc.peer].0.get() };
		unsafe { map.as_mut_ptr().add(loc.offset) }
	}
}

impl Transport for MemTransport {
	fn peer_count(&self) -> usize {
		self.peers.len()
	}

	fn peer_bytes(&self) -> usize {
		self.peer_bytes
	}

	unsafe fn fetch_begin(&self, loc: PageLocation, buf: *mut u8, len: usize) -> Handle {
		if self.pending_fetches.fetch_add(1, Relaxed) >= MAX_PENDING {
			fatal!("internal error: too many outstanding page fetches");
		}
		log::debug!("fetching the page at peer {} offset {:#x}", loc.peer, loc.offset);
		ptr::copy_nonoverlapping(self.peer_ptr(loc, len), buf, len);
		Handle(self.next_handle.fetch_add(1, Relaxed))
	}

	unsafe fn fetch_end(&self, _handle: Handle) {
		self.pending_fetches.fetch_sub(1, Relaxed);
	}

	unsafe fn evict_begin(&self, loc: PageLocation, buf: *const u8, len: usize) -> Handle {
		if self.pending_evicts.fetch_add(1, Relaxed) >= MAX_PENDING {
			fatal!("internal error: too many outstanding page evictions");
		}
		log::debug!("evicting the page to peer {} offset {:#x}", loc.peer, loc.offset);
		ptr::copy_nonoverlapping(buf, self.peer_ptr(loc, len), len);
		Handle(self.next_handle.fetch_add(1, Relaxed))
	}

	unsafe fn evict_end(&self, _handle: Handle) {
		self.pending_evicts.fetch_sub(1, Relaxed);
	}

	fn overlaps(&self, base: usize, extent: usize) -> bool {
		self.peers.iter().any(|p| {
			let start = unsafe { &*p.0.get() }.as_ptr() as usize;
			start < base + extent && start + self.peer_bytes > base
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_page() {
		let t = MemTransport::new(2, 8192).unwrap();
		let loc = PageLocation {
			peer: 1,
			offset: 4096,
		};
		let sent: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
		let mut received = vec![0u8; 4096];
		unsafe {
			let h = t.evict_begin(loc, sent.as_ptr(), 4096);
			t.evict_end(h);
			let h = t.fetch_begin(loc, received.as_mut_ptr(), 4096);
			t.fetch_end(h);
		}
		assert_eq!(sent, received);
	}

	#[test]
	fn peers_are_disjoint() {
		let t = MemTransport::new(2, 4096).unwrap();
		let a = PageLocation {
			peer: 0,
			offset: 0,
		};
		let b = PageLocation {
			peer: 1,
			offset: 0,
		};
		let ones = vec![1u8; 4096];
		let twos = vec![2u8; 4096];
		let mut back = vec![0u8; 4096];
		unsafe {
			t.evict_end(t.evict_begin(a, ones.as_ptr(), 4096));
			t.evict_end(t.evict_begin(b, twos.as_ptr(), 4096));
			t.fetch_end(t.fetch_begin(a, back.as_mut_ptr(), 4096));
		}
		assert_eq!(back, ones);
	}

	#[test]
	fn no_peers_condition() {
		let t = MemTransport::new(0, 0).unwrap();
		assert_eq!(t.peer_count(), 0);
	}
}
