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

//! Peer-node transport interface.
//!
//! A transport moves fixed-size pages between the master and the peer that
//! owns a given offset. Both operations are split-phase: `begin` starts the
//! transfer and returns a handle, `end` blocks until it completed. The fault
//! handler caps outstanding operations at two of each kind.
//!
//! A transport must never place memory inside the managed region; the
//! bootstrap verifies this once the region is reserved. An implementation may
//! keep its peers' memory warm (for instance by touching pages while idle),
//! but that is an implementation choice, not part of the contract.

mod mem;

pub use mem::MemTransport;

/// The home of a page: which peer stores it, and where.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageLocation {
	/// Peer index, in `0..peer_count`.
	pub peer: usize,
	/// Byte offset into the peer's contribution.
	pub offset: usize,
}

/// Opaque token for a split-phase operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle(pub u64);

/// A page mover between the master and its peers.
///
/// All calls are made under the mega-lock, so implementations need not
/// serialize against each other, only against their own peers.
pub trait Transport: Send + Sync {
	/// The number of cooperating peers. Zero signals the "no peers"
	/// condition: the library collapses to its local-only mode.
	fn peer_count(&self) -> usize;

	/// The number of bytes each peer contributes.
	fn peer_bytes(&self) -> usize;

	/// Starts fetching one page from `loc` into `buf`.
	///
	/// # Safety
	///
	/// `buf` must stay valid and unread until the matching
	/// [`Transport::fetch_end`].
	unsafe fn fetch_begin(&self, loc: PageLocation, buf: *mut u8, len: usize) -> Handle;

	/// Blocks until the fetch behind `handle` has populated its buffer.
	unsafe fn fetch_end(&self, handle: Handle);

	/// Starts writing one page from `buf` to `loc`.
	///
	/// # Safety
	///
	/// `buf` must stay valid and unmodified until the matching
	/// [`Transport::evict_end`].
	unsafe fn evict_begin(&self, loc: PageLocation, buf: *const u8, len: usize) -> Handle;

	/// Blocks until the eviction behind `handle` is durable at the peer.
	unsafe fn evict_end(&self, handle: Handle);

	/// Whether any transport-owned memory overlaps `[base, base+extent)`.
	fn overlaps(&self, base: usize, extent: usize) -> bool {
		let _ = (base, extent);
		false
	}

	/// Shuts the transport down. May not return on some implementations.
	fn shutdown(&self) {}
}
