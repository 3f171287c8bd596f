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

//! JumboMem gives a single unmodified process an address space backed by the
//! memory of a whole cluster. The master reserves one contiguous virtual
//! range sized to the aggregate of all peers' contributions; accesses outside
//! the locally cached subset fault, and the fault handler round-trips pages
//! over the interconnect before resuming the access.
//!
//! The library is meant to be preloaded ahead of the C library (see the
//! `jumbomem-preload` crate); it can also be embedded directly, driving
//! [`initialize_with`] with a [`transport::Transport`] of the caller's
//! choosing.

pub mod alloc;
pub mod config;
pub mod intercept;
pub mod pagetable;
pub mod policy;
pub mod stats;
pub mod sysinfo;
pub mod transport;
#[macro_use]
pub mod util;

mod fault;
mod logger;
mod memory;
mod threads;

pub use fault::touch_region;
pub use stats::StatsSnapshot;

use crate::{
	config::{Config, Prefetch},
	fault::{PendingIo, SignalShadow},
	memory::Region,
	policy::Policy,
	stats::Stats,
	transport::{MemTransport, Transport},
};
use std::{
	cell::UnsafeCell,
	io, mem, ptr,
	sync::{
		OnceLock,
		atomic::{AtomicBool, Ordering::SeqCst},
	},
};
use thiserror::Error;

/// Library initialization errors reported to embedding callers.
///
/// Misconfiguration does not surface here: an unparseable knob is a fatal
/// error with a human-readable message, per the failure policy.
#[derive(Debug, Error)]
pub enum InitError {
	/// The library is already initialized.
	#[error("JumboMem is already initialized")]
	AlreadyInitialized,
	/// The managed address range could not be reserved.
	#[error("failed to reserve the managed address range: {0}")]
	Region(#[from] io::Error),
	/// The peers contribute less than one logical page each.
	#[error("peers contribute less than one logical page each")]
	PeersTooSmall,
}

/// Mega-lock-protected mutable state.
pub(crate) struct MutState {
	/// The page-replacement policy.
	pub policy: Policy,
	/// Pending fetch, eviction and prefetch, one slot each.
	pub fetch: PendingIo,
	pub evict: PendingIo,
	pub prefetch: PendingIo,
	/// Address currently being serviced; non-zero detects nested faults.
	pub fault_address: usize,
	/// Previously faulted page address, for delta prefetching.
	pub prefetch_prev: usize,
	/// The effective prefetch mode; policies without residence tracking
	/// force it off.
	pub effective_prefetch: Prefetch,
	/// Fault statistics.
	pub stats: Stats,
	/// Shadowed fault-signal dispositions.
	pub shadow: SignalShadow,
}

/// The library's process-wide state: frozen configuration, the managed
/// region, the transport, and the mega-lock-protected rest.
pub(crate) struct Jm {
	pub config: Config,
	pub region: Region,
	pub transport: Box<dyn Transport>,
	state: UnsafeCell<MutState>,
}

// All mutable state is reached through `state_mut`, under the mega-lock
unsafe impl Sync for Jm {}
unsafe impl Send for Jm {}

impl Jm {
	/// Returns the mutable state.
	///
	/// # Safety
	///
	/// The mega-lock must be held, and no other reference to the state may be
	/// live on this thread.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn state_mut(&self) -> &mut MutState {
		&mut *self.state.get()
	}
}

static JM: OnceLock<Jm> = OnceLock::new();
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static FINALIZED: AtomicBool = AtomicBool::new(false);

/// The global state, if initialized.
pub(crate) fn try_jm() -> Option<&'static Jm> {
	JM.get()
}

/// The global state. Must only be called once initialization completed.
pub(crate) fn jm() -> &'static Jm {
	JM.get()
		.unwrap_or_else(|| fatal!("internal error: JumboMem is not initialized"))
}

/// Initializes the library if nothing did yet.
///
/// Allocator entry points call this so that a program whose constructors
/// allocate before ours runs still finds a working library.
pub(crate) fn ensure_initialized() {
	if JM.get().is_none() && !INIT_STARTED.load(SeqCst) {
		let _ = initialize();
	}
}

/// Initializes the library with no external transport.
///
/// Without peers the library collapses to its local-only mode: the managed
/// region is plain local memory and no fault handler is installed.
pub fn initialize() -> Result<(), InitError> {
	initialize_impl(Box::new(
		MemTransport::new(0, 0).expect("empty transport cannot fail"),
	))
}

/// Initializes the library over the given transport.
pub fn initialize_with(transport: Box<dyn Transport>) -> Result<(), InitError> {
	initialize_impl(transport)
}

fn initialize_impl(transport: Box<dyn Transport>) -> Result<(), InitError> {
	let _guard = threads::critical();
	if JM.get().is_some() || INIT_STARTED.swap(true, SeqCst) {
		return Err(InitError::AlreadyInitialized);
	}
	// Children must not inherit the preload and fight for the same region
	std::env::remove_var("LD_PRELOAD");
	// The logger must exist before configuration parsing can warn
	logger::init(config::getenv_nonnegative("JM_DEBUG").unwrap_or(0) as u32);
	intercept::initialize();
	alloc::initialize();
	let config = Config::from_env();
	if config.expected_rank == 0 {
		log::info!("JumboMem is initializing");
	}
	if config.reduce_mem {
		grab_memory();
	}
	let num_peers = transport.peer_count();
	if num_peers == 0 {
		// No peers: serve everything from local memory, without a handler
		log::info!("JumboMem requires at least one peer; allocating all memory locally");
		let extent = config
			.slave_mem
			.unwrap_or_else(sysinfo::available_memory)
			/ config.page_size
			* config.page_size;
		let region = Region::new(&config, extent, 0, extent)?;
		region.set_local_pages(extent / config.page_size);
		region.assign_backing_store(
			region.base(),
			extent,
			libc::PROT_READ | libc::PROT_WRITE,
		);
		log::info!("locally allocated {} bytes ({}B) of memory", extent, util::format_size(extent as u64));
		let (policy, _) = Policy::new(&config, extent / config.page_size);
		install_state(config, region, transport, policy, Prefetch::None);
		return Ok(());
	}
	// Per-peer memory, rounded down to whole logical pages
	let peer_bytes = {
		let raw = match config.slave_mem {
			Some(bytes) => bytes.min(transport.peer_bytes()),
			None => transport.peer_bytes(),
		};
		raw / config.page_size * config.page_size
	};
	if peer_bytes == 0 {
		return Err(InitError::PeersTooSmall);
	}
	let extent = peer_bytes * num_peers;
	log::info!(
		"{peer_bytes} bytes/peer * {num_peers} peers = {extent} total bytes ({}B)",
		util::format_size(extent as u64)
	);
	let region = Region::new(&config, extent, num_peers, peer_bytes)?;
	if transport.overlaps(region.base() as usize, extent) {
		fatal!("the transport placed memory inside the managed region");
	}
	// Size the local cache
	let master_bytes = config
		.master_mem
		.unwrap_or_else(sysinfo::available_memory);
	log::debug!("the master can use at most {master_bytes} bytes of memory");
	let mut local_pages = compute_local_page_count(&config, master_bytes, extent);
	if config.reduce_mem && !config.local_pages_env {
		local_pages = reduce_master_memory(&config, &region, &*transport, local_pages);
	}
	let (policy, local_pages) = Policy::new(&config, local_pages);
	region.set_local_pages(local_pages);
	log::info!(
		"{local_pages} pages ({}B) can be cached locally",
		util::format_size((local_pages * config.page_size) as u64)
	);
	// Policies without residence tracking cannot support prefetching
	let effective_prefetch = if policy.supports_prefetch() || config.prefetch == Prefetch::None {
		config.prefetch
	} else {
		log::info!("the {} policy cannot answer residence queries; disabling prefetch", policy.name());
		Prefetch::None
	};
	diagnostics(&config, num_peers);
	let jm = install_state(config, region, transport, policy, effective_prefetch);
	// Pre-fault as many pages as fit locally, without talking to the peers
	let st = unsafe { jm.state_mut() };
	let mut first_prot = libc::PROT_READ | libc::PROT_WRITE;
	for page in 0..local_pages {
		let rep = st.policy.find_replacement(page as u32);
		if let Some(victim) = rep.victim {
			fatal!("the page at address {:p} was evicted prematurely", jm.region.page_address(victim));
		}
		if page == 0 {
			first_prot = rep.new_prot;
		}
	}
	if local_pages > 0 {
		jm.region.assign_backing_store(
			jm.region.base(),
			local_pages * jm.region.page_size(),
			first_prot,
		);
	}
	fault::install_handler(st);
	log::info!("JumboMem is running");
	Ok(())
}

/// Builds the global state and publishes it.
fn install_state(
	config: Config,
	region: Region,
	transport: Box<dyn Transport>,
	policy: Policy,
	effective_prefetch: Prefetch,
) -> &'static Jm {
	let page_size = config.page_size;
	let mut fetch = PendingIo::idle();
	let mut evict = PendingIo::idle();
	let mut prefetch = PendingIo::idle();
	if effective_prefetch != Prefetch::None {
		prefetch.buffer = alloc::internal_valloc(page_size);
	}
	if config.extra_memcpy {
		fetch.buffer = alloc::internal_valloc(page_size);
		evict.buffer = alloc::internal_valloc(page_size);
	}
	let heartbeat = config.heartbeat_s;
	let jm = Jm {
		config,
		region,
		transport,
		state: UnsafeCell::new(MutState {
			policy,
			fetch,
			evict,
			prefetch,
			fault_address: 0,
			prefetch_prev: 0,
			effective_prefetch,
			stats: Stats::new(heartbeat),
			shadow: SignalShadow {
				prev: unsafe { mem::zeroed() },
				prev_prev: unsafe { mem::zeroed() },
			},
		}),
	};
	match JM.set(jm) {
		Ok(()) => JM.get().unwrap(),
		Err(_) => fatal!("internal error: JumboMem was initialized twice"),
	}
}

/// Coaxes the operating system out of its buffer cache by repeatedly
/// allocating all free memory and touching it.
fn grab_memory() {
	const ITERS: usize = 3;
	let os_page = sysinfo::os_page_size();
	let mut buffers = [ptr::null_mut::<u8>(); ITERS];
	for buffer in &mut buffers {
		let avail = sysinfo::available_memory();
		let p = unsafe { libc::malloc(avail) } as *mut u8;
		if p.is_null() {
			continue;
		}
		*buffer = p;
		let mut off = 0;
		while off < avail {
			unsafe {
				p.add(off).write_volatile(0);
			}
			off += os_page;
		}
	}
	for p in buffers {
		if !p.is_null() {
			unsafe {
				libc::free(p as *mut libc::c_void);
			}
		}
	}
}

/// Computes the local cache budget in pages from the memory the master may
/// use, the kernel's mapping limit and the user's override.
fn compute_local_page_count(config: &Config, master_bytes: usize, extent: usize) -> usize {
	let mut max_local = master_bytes / config.page_size;
	let max_mappings = sysinfo::max_map_count().unwrap_or(0);
	if max_mappings > 0 && max_local >= max_mappings * 2 {
		max_local = max_mappings * 2 - 1;
	}
	let mut local = config.local_pages(max_local);
	if max_mappings > 0 && local >= max_mappings * 2 {
		log::warn!(
			"{local} local pages were requested but only {max_mappings} noncontiguous page mappings are available"
		);
	} else if local > max_local {
		log::warn!(
			"{local} local pages were requested but only {max_local} pages seem to be available"
		);
	}
	if local * config.page_size > extent {
		let reduced = extent / config.page_size;
		log::debug!(
			"cache size exceeds global address-space size; reducing local page count from {local} to {reduced}"
		);
		local = reduced;
	}
	local
}

/// Shrinks the local page budget until caching that much memory provokes no
/// major faults.
///
/// Maps the whole candidate cache, round-trips every page through the
/// transport so it allocates its memory up front, touches everything twice
/// and reads the fault counter in between.
fn reduce_master_memory(
	config: &Config,
	region: &Region,
	transport: &dyn Transport,
	local_pages: usize,
) -> usize {
	let page_size = config.page_size;
	let os_page = config.os_page_size;
	let cached_bytes = page_size * local_pages;
	log::debug!(
		"determining if locally caching {local_pages} pages ({}B) leads to major page faults...",
		util::format_size(cached_bytes as u64)
	);
	region.assign_backing_store(
		region.base(),
		cached_bytes,
		libc::PROT_READ | libc::PROT_WRITE,
	);
	let base = region.base();
	let mut off = 0;
	while off < cached_bytes {
		unsafe {
			base.add(off).write_volatile(0);
		}
		off += os_page;
	}
	// Round-trip every page so the transport allocates everything it needs
	let scratch = alloc::internal_valloc(page_size);
	let mut off = 0;
	while off < cached_bytes {
		let loc = region.location(base as usize + off);
		unsafe {
			let h = transport.fetch_begin(loc, scratch, page_size);
			transport.fetch_end(h);
			let h = transport.evict_begin(loc, scratch, page_size);
			transport.evict_end(h);
		}
		off += page_size;
	}
	alloc::internal_free_raw(scratch);
	// Touch everything again and count the faults it takes
	let faults_before = rusage_major_faults();
	let mut off = 0;
	while off < cached_bytes {
		unsafe {
			base.add(off).write_volatile(0);
		}
		off += os_page;
	}
	let new_faults = rusage_major_faults().saturating_sub(faults_before);
	region.remove_backing_store(base, cached_bytes);
	if new_faults == 0 {
		log::debug!("no major page faults were observed");
		return local_pages;
	}
	log::debug!("the master observed {new_faults} major page faults on {cached_bytes} bytes of memory");
	let shaved = local_pages
		.saturating_sub((new_faults as usize * os_page).div_ceil(page_size));
	log::info!("reducing the number of locally cached pages from {local_pages} to {shaved}");
	shaved
}

/// The process's major-fault count so far.
fn rusage_major_faults() -> u64 {
	let mut usage: libc::rusage = unsafe { mem::zeroed() };
	unsafe {
		libc::getrusage(libc::RUSAGE_SELF, &mut usage);
	}
	usage.ru_majflt as u64
}

/// Prints the configuration in effect.
fn diagnostics(config: &Config, num_peers: usize) {
	log::info!("JumboMem environment variables encountered:");
	let mut found = false;
	for (key, value) in std::env::vars() {
		if key.starts_with("JM_") && key != "JM_EXPECTED_RANK" {
			log::info!("   {key}={value}");
			found = true;
		}
	}
	if !found {
		log::info!("   [none]");
	}
	log::info!(
		"prefetching is {}; asynchronous eviction is {}; copy in/copy out is {}",
		if config.prefetch == Prefetch::None { "disabled" } else { "enabled" },
		if config.async_evict { "enabled" } else { "disabled" },
		if config.extra_memcpy { "enabled" } else { "disabled" }
	);
	log::info!(
		"JumboMem page size: {} bytes; OS page size: {} bytes",
		config.page_size,
		config.os_page_size
	);
	if cfg!(feature = "block-dist") {
		log::info!("using {num_peers} peers; pages are distributed to peers in block fashion");
	} else {
		log::info!("using {num_peers} peers; pages are distributed to peers in round-robin fashion");
	}
}

/// Tears the library down: completes pending transfers, reports statistics,
/// restores the fault signal's previous disposition and shuts the transport
/// down. Idempotent.
pub fn finalize() {
	if FINALIZED.swap(true, SeqCst) {
		return;
	}
	let Some(jm) = try_jm() else {
		return;
	};
	let _guard = threads::critical();
	let st = unsafe { jm.state_mut() };
	fault::drain_pending(jm, st);
	let error = util::ERROR_EXIT.load(SeqCst);
	if !error {
		st.stats
			.report(jm.region.page_size(), st.effective_prefetch != Prefetch::None);
		st.policy.report();
	}
	if jm.transport.peer_count() > 0 {
		fault::restore_previous_handler(st, libc::SIGSEGV);
	}
	jm.transport.shutdown();
	log::info!(
		"JumboMem is {}",
		if error {
			"terminating with an error status"
		} else {
			"exiting normally"
		}
	);
}

/// Marks the caller as library-internal until the guard drops.
///
/// Allocations made while the guard is held come from the library's private
/// arena rather than the managed region.
pub struct InternalGuard(#[allow(dead_code)] threads::Critical);

/// Enters library-internal mode until the returned guard drops.
pub fn internal() -> InternalGuard {
	InternalGuard(threads::critical())
}

/// The managed region's bounds, once initialized.
pub fn region_bounds() -> Option<(usize, usize)> {
	try_jm().map(|jm| (jm.region.base() as usize, jm.region.extent()))
}

/// The logical page size, once initialized.
pub fn page_size() -> Option<usize> {
	try_jm().map(|jm| jm.region.page_size())
}

/// The local cache budget in pages, once initialized.
pub fn local_page_budget() -> Option<usize> {
	try_jm().map(|jm| jm.region.local_pages())
}

/// A copy of the fault statistics, once initialized.
pub fn statistics() -> Option<StatsSnapshot> {
	let jm = try_jm()?;
	let _guard = threads::critical();
	let st = unsafe { jm.state_mut() };
	Some(StatsSnapshot::from(&st.stats))
}
