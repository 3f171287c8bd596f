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

//! Environment-variable configuration.
//!
//! Every knob is read once at initialization. An unparseable value is a fatal
//! error: the user is told what was wrong and the process terminates.

use crate::{fatal, sysinfo};
use std::env;

/// Page-prefetching technique.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Prefetch {
	/// Do not prefetch any page.
	#[default]
	None,
	/// Always prefetch the page following the faulted one.
	Next,
	/// Prefetch at the same page distance as between the two previous faults.
	Delta,
}

/// Page-replacement policy selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PolicyKind {
	/// First-in, first-out.
	Fifo,
	/// Uniform random over resident pages.
	Random,
	/// Random, avoiding recently evicted pages.
	Nre,
	/// Not-recently-used, with reference/modify classes.
	#[default]
	Nru,
}

/// Placement request for the managed region.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BaseAddr {
	/// Place just past the end of the data segment.
	#[default]
	Default,
	/// Place at an absolute address.
	Absolute(usize),
	/// Offset the default placement by a signed delta.
	Delta(isize),
}

/// Parses a string as a boolean switch.
///
/// The empty string means `true`. Returns `None` if the string is neither a
/// truthy nor a falsy value.
pub fn parse_bool(s: &str) -> Option<bool> {
	match s.bytes().next() {
		None => Some(true),
		Some(b'1' | b'y' | b'Y' | b't' | b'T') => Some(true),
		Some(b'0' | b'n' | b'N' | b'f' | b'F') => Some(false),
		_ => None,
	}
}

/// Parses a string as either an absolute nonnegative amount or a percentage of
/// `base`.
pub fn parse_amount(s: &str, base: usize) -> Option<usize> {
	if let Some(percent) = s.strip_suffix('%') {
		let percent: f64 = percent.trim().parse().ok()?;
		if percent < 0.0 {
			return None;
		}
		Some((base as f64 * percent / 100.0) as usize)
	} else {
		s.trim().parse().ok()
	}
}

/// Returns the value of the environment variable `name`, or `None` if unset.
fn getenv(name: &str) -> Option<String> {
	env::var(name).ok()
}

/// Reads `name` as a positive integer. Unset returns `None`; an invalid value
/// is fatal.
pub fn getenv_positive(name: &str) -> Option<usize> {
	let s = getenv(name)?;
	match s.trim().parse::<usize>() {
		Ok(v) if v > 0 => Some(v),
		_ => fatal!("{name} must be a positive integer (was \"{s}\")"),
	}
}

/// Reads `name` as a nonnegative integer. Unset returns `None`; an invalid
/// value is fatal.
pub fn getenv_nonnegative(name: &str) -> Option<usize> {
	let s = getenv(name)?;
	match s.trim().parse::<usize>() {
		Ok(v) => Some(v),
		Err(_) => fatal!("{name} must be a nonnegative integer (was \"{s}\")"),
	}
}

/// Reads `name` as a nonnegative integer or a percentage of `base`. Unset
/// returns `None`; an invalid value is fatal.
pub fn getenv_amount(name: &str, base: usize) -> Option<usize> {
	let s = getenv(name)?;
	match parse_amount(&s, base) {
		Some(v) => Some(v),
		None => fatal!("unable to parse \"{s}\" for {name}"),
	}
}

/// Reads `name` as a boolean. Unset returns `None`; an invalid value is fatal.
pub fn getenv_bool(name: &str) -> Option<bool> {
	let s = getenv(name)?;
	match parse_bool(&s) {
		Some(v) => Some(v),
		None => fatal!("\"{s}\" is not a valid boolean value for {name}"),
	}
}

/// The library's configuration, frozen at initialization.
#[derive(Clone, Debug)]
pub struct Config {
	/// Debug verbosity level, 0 is silent.
	pub debug: u32,
	/// The operating system's page size in bytes.
	pub os_page_size: usize,
	/// The logical page size in bytes, a multiple of the OS page size.
	pub page_size: usize,
	/// The prefetching technique to use.
	pub prefetch: Prefetch,
	/// Whether evictions overlap with continued execution.
	pub async_evict: bool,
	/// Whether transfers go through separate staging buffers.
	pub extra_memcpy: bool,
	/// Whether newly mapped pages are locked into RAM.
	pub mlock: bool,
	/// The page-replacement policy.
	pub policy: PolicyKind,
	/// Recent-eviction queue length for the NRE policy.
	pub nre_entries: usize,
	/// Maximum retry count for the NRE policy.
	pub nre_retries: usize,
	/// Reference-bit clear interval for the NRU policy, in milliseconds.
	pub nru_interval_ms: u64,
	/// Whether the NRU policy maps newly loaded pages read/write.
	pub nru_readwrite: bool,
	/// Periodic status print interval in seconds, if any.
	pub heartbeat_s: Option<u64>,
	/// Time to wait for other threads to freeze, in milliseconds.
	pub freeze_timeout_ms: u64,
	/// Whether a freeze timeout is fatal rather than a calculated risk.
	pub freeze_fatal: bool,
	/// Bytes each peer contributes, if overridden.
	pub slave_mem: Option<usize>,
	/// Bytes the master may use for its local cache, if overridden.
	pub master_mem: Option<usize>,
	/// Whether `JM_LOCAL_PAGES` was set explicitly.
	pub local_pages_env: bool,
	/// Whether to shrink budgets until no major faults are observed at warmup.
	pub reduce_mem: bool,
	/// Placement request for the managed region.
	pub base_addr: BaseAddr,
	/// Rank assigned by the launcher, used to suppress duplicate messages.
	pub expected_rank: u32,
}

impl Config {
	/// Reads the whole configuration from the environment.
	///
	/// Contradictory or unparseable settings are fatal.
	pub fn from_env() -> Self {
		let debug = getenv_nonnegative("JM_DEBUG").unwrap_or(0) as u32;
		let os_page_size = sysinfo::os_page_size();
		// The logical page size must keep the mapping count below the kernel
		// limit even in the worst-case alternating pattern
		let page_size = match getenv_positive("JM_PAGESIZE") {
			Some(size) => {
				if size % os_page_size != 0 {
					fatal!(
						"JM_PAGESIZE must be a multiple of the OS page size ({os_page_size} bytes)"
					);
				}
				size
			}
			None => match sysinfo::minimum_page_size(os_page_size) {
				Some(size) => size,
				None => {
					log::warn!(
						"unable to determine the minimum page size; setting JM_PAGESIZE is strongly recommended"
					);
					os_page_size
				}
			},
		};
		let prefetch = match getenv("JM_PREFETCH").as_deref() {
			None | Some("none") => Prefetch::None,
			Some("next") => Prefetch::Next,
			Some("delta") => Prefetch::Delta,
			Some(s) => fatal!("unrecognized value \"{s}\" for JM_PREFETCH"),
		};
		let policy = match getenv("JM_PAGEREPLACE").as_deref() {
			None | Some("nru") => PolicyKind::Nru,
			Some("fifo") => PolicyKind::Fifo,
			Some("random") => PolicyKind::Random,
			Some("nre") => PolicyKind::Nre,
			Some(s) => fatal!("unrecognized value \"{s}\" for JM_PAGEREPLACE"),
		};
		let base_addr = match getenv("JM_BASEADDR") {
			None => BaseAddr::Default,
			Some(s) => {
				let t = s.trim();
				let parsed = if let Some(rest) = t.strip_prefix('+') {
					parse_usize_radix(rest).map(|v| BaseAddr::Delta(v as isize))
				} else if let Some(rest) = t.strip_prefix('-') {
					parse_usize_radix(rest).map(|v| BaseAddr::Delta(-(v as isize)))
				} else {
					parse_usize_radix(t).map(BaseAddr::Absolute)
				};
				match parsed {
					Some(b) => b,
					None => fatal!("JM_BASEADDR requires an integer value (was \"{s}\")"),
				}
			}
		};
		Self {
			debug,
			os_page_size,
			page_size,
			prefetch,
			async_evict: getenv_bool("JM_ASYNCEVICT").unwrap_or(false),
			extra_memcpy: getenv_bool("JM_MEMCPY").unwrap_or(false),
			mlock: getenv_bool("JM_MLOCK").unwrap_or(false),
			policy,
			nre_entries: getenv_nonnegative("JM_NRE_ENTRIES").unwrap_or(32),
			nre_retries: getenv_nonnegative("JM_NRE_RETRIES").unwrap_or(5),
			nru_interval_ms: getenv_positive("JM_NRU_INTERVAL").unwrap_or(5000) as u64,
			nru_readwrite: getenv_bool("JM_NRU_RW").unwrap_or(true),
			heartbeat_s: getenv_nonnegative("JM_HEARTBEAT").map(|v| v as u64),
			freeze_timeout_ms: getenv_positive("JM_FREEZE_TIMEOUT").unwrap_or(1000) as u64,
			freeze_fatal: getenv_bool("JM_FREEZE_FATAL").unwrap_or(true),
			slave_mem: getenv_positive("JM_SLAVEMEM"),
			master_mem: getenv_positive("JM_MASTERMEM"),
			local_pages_env: getenv("JM_LOCAL_PAGES").is_some(),
			reduce_mem: getenv_bool("JM_REDUCEMEM").unwrap_or(false),
			base_addr,
			expected_rank: getenv_nonnegative("JM_EXPECTED_RANK").unwrap_or(0) as u32,
		}
	}

	/// Resolves the local cache budget in pages, given the maximum that fits.
	///
	/// `JM_LOCAL_PAGES` may be an absolute page count or a percentage of
	/// `max_pages`.
	pub fn local_pages(&self, max_pages: usize) -> usize {
		getenv_amount("JM_LOCAL_PAGES", max_pages).unwrap_or(max_pages)
	}
}

/// Parses an integer that may carry a `0x` or `0o` radix prefix.
fn parse_usize_radix(s: &str) -> Option<usize> {
	let s = s.trim();
	if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		usize::from_str_radix(hex, 16).ok()
	} else if let Some(oct) = s.strip_prefix("0o") {
		usize::from_str_radix(oct, 8).ok()
	} else {
		s.parse().ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn booleans() {
		assert_eq!(parse_bool(""), Some(true));
		assert_eq!(parse_bool("1"), Some(true));
		assert_eq!(parse_bool("yes"), Some(true));
		assert_eq!(parse_bool("True"), Some(true));
		assert_eq!(parse_bool("0"), Some(false));
		assert_eq!(parse_bool("no"), Some(false));
		assert_eq!(parse_bool("false"), Some(false));
		assert_eq!(parse_bool("maybe"), None);
	}

	#[test]
	fn amounts() {
		assert_eq!(parse_amount("123", 1000), Some(123));
		assert_eq!(parse_amount("50%", 1000), Some(500));
		assert_eq!(parse_amount("0%", 1000), Some(0));
		assert_eq!(parse_amount("12.5%", 1024), Some(128));
		assert_eq!(parse_amount("-3%", 1000), None);
		assert_eq!(parse_amount("bogus", 1000), None);
	}

	#[test]
	fn radix_prefixes() {
		assert_eq!(parse_usize_radix("42"), Some(42));
		assert_eq!(parse_usize_radix("0x1000"), Some(4096));
		assert_eq!(parse_usize_radix("junk"), None);
	}
}
