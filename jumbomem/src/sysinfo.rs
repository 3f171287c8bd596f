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

//! Probing of system memory characteristics through procfs and sysconf.

use crate::{config, fatal};
use std::fs;

/// The kernel's memory-information file.
pub const MEMINFO_FILE: &str = "/proc/meminfo";
/// The file listing the maximum number of memory mappings per process.
const MAPCOUNT_FILE: &str = "/proc/sys/vm/max_map_count";

/// Returns the operating system's page size.
pub fn os_page_size() -> usize {
	let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	if res > 0 {
		res as usize
	} else {
		4096
	}
}

/// Searches `content` (in meminfo format) for the given keys.
///
/// Returns one value per key, scaled from kilobytes to bytes, or `None` for
/// keys that were absent.
pub fn parse_meminfo(content: &str, keys: &[&str]) -> Vec<Option<usize>> {
	let mut values = vec![None; keys.len()];
	for line in content.lines() {
		for (key, value) in keys.iter().zip(values.iter_mut()) {
			let Some(rest) = line.strip_prefix(key) else {
				continue;
			};
			let rest = rest.trim_start();
			let Some(kb) = rest.strip_suffix("kB").map(str::trim) else {
				continue;
			};
			if let Ok(v) = kb.parse::<usize>() {
				*value = Some(v * 1024);
			}
		}
	}
	values
}

/// Reduces `memsize` by `JM_RESERVEMEM`, which may be absolute bytes or a
/// percentage. Dropping below zero is fatal.
fn reserve_memory(memsize: usize) -> usize {
	let Some(reserve) = config::getenv_amount("JM_RESERVEMEM", memsize) else {
		return memsize;
	};
	if reserve > memsize {
		fatal!(
			"reducing {memsize} bytes of memory by {reserve} bytes would result in a negative amount of memory"
		);
	}
	log::debug!("reducing available memory reported from {memsize} bytes to {} bytes", memsize - reserve);
	memsize - reserve
}

/// Returns an estimate of the physical memory available to this process, in
/// bytes.
///
/// The estimate is `MemFree + Buffers + Cached` from the kernel's meminfo
/// file, minus the `JM_RESERVEMEM` skim. Failing that, sysconf's count of
/// available physical pages is used. Failing both is fatal since every budget
/// would otherwise be unknown.
pub fn available_memory() -> usize {
	if let Ok(content) = fs::read_to_string(MEMINFO_FILE) {
		let values = parse_meminfo(&content, &["MemFree:", "Buffers:", "Cached:"]);
		if let [Some(free), Some(buffers), Some(cached)] = values[..] {
			return reserve_memory(free + buffers + cached);
		}
	}
	let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
	if pages > 0 {
		return reserve_memory(pages as usize * os_page_size());
	}
	fatal!(
		"failed to determine the available physical memory; JM_SLAVEMEM and either JM_MASTERMEM or JM_LOCAL_PAGES need to be set explicitly"
	);
}

/// Returns the maximum number of memory mappings available to a process, or
/// `None` if indeterminate.
pub fn max_map_count() -> Option<usize> {
	fs::read_to_string(MAPCOUNT_FILE)
		.ok()?
		.trim()
		.parse()
		.ok()
}

/// Returns the minimum logical page size that cannot exhaust the kernel's
/// mapping limit, or `None` if it cannot be determined.
///
/// The worst case is alternating mapped and unmapped pages, which needs one
/// mapping per two logical pages. Dividing the available memory by the map
/// count and rounding up to an OS page keeps the worst case within the limit.
pub fn minimum_page_size(os_page_size: usize) -> Option<usize> {
	let map_count = max_map_count()?;
	if map_count < 1 {
		return None;
	}
	let physmem = available_memory();
	let size = physmem.div_ceil(map_count).div_ceil(os_page_size) * os_page_size;
	Some(size.max(os_page_size))
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "MemTotal:       16316068 kB\n\
		MemFree:         8043940 kB\n\
		MemAvailable:   12233504 kB\n\
		Buffers:          525232 kB\n\
		Cached:          3353140 kB\n\
		SwapCached:            0 kB\n";

	#[test]
	fn meminfo_parsing() {
		let v = parse_meminfo(SAMPLE, &["MemFree:", "Buffers:", "Cached:", "Bogus:"]);
		assert_eq!(v[0], Some(8043940 * 1024));
		assert_eq!(v[1], Some(525232 * 1024));
		assert_eq!(v[2], Some(3353140 * 1024));
		assert_eq!(v[3], None);
	}

	#[test]
	fn os_page_size_is_sane() {
		let size = os_page_size();
		assert!(size.is_power_of_two());
		assert!(size >= 4096);
	}
}
