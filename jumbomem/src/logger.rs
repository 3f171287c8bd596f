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

//! Library logging.
//!
//! Messages go to stderr, tagged with the hostname and the kernel thread ID so
//! that interleaved output from several ranks stays attributable. The
//! verbosity comes from the `JM_DEBUG` level: 0 warnings only, 1-2 progress
//! and statistics, 3-4 per-operation detail, 5 full tracing.

use crate::util;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};

/// The library's logger.
static LOGGER: Logger = Logger;

/// Logger printing to stderr.
struct Logger;

impl Log for Logger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let prefix = match record.level() {
			Level::Error => "ERROR",
			Level::Warn => "WARNING",
			_ => "JM_DEBUG",
		};
		// A failed write to stderr is not worth dying for
		let _ = writeln!(
			io::stderr().lock(),
			"{prefix} ({}:{}): {}",
			util::hostname(),
			util::gettid(),
			record.args()
		);
	}

	fn flush(&self) {}
}

/// Maps a `JM_DEBUG` level to a [`LevelFilter`].
fn level_filter(debug: u32) -> LevelFilter {
	match debug {
		0 => LevelFilter::Warn,
		1 | 2 => LevelFilter::Info,
		3 | 4 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	}
}

/// Installs the logger with the given `JM_DEBUG` level.
///
/// Does nothing if another logger was already installed.
pub fn init(debug: u32) {
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(level_filter(debug));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_mapping() {
		assert_eq!(level_filter(0), LevelFilter::Warn);
		assert_eq!(level_filter(1), LevelFilter::Info);
		assert_eq!(level_filter(3), LevelFilter::Debug);
		assert_eq!(level_filter(5), LevelFilter::Trace);
		assert_eq!(level_filter(42), LevelFilter::Trace);
	}
}
