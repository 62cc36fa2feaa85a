// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Compile-time build information shared by the `cumulus` binary and the
//! coordinator HTTP client.

shadow_rs::shadow!(build);

#[cfg(feature = "serde")]
use serde::Serialize;

/// `{os}-{arch}`, e.g. `linux-x86_64`.
pub const PLATFORM: &str = env!("CUMULUS_PLATFORM");

#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
	pub version: &'static str,
	pub git_sha: &'static str,
	pub build_timestamp: &'static str,
	pub platform: &'static str,
}

impl BuildInfo {
	#[allow(clippy::const_is_empty)]
	pub const fn current() -> Self {
		Self {
			version: build::PKG_VERSION,
			git_sha: if build::SHORT_COMMIT.is_empty() {
				"unknown"
			} else {
				build::SHORT_COMMIT
			},
			build_timestamp: build::BUILD_TIME,
			platform: PLATFORM,
		}
	}
}

impl std::fmt::Display for BuildInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"cumulus {} ({} {}, built {})",
			self.version, self.git_sha, self.platform, self.build_timestamp
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_info_has_version() {
		assert!(!BuildInfo::current().version.is_empty());
	}

	#[test]
	fn platform_is_os_dash_arch() {
		let parts: Vec<&str> = PLATFORM.split('-').collect();
		assert_eq!(parts.len(), 2);
	}

	#[test]
	fn display_mentions_version_and_platform() {
		let info = BuildInfo::current();
		let shown = info.to_string();
		assert!(shown.starts_with("cumulus "));
		assert!(shown.contains(info.platform));
	}
}
