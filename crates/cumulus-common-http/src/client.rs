// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client with consistent User-Agent header.

use cumulus_common_version::BuildInfo;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// Creates a new HTTP client builder with the standard User-Agent header.
///
/// The User-Agent format is: `cumulus/{platform}/{git_sha}`
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Creates a client whose every request (connect included) is bounded by `timeout`.
pub fn new_client_with_timeout(timeout: Duration) -> Client {
	builder()
		.timeout(timeout)
		.connect_timeout(timeout)
		.build()
		.expect("failed to build HTTP client")
}

pub fn user_agent() -> String {
	let info = BuildInfo::current();
	format!("cumulus/{}/{}", info.platform, info.git_sha)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_has_correct_format() {
		let ua = user_agent();
		let parts: Vec<&str> = ua.split('/').collect();
		assert_eq!(parts.len(), 3);
		assert_eq!(parts[0], "cumulus");
	}

	#[test]
	fn builder_builds() {
		assert!(builder().timeout(Duration::from_secs(1)).build().is_ok());
	}
}
