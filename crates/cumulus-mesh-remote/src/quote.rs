// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

/// Quotes `s` as a single POSIX shell word.
///
/// Strings made only of characters the shell never interprets are returned
/// unchanged; anything else is wrapped in single quotes with embedded quotes
/// written as `'\''`.
pub fn shell_quote(s: &str) -> String {
	if !s.is_empty()
		&& s
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ',' | '+'))
	{
		return s.to_string();
	}

	let mut quoted = String::with_capacity(s.len() + 2);
	quoted.push('\'');
	for c in s.chars() {
		if c == '\'' {
			quoted.push_str("'\\''");
		} else {
			quoted.push(c);
		}
	}
	quoted.push('\'');
	quoted
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::process::Command;

	#[test]
	fn plain_words_pass_through() {
		assert_eq!(shell_quote("wg0"), "wg0");
		assert_eq!(shell_quote("/etc/wireguard/wg0.conf"), "/etc/wireguard/wg0.conf");
		assert_eq!(shell_quote("10.8.0.100/32"), "10.8.0.100/32");
	}

	#[test]
	fn metacharacters_are_wrapped() {
		assert_eq!(shell_quote(""), "''");
		assert_eq!(shell_quote("a b"), "'a b'");
		assert_eq!(shell_quote("$(id)"), "'$(id)'");
		assert_eq!(shell_quote("it's"), "'it'\\''s'");
	}

	fn echo_through_sh(s: &str) -> String {
		let output = Command::new("sh")
			.arg("-c")
			.arg(format!("printf '%s' {}", shell_quote(s)))
			.output()
			.unwrap();
		String::from_utf8(output.stdout).unwrap()
	}

	#[test]
	fn shell_sees_the_original_string() {
		for s in ["a'b", "$HOME", "`id`", "x; rm -rf /", "tab\there", "\\n literal"] {
			assert_eq!(echo_through_sh(s), s);
		}
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(64))]

		#[test]
		fn quoted_output_has_no_bare_single_quote(s in "[ -~]{0,32}") {
			let quoted = shell_quote(&s);
			// Outside of quoted runs, the only quote sequence allowed is the escaped one.
			let stripped = quoted.replace("'\\''", "");
			if stripped != s {
				prop_assert!(stripped.starts_with('\''));
				prop_assert!(stripped.ends_with('\''));
				prop_assert!(!stripped[1..stripped.len() - 1].contains('\''));
			}
		}

		#[test]
		fn round_trips_through_sh(s in "[ -~]{0,24}") {
			prop_assert_eq!(echo_through_sh(&s), s);
		}
	}
}
