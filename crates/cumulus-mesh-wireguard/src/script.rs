// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Remote script builder.
//!
//! Untrusted values (keys, labels, addresses, paths) only enter a script
//! through [`RemoteScript::assign`], which single-quotes them into a shell
//! variable. Every other line is a fixed template that refers to those
//! variables in double quotes.

use cumulus_mesh_remote::shell_quote;

/// Marker written to stderr by a failing script, followed by the stage name.
pub const STAGE_MARKER: &str = "cumulus-stage=";

#[derive(Debug, Clone)]
pub struct RemoteScript {
	lines: Vec<String>,
}

impl Default for RemoteScript {
	fn default() -> Self {
		Self::new()
	}
}

fn is_identifier(name: &str) -> bool {
	let mut chars = name.chars();
	matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl RemoteScript {
	/// Starts a script that stops at the first failing command and reports
	/// the stage it was in.
	pub fn new() -> Self {
		Self {
			lines: vec![
				"set -eu".to_string(),
				"stage=init".to_string(),
				format!(
					"trap 'rc=$?; if [ \"$rc\" -ne 0 ]; then echo \"{STAGE_MARKER}$stage\" >&2; fi' EXIT"
				),
			],
		}
	}

	/// Binds `name` to `value`, quoted. Panics on a non-identifier name,
	/// which is always a programming error.
	pub fn assign(mut self, name: &str, value: &str) -> Self {
		assert!(is_identifier(name), "invalid shell variable name {name:?}");
		self.lines.push(format!("{name}={}", shell_quote(value)));
		self
	}

	pub fn stage(mut self, stage: &str) -> Self {
		assert!(is_identifier(stage), "invalid stage name {stage:?}");
		self.lines.push(format!("stage={stage}"));
		self
	}

	/// Appends a fixed template line.
	pub fn line(mut self, line: impl Into<String>) -> Self {
		self.lines.push(line.into());
		self
	}

	pub fn lines<I, S>(mut self, lines: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.lines.extend(lines.into_iter().map(Into::into));
		self
	}

	pub fn render(&self) -> String {
		let mut script = self.lines.join("\n");
		script.push('\n');
		script
	}

	/// The whole script as one command line for a remote login shell.
	pub fn into_command(self, sudo: bool) -> String {
		let quoted = shell_quote(&self.render());
		if sudo {
			format!("sudo -n sh -c {quoted}")
		} else {
			format!("sh -c {quoted}")
		}
	}
}

/// Extracts the stage a failed script reported, if any.
pub fn failed_stage(output: &str) -> Option<&str> {
	output
		.lines()
		.rev()
		.find_map(|line| line.trim().strip_prefix(STAGE_MARKER))
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::process::Command;

	fn run_locally(command: &str) -> (i32, String, String) {
		let output = Command::new("sh").arg("-c").arg(command).output().unwrap();
		(
			output.status.code().unwrap_or(-1),
			String::from_utf8_lossy(&output.stdout).into_owned(),
			String::from_utf8_lossy(&output.stderr).into_owned(),
		)
	}

	#[test]
	fn hostile_values_stay_data() {
		let hostile = "x'; touch /tmp/pwned; echo '$(id)`id`";
		let cmd = RemoteScript::new()
			.assign("label", hostile)
			.line("printf '%s' \"$label\"")
			.into_command(false);

		let (rc, stdout, _) = run_locally(&cmd);
		assert_eq!(rc, 0);
		assert_eq!(stdout, hostile);
	}

	#[test]
	fn failing_stage_is_reported() {
		let cmd = RemoteScript::new()
			.stage("backup")
			.line("true")
			.stage("sync")
			.line("false")
			.into_command(false);

		let (rc, _, stderr) = run_locally(&cmd);
		assert_ne!(rc, 0);
		assert_eq!(failed_stage(&stderr), Some("sync"));
	}

	#[test]
	fn successful_script_reports_nothing() {
		let cmd = RemoteScript::new().stage("append").line("true").into_command(false);
		let (rc, _, stderr) = run_locally(&cmd);
		assert_eq!(rc, 0);
		assert_eq!(failed_stage(&stderr), None);
	}

	#[test]
	#[should_panic(expected = "invalid shell variable name")]
	fn rejects_bad_variable_names() {
		let _ = RemoteScript::new().assign("a;b", "x");
	}

	#[test]
	fn sudo_wraps_whole_script() {
		let cmd = RemoteScript::new().line("true").into_command(true);
		assert!(cmd.starts_with("sudo -n sh -c '"));
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(48))]

		#[test]
		fn any_label_survives_the_remote_shell(value in "[ -~]{0,40}") {
			// Outer quoting for ssh's remote shell, inner assignment for the script.
			let cmd = RemoteScript::new()
				.assign("value", &value)
				.line("printf '%s' \"$value\"")
				.into_command(false);
			let (rc, stdout, _) = run_locally(&cmd);
			prop_assert_eq!(rc, 0);
			prop_assert_eq!(stdout, value);
		}

		#[test]
		fn assignments_never_leak_unquoted_metacharacters(value in "[ -~]{1,40}") {
			let script = RemoteScript::new().assign("v", &value).render();
			let assignment = script.lines().last().unwrap();
			let rhs = assignment.strip_prefix("v=").unwrap();
			let unquoted_safe = rhs.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+".contains(c));
			prop_assert!(unquoted_safe || (rhs.starts_with('\'') && rhs.ends_with('\'')));
		}
	}
}
