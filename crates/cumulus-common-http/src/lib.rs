// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP and retry utilities.
//!
//! This crate provides:
//! - A pre-configured HTTP client with a consistent User-Agent header
//! - [`RetryPolicy`], a pure (attempt, error) -> decision policy, and the
//!   async [`retry`] driver used for SSH connects and coordinator calls

mod client;
mod retry;

pub use client::{builder, new_client_with_timeout, user_agent};
pub use retry::{is_retryable_status, retry, Backoff, RetryDecision, RetryPolicy, RetryableError};
