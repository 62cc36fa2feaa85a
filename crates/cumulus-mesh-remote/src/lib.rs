// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Remote command execution for mesh operations.
//!
//! A [`ConnectionManager`] opens [`Connection`]s through a [`Connector`],
//! retrying transport failures according to a
//! [`RetryPolicy`](cumulus_common_http::RetryPolicy). The production
//! connector is [`SshConnector`], which drives the system OpenSSH client
//! through a per-connection control socket and relays through a bastion when
//! one is configured.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod quote;
pub mod ssh;
pub mod testing;

pub use config::ConnectionConfig;
pub use connection::{Connection, Connector};
pub use error::{RemoteError, Result, TransportError};
pub use manager::ConnectionManager;
pub use quote::shell_quote;
pub use ssh::SshConnector;
