// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Minimal SOCKS5 server (RFC 1928): no authentication, CONNECT only.
//!
//! Outbound connections are made through a [`Dialer`], so the same server
//! fronts either the host network or a mesh backend.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Greeting plus request must arrive within this window.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
	Succeeded = 0x00,
	GeneralFailure = 0x01,
	HostUnreachable = 0x04,
	ConnectionRefused = 0x05,
	CommandNotSupported = 0x07,
	AddressTypeNotSupported = 0x08,
}

impl Reply {
	fn from_io(error: &io::Error) -> Self {
		match error.kind() {
			io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
			io::ErrorKind::TimedOut | io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => {
				Reply::HostUnreachable
			}
			_ => Reply::GeneralFailure,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
	Ip(SocketAddr),
	Domain(String, u16),
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TargetAddr::Ip(addr) => write!(f, "{addr}"),
			TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
		}
	}
}

/// Opens the outbound leg of a proxied connection.
#[async_trait]
pub trait Dialer: Send + Sync {
	async fn dial(&self, target: &TargetAddr) -> io::Result<TcpStream>;
}

/// Dials straight out of the host network stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
	async fn dial(&self, target: &TargetAddr) -> io::Result<TcpStream> {
		match target {
			TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
			TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
		}
	}
}

pub struct Socks5Server {
	listener: TcpListener,
	dialer: Arc<dyn Dialer>,
	handshake_timeout: Duration,
}

impl Socks5Server {
	/// Binds on loopback. Port 0 picks a free port.
	pub async fn bind(port: u16, dialer: Arc<dyn Dialer>) -> io::Result<Self> {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
		Ok(Self {
			listener,
			dialer,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		})
	}

	pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
		self.handshake_timeout = timeout;
		self
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accepts until `cancel` fires. In-flight sessions are cancelled too.
	pub async fn serve(self, cancel: CancellationToken) {
		let addr = self.local_addr().ok();
		info!(addr = ?addr, "SOCKS5 proxy listening");
		loop {
			let accepted = tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = self.listener.accept() => accepted,
			};
			match accepted {
				Ok((stream, peer)) => {
					let dialer = Arc::clone(&self.dialer);
					let cancel = cancel.clone();
					let handshake_timeout = self.handshake_timeout;
					tokio::spawn(async move {
						tokio::select! {
							_ = cancel.cancelled() => {}
							result = handle_client(stream, dialer.as_ref(), handshake_timeout) => {
								if let Err(e) = result {
									debug!(%peer, error = %e, "SOCKS5 session ended with error");
								}
							}
						}
					});
				}
				Err(e) => {
					warn!(error = %e, "SOCKS5 accept failed");
				}
			}
		}
		info!(addr = ?addr, "SOCKS5 proxy stopped");
	}
}

/// Reads the greeting and request. `None` means a refusal was already sent.
async fn negotiate(stream: &mut TcpStream) -> io::Result<Option<TargetAddr>> {
	let mut header = [0u8; 2];
	stream.read_exact(&mut header).await?;
	if header[0] != VERSION {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("unsupported SOCKS version {}", header[0]),
		));
	}
	let mut methods = vec![0u8; header[1] as usize];
	stream.read_exact(&mut methods).await?;
	if !methods.contains(&METHOD_NO_AUTH) {
		stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
		return Ok(None);
	}
	stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

	let mut request = [0u8; 4];
	stream.read_exact(&mut request).await?;
	let [version, command, _reserved, atyp] = request;
	if version != VERSION {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request version"));
	}

	let target = match atyp {
		ATYP_IPV4 => {
			let mut buf = [0u8; 6];
			stream.read_exact(&mut buf).await?;
			let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
			TargetAddr::Ip(SocketAddr::new(ip.into(), u16::from_be_bytes([buf[4], buf[5]])))
		}
		ATYP_IPV6 => {
			let mut buf = [0u8; 18];
			stream.read_exact(&mut buf).await?;
			let mut octets = [0u8; 16];
			octets.copy_from_slice(&buf[..16]);
			let port = u16::from_be_bytes([buf[16], buf[17]]);
			TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
		}
		ATYP_DOMAIN => {
			let len = stream.read_u8().await? as usize;
			let mut name = vec![0u8; len];
			stream.read_exact(&mut name).await?;
			let port = stream.read_u16().await?;
			match String::from_utf8(name) {
				Ok(host) => TargetAddr::Domain(host, port),
				Err(_) => {
					send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
					return Ok(None);
				}
			}
		}
		_ => {
			send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
			return Ok(None);
		}
	};

	if command != CMD_CONNECT {
		send_reply(stream, Reply::CommandNotSupported, None).await?;
		return Ok(None);
	}

	Ok(Some(target))
}

async fn handle_client(mut stream: TcpStream, dialer: &dyn Dialer, handshake_timeout: Duration) -> io::Result<()> {
	let target = match tokio::time::timeout(handshake_timeout, negotiate(&mut stream)).await {
		Ok(Ok(Some(target))) => target,
		Ok(Ok(None)) => return Ok(()),
		Ok(Err(e)) => return Err(e),
		Err(_) => {
			return Err(io::Error::new(
				io::ErrorKind::TimedOut,
				format!("handshake not completed within {handshake_timeout:?}"),
			))
		}
	};

	let mut outbound = match dialer.dial(&target).await {
		Ok(outbound) => outbound,
		Err(e) => {
			debug!(%target, error = %e, "SOCKS5 dial failed");
			send_reply(&mut stream, Reply::from_io(&e), None).await?;
			return Ok(());
		}
	};
	let bound = outbound.local_addr().ok();
	send_reply(&mut stream, Reply::Succeeded, bound).await?;
	debug!(%target, "SOCKS5 tunnel open");

	let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await?;
	debug!(%target, up, down, "SOCKS5 tunnel closed");
	Ok(())
}

async fn send_reply(stream: &mut TcpStream, reply: Reply, bound: Option<SocketAddr>) -> io::Result<()> {
	let mut out = vec![VERSION, reply as u8, 0x00];
	match bound {
		Some(SocketAddr::V6(addr)) => {
			out.push(ATYP_IPV6);
			out.extend_from_slice(&addr.ip().octets());
			out.extend_from_slice(&addr.port().to_be_bytes());
		}
		Some(SocketAddr::V4(addr)) => {
			out.push(ATYP_IPV4);
			out.extend_from_slice(&addr.ip().octets());
			out.extend_from_slice(&addr.port().to_be_bytes());
		}
		None => {
			out.push(ATYP_IPV4);
			out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
		}
	}
	stream.write_all(&out).await
}

/// Opens a CONNECT tunnel through a SOCKS5 proxy at `proxy`.
pub async fn connect_via(proxy: SocketAddr, target: &TargetAddr) -> io::Result<TcpStream> {
	let mut stream = TcpStream::connect(proxy).await?;
	stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;
	let mut choice = [0u8; 2];
	stream.read_exact(&mut choice).await?;
	if choice != [VERSION, METHOD_NO_AUTH] {
		return Err(io::Error::new(
			io::ErrorKind::PermissionDenied,
			"proxy requires authentication",
		));
	}

	let mut request = vec![VERSION, CMD_CONNECT, 0x00];
	match target {
		TargetAddr::Ip(SocketAddr::V4(addr)) => {
			request.push(ATYP_IPV4);
			request.extend_from_slice(&addr.ip().octets());
			request.extend_from_slice(&addr.port().to_be_bytes());
		}
		TargetAddr::Ip(SocketAddr::V6(addr)) => {
			request.push(ATYP_IPV6);
			request.extend_from_slice(&addr.ip().octets());
			request.extend_from_slice(&addr.port().to_be_bytes());
		}
		TargetAddr::Domain(host, port) => {
			let len = u8::try_from(host.len())
				.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "domain name too long"))?;
			request.push(ATYP_DOMAIN);
			request.push(len);
			request.extend_from_slice(host.as_bytes());
			request.extend_from_slice(&port.to_be_bytes());
		}
	}
	stream.write_all(&request).await?;

	let mut reply = [0u8; 4];
	stream.read_exact(&mut reply).await?;
	let skip = match reply[3] {
		ATYP_IPV4 => 6,
		ATYP_IPV6 => 18,
		ATYP_DOMAIN => stream.read_u8().await? as usize + 2,
		other => {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("unknown address type {other:#04x} in reply"),
			))
		}
	};
	let mut bound = vec![0u8; skip];
	stream.read_exact(&mut bound).await?;

	match reply[1] {
		0x00 => Ok(stream),
		0x05 => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "target refused connection")),
		0x04 => Err(io::Error::new(io::ErrorKind::NotFound, "target unreachable")),
		code => Err(io::Error::other(format!("proxy reply {code:#04x}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn echo_server() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let (mut r, mut w) = stream.split();
					let _ = tokio::io::copy(&mut r, &mut w).await;
				});
			}
		});
		addr
	}

	async fn proxy() -> (SocketAddr, CancellationToken) {
		let server = Socks5Server::bind(0, Arc::new(DirectDialer)).await.unwrap();
		let addr = server.local_addr().unwrap();
		let cancel = CancellationToken::new();
		tokio::spawn(server.serve(cancel.clone()));
		(addr, cancel)
	}

	async fn round_trip(mut stream: TcpStream) {
		stream.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 4];
		stream.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");
	}

	#[tokio::test]
	async fn connects_to_ipv4_target() {
		let echo = echo_server().await;
		let (proxy, cancel) = proxy().await;
		let stream = connect_via(proxy, &TargetAddr::Ip(echo)).await.unwrap();
		round_trip(stream).await;
		cancel.cancel();
	}

	#[tokio::test]
	async fn connects_to_domain_target() {
		let echo = echo_server().await;
		let (proxy, cancel) = proxy().await;
		let target = TargetAddr::Domain("localhost".to_string(), echo.port());
		let stream = connect_via(proxy, &target).await.unwrap();
		round_trip(stream).await;
		cancel.cancel();
	}

	#[tokio::test]
	async fn refused_target_reports_refusal() {
		let closed = {
			let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
			listener.local_addr().unwrap()
		};
		let (proxy, cancel) = proxy().await;
		let err = connect_via(proxy, &TargetAddr::Ip(closed)).await.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
		cancel.cancel();
	}

	#[tokio::test]
	async fn rejects_bind_command() {
		let echo = echo_server().await;
		let (proxy, cancel) = proxy().await;
		let mut stream = TcpStream::connect(proxy).await.unwrap();
		stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
		let mut choice = [0u8; 2];
		stream.read_exact(&mut choice).await.unwrap();

		let mut request = vec![VERSION, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1];
		request.extend_from_slice(&echo.port().to_be_bytes());
		stream.write_all(&request).await.unwrap();

		let mut reply = [0u8; 10];
		stream.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply[1], Reply::CommandNotSupported as u8);
		cancel.cancel();
	}

	#[tokio::test]
	async fn rejects_clients_without_no_auth_method() {
		let (proxy, cancel) = proxy().await;
		let mut stream = TcpStream::connect(proxy).await.unwrap();
		// username/password only
		stream.write_all(&[VERSION, 1, 0x02]).await.unwrap();
		let mut choice = [0u8; 2];
		stream.read_exact(&mut choice).await.unwrap();
		assert_eq!(choice, [VERSION, METHOD_NONE_ACCEPTABLE]);
		cancel.cancel();
	}

	#[tokio::test]
	async fn silent_client_is_dropped_after_handshake_timeout() {
		let server = Socks5Server::bind(0, Arc::new(DirectDialer))
			.await
			.unwrap()
			.with_handshake_timeout(Duration::from_millis(100));
		let addr = server.local_addr().unwrap();
		let cancel = CancellationToken::new();
		tokio::spawn(server.serve(cancel.clone()));

		let mut stream = TcpStream::connect(addr).await.unwrap();
		// Half a greeting, then nothing.
		stream.write_all(&[VERSION]).await.unwrap();
		let mut buf = [0u8; 1];
		let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
			.await
			.expect("server closes the stalled session");
		assert!(matches!(read, Ok(0) | Err(_)));
		cancel.cancel();
	}

	#[tokio::test]
	async fn stops_accepting_after_cancel() {
		let server = Socks5Server::bind(0, Arc::new(DirectDialer)).await.unwrap();
		let addr = server.local_addr().unwrap();
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(server.serve(cancel.clone()));
		cancel.cancel();
		handle.await.unwrap();
		assert!(TcpStream::connect(addr).await.is_err());
	}
}
