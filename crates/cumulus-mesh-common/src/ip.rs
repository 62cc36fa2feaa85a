// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpError {
	#[error("invalid IPv4 address: {0}")]
	InvalidAddress(String),

	#[error("invalid address range: {0}")]
	InvalidRange(String),

	#[error("address {address} is not in subnet {subnet}")]
	NotInSubnet { address: Ipv4Addr, subnet: Ipv4Net },

	#[error("address {address} is the network or broadcast address of {subnet}")]
	NotHostAddress { address: Ipv4Addr, subnet: Ipv4Net },
}

pub type Result<T> = std::result::Result<T, IpError>;

/// An inclusive IPv4 address range.
///
/// Parses from `"10.8.0.1-10.8.0.9"`, a single address, or a CIDR block
/// (which covers every address in the block, network and broadcast included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
	start: Ipv4Addr,
	end: Ipv4Addr,
}

impl IpRange {
	pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
		if u32::from(start) > u32::from(end) {
			return Err(IpError::InvalidRange(format!("{start}-{end}")));
		}
		Ok(Self { start, end })
	}

	pub fn single(address: Ipv4Addr) -> Self {
		Self {
			start: address,
			end: address,
		}
	}

	pub fn start(&self) -> Ipv4Addr {
		self.start
	}

	pub fn end(&self) -> Ipv4Addr {
		self.end
	}

	pub fn contains(&self, address: Ipv4Addr) -> bool {
		let a = u32::from(address);
		u32::from(self.start) <= a && a <= u32::from(self.end)
	}

	/// Number of addresses covered; never zero.
	pub fn size(&self) -> u64 {
		u64::from(u32::from(self.end) - u32::from(self.start)) + 1
	}
}

impl From<Ipv4Net> for IpRange {
	fn from(net: Ipv4Net) -> Self {
		Self {
			start: net.network(),
			end: net.broadcast(),
		}
	}
}

fn parse_addr(s: &str) -> Result<Ipv4Addr> {
	s.trim()
		.parse()
		.map_err(|_| IpError::InvalidAddress(s.trim().to_string()))
}

impl FromStr for IpRange {
	type Err = IpError;

	fn from_str(s: &str) -> Result<Self> {
		let s = s.trim();
		if let Some((start, end)) = s.split_once('-') {
			return Self::new(parse_addr(start)?, parse_addr(end)?);
		}
		if s.contains('/') {
			let net: Ipv4Net = s
				.parse()
				.map_err(|_| IpError::InvalidRange(s.to_string()))?;
			return Ok(net.into());
		}
		Ok(Self::single(parse_addr(s)?))
	}
}

impl fmt::Display for IpRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.start == self.end {
			write!(f, "{}", self.start)
		} else {
			write!(f, "{}-{}", self.start, self.end)
		}
	}
}

impl Serialize for IpRange {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for IpRange {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// Host addresses of `net` in increasing order. Network and broadcast
/// addresses are excluded for prefixes shorter than /31.
pub fn usable_hosts(net: &Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
	net.hosts()
}

pub fn ensure_in_subnet(address: Ipv4Addr, subnet: &Ipv4Net) -> Result<()> {
	if subnet.contains(&address) {
		Ok(())
	} else {
		Err(IpError::NotInSubnet {
			address,
			subnet: *subnet,
		})
	}
}

/// Like [`ensure_in_subnet`], but also rejects the network and broadcast
/// addresses that [`usable_hosts`] never yields.
pub fn ensure_usable_host(address: Ipv4Addr, subnet: &Ipv4Net) -> Result<()> {
	ensure_in_subnet(address, subnet)?;
	if subnet.prefix_len() < 31 && (address == subnet.network() || address == subnet.broadcast()) {
		return Err(IpError::NotHostAddress {
			address,
			subnet: *subnet,
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_dash_range() {
		let range: IpRange = "10.8.0.1-10.8.0.9".parse().unwrap();
		assert_eq!(range.start(), Ipv4Addr::new(10, 8, 0, 1));
		assert_eq!(range.end(), Ipv4Addr::new(10, 8, 0, 9));
		assert_eq!(range.size(), 9);
		assert!(range.contains(Ipv4Addr::new(10, 8, 0, 9)));
		assert!(!range.contains(Ipv4Addr::new(10, 8, 0, 10)));
	}

	#[test]
	fn parses_single_address_and_cidr() {
		let single: IpRange = "10.8.0.5".parse().unwrap();
		assert_eq!(single.size(), 1);
		assert_eq!(single.to_string(), "10.8.0.5");

		let block: IpRange = "10.8.0.0/28".parse().unwrap();
		assert_eq!(block.start(), Ipv4Addr::new(10, 8, 0, 0));
		assert_eq!(block.end(), Ipv4Addr::new(10, 8, 0, 15));
	}

	#[test]
	fn rejects_reversed_and_garbage() {
		assert!(matches!(
			"10.8.0.9-10.8.0.1".parse::<IpRange>(),
			Err(IpError::InvalidRange(_))
		));
		assert!(matches!(
			"ten.eight-10.8.0.1".parse::<IpRange>(),
			Err(IpError::InvalidAddress(_))
		));
		assert!("10.8.0.0/40".parse::<IpRange>().is_err());
	}

	#[test]
	fn serde_uses_string_form() {
		let range: IpRange = "10.8.0.10-10.8.0.99".parse().unwrap();
		let json = serde_json::to_string(&range).unwrap();
		assert_eq!(json, "\"10.8.0.10-10.8.0.99\"");
		let back: IpRange = serde_json::from_str(&json).unwrap();
		assert_eq!(back, range);
	}

	#[test]
	fn usable_hosts_skip_network_and_broadcast() {
		let net: Ipv4Net = "10.8.0.0/30".parse().unwrap();
		let hosts: Vec<_> = usable_hosts(&net).collect();
		assert_eq!(
			hosts,
			vec![Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 8, 0, 2)]
		);
	}

	#[test]
	fn subnet_membership() {
		let net: Ipv4Net = "10.8.0.0/24".parse().unwrap();
		assert!(ensure_in_subnet(Ipv4Addr::new(10, 8, 0, 200), &net).is_ok());
		assert!(matches!(
			ensure_in_subnet(Ipv4Addr::new(10, 9, 0, 1), &net),
			Err(IpError::NotInSubnet { .. })
		));
	}

	#[test]
	fn usable_host_excludes_network_and_broadcast() {
		let net: Ipv4Net = "10.8.0.0/24".parse().unwrap();
		assert!(ensure_usable_host(Ipv4Addr::new(10, 8, 0, 1), &net).is_ok());
		assert!(ensure_usable_host(Ipv4Addr::new(10, 8, 0, 254), &net).is_ok());
		for edge in [Ipv4Addr::new(10, 8, 0, 0), Ipv4Addr::new(10, 8, 0, 255)] {
			assert_eq!(
				ensure_usable_host(edge, &net),
				Err(IpError::NotHostAddress {
					address: edge,
					subnet: net
				})
			);
		}
		assert!(matches!(
			ensure_usable_host(Ipv4Addr::new(10, 9, 0, 1), &net),
			Err(IpError::NotInSubnet { .. })
		));

		let point_to_point: Ipv4Net = "10.8.0.0/31".parse().unwrap();
		assert!(ensure_usable_host(Ipv4Addr::new(10, 8, 0, 0), &point_to_point).is_ok());
	}
}
