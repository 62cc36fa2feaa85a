// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard key material.
//!
//! Private keys are 32-byte X25519 scalars clamped the way WireGuard expects
//! (bits 0-2 of byte 0 cleared, bit 7 of byte 31 cleared, bit 6 of byte 31
//! set). Both halves are encoded as standard padded base64, the format `wg`
//! reads and prints.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cumulus_common_secret::Secret;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("random source failed: {0}")]
	RandomSource(#[from] rand::Error),
}

pub type Result<T> = std::result::Result<T, KeyError>;

pub fn clamp(mut bytes: [u8; 32]) -> [u8; 32] {
	bytes[0] &= 0b1111_1000;
	bytes[31] &= 0b0111_1111;
	bytes[31] |= 0b0100_0000;
	bytes
}

pub fn is_clamped(bytes: &[u8; 32]) -> bool {
	bytes[0] & 0b0000_0111 == 0 && bytes[31] & 0b1000_0000 == 0 && bytes[31] & 0b0100_0000 != 0
}

fn decode_32(s: &str) -> Result<[u8; 32]> {
	let bytes = STANDARD.decode(s.trim())?;
	if bytes.len() != 32 {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; 32];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; 32],
}

impl WgPrivateKey {
	/// Wraps raw scalar bytes, clamping them.
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self {
			bytes: clamp(bytes),
		}
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self::from_bytes(decode_32(s)?))
	}

	pub fn to_base64(&self) -> Secret<String> {
		Secret::new(STANDARD.encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		WgPublicKey {
			bytes: x25519(self.bytes, X25519_BASEPOINT_BYTES),
		}
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; 32],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_32(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}

	/// First eight base64 characters, for log lines and tables.
	pub fn short(&self) -> String {
		self.to_base64().chars().take(8).collect()
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", self.short()))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	/// Generates a key pair from the operating system's CSPRNG.
	pub fn generate() -> Result<Self> {
		KeyGenerator::new().generate()
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key_base64: &str) -> Result<Self> {
		Ok(Self::from_private_key(WgPrivateKey::from_base64(
			private_key_base64,
		)?))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}

/// Produces WireGuard key pairs from a cryptographically secure RNG.
pub struct KeyGenerator<R = OsRng> {
	rng: R,
}

impl KeyGenerator<OsRng> {
	pub fn new() -> Self {
		Self { rng: OsRng }
	}
}

impl Default for KeyGenerator<OsRng> {
	fn default() -> Self {
		Self::new()
	}
}

impl<R: RngCore + CryptoRng> KeyGenerator<R> {
	pub fn with_rng(rng: R) -> Self {
		Self { rng }
	}

	pub fn generate(&mut self) -> Result<WgKeyPair> {
		let mut scalar = [0u8; 32];
		self.rng.try_fill_bytes(&mut scalar)?;
		let private = WgPrivateKey::from_bytes(scalar);
		scalar.zeroize();
		Ok(WgKeyPair::from_private_key(private))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	#[test]
	fn generated_keys_are_clamped() {
		let keypair = WgKeyPair::generate().unwrap();
		let bytes = keypair.private_key().expose_bytes();
		assert_eq!(bytes[0] & 0b111, 0);
		assert_eq!(bytes[31] & 0b1000_0000, 0);
		assert_eq!(bytes[31] & 0b0100_0000, 0b0100_0000);
	}

	#[test]
	fn base64_is_wireguard_length() {
		let keypair = WgKeyPair::generate().unwrap();
		assert_eq!(keypair.public_key().to_base64().len(), 44);
		assert_eq!(keypair.private_key().to_base64().expose().len(), 44);
	}

	#[test]
	fn known_vector_matches_rfc7748() {
		// RFC 7748 section 6.1, Alice's key pair.
		let private: [u8; 32] = [
			0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2, 0x66,
			0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5, 0x1d, 0xb9,
			0x2c, 0x2a,
		];
		let expected: [u8; 32] = [
			0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e, 0xf7,
			0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e, 0xaa, 0x9b,
			0x4e, 0x6a,
		];
		let public = WgPrivateKey::from_bytes(private).public_key();
		assert_eq!(public.as_bytes(), &expected);
	}

	#[test]
	fn seeded_generator_is_reproducible() {
		let a = KeyGenerator::with_rng(StdRng::seed_from_u64(7))
			.generate()
			.unwrap();
		let b = KeyGenerator::with_rng(StdRng::seed_from_u64(7))
			.generate()
			.unwrap();
		assert_eq!(a.public_key(), b.public_key());
	}

	#[test]
	fn private_key_never_prints() {
		let keypair = WgKeyPair::generate().unwrap();
		let secret = keypair.private_key().to_base64();
		assert!(!format!("{:?}", keypair).contains(secret.expose().as_str()));
		assert_eq!(format!("{}", keypair.private_key()), "[REDACTED]");
		assert_eq!(
			serde_json::to_string(keypair.private_key()).unwrap(),
			"\"[REDACTED]\""
		);
	}

	#[test]
	fn public_key_rejects_wrong_length() {
		let short = STANDARD.encode([1u8; 16]);
		assert!(matches!(
			WgPublicKey::from_base64(&short),
			Err(KeyError::InvalidLength(16))
		));
	}

	#[test]
	fn public_key_serde_uses_base64() {
		let keypair = WgKeyPair::generate().unwrap();
		let json = serde_json::to_string(keypair.public_key()).unwrap();
		assert_eq!(json, format!("\"{}\"", keypair.public_key().to_base64()));
		let back: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(&back, keypair.public_key());
	}

	proptest! {
		#[test]
		fn clamping_holds_for_any_scalar(seed in prop::array::uniform32(any::<u8>())) {
			let private = WgPrivateKey::from_bytes(seed);
			prop_assert!(is_clamped(private.expose_bytes()));
		}

		#[test]
		fn derivation_is_deterministic(seed in prop::array::uniform32(any::<u8>())) {
			let private = WgPrivateKey::from_bytes(seed);
			prop_assert_eq!(private.public_key(), private.public_key());

			let restored = WgPrivateKey::from_base64(private.to_base64().expose()).unwrap();
			prop_assert_eq!(restored.public_key(), private.public_key());
		}

		#[test]
		fn derivation_matches_static_secret(seed in prop::array::uniform32(any::<u8>())) {
			let ours = WgPrivateKey::from_bytes(seed).public_key();
			let theirs = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(seed));
			prop_assert_eq!(ours.as_bytes(), theirs.as_bytes());
		}
	}
}
