// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Headscale management API client.
//!
//! Only the calls needed to join a node are covered: user bootstrap,
//! pre-auth key issuance and a liveness probe.

use crate::error::AuthKeyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cumulus_common_http::{retry, RetryPolicy};
use cumulus_common_secret::SecretString;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AuthKeyOptions {
	pub reusable: bool,
	pub ephemeral: bool,
	/// Lifetime of the key from the moment it is issued.
	pub expiration: Duration,
	pub tags: Vec<String>,
}

impl Default for AuthKeyOptions {
	fn default() -> Self {
		Self {
			reusable: false,
			ephemeral: true,
			expiration: Duration::from_secs(3600),
			tags: Vec::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthKey {
	pub id: String,
	pub key: SecretString,
	pub user: String,
	pub reusable: bool,
	pub ephemeral: bool,
	pub used: bool,
	pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeadscaleUser {
	#[serde(default)]
	pub id: String,
	pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreAuthKeyRequest<'a> {
	user: &'a str,
	reusable: bool,
	ephemeral: bool,
	expiration: DateTime<Utc>,
	acl_tags: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeyBody {
	#[serde(default)]
	id: String,
	#[serde(default)]
	key: String,
	#[serde(default)]
	user: Option<UserRef>,
	#[serde(default)]
	reusable: bool,
	#[serde(default)]
	ephemeral: bool,
	#[serde(default)]
	used: bool,
	#[serde(default)]
	expiration: Option<DateTime<Utc>>,
}

/// Older coordinators send the user as a name, newer ones as an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserRef {
	Name(String),
	User(HeadscaleUser),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreAuthKeyResponse {
	pre_auth_key: Option<PreAuthKeyBody>,
}

#[derive(Debug, Deserialize)]
struct ListUsersResponse {
	#[serde(default)]
	users: Vec<HeadscaleUser>,
}

#[derive(Debug, Deserialize)]
struct CreateUserResponse {
	user: Option<HeadscaleUser>,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
	name: &'a str,
}

/// Anything that can hand out a credential for joining the mesh.
#[async_trait]
pub trait AuthKeySource: Send + Sync {
	/// `ephemeral` asks for a node that the coordinator forgets once it goes offline.
	async fn auth_key(&self, ephemeral: bool) -> Result<SecretString, AuthKeyError>;
}

/// A pre-issued key, used as is.
pub struct StaticAuthKey(pub SecretString);

#[async_trait]
impl AuthKeySource for StaticAuthKey {
	async fn auth_key(&self, _ephemeral: bool) -> Result<SecretString, AuthKeyError> {
		Ok(self.0.clone())
	}
}

pub struct HeadscaleManager {
	http: Client,
	base_url: Url,
	api_key: SecretString,
	user: String,
	policy: RetryPolicy,
	key_options: AuthKeyOptions,
}

impl HeadscaleManager {
	pub fn new(mut base_url: Url, api_key: SecretString, user: impl Into<String>) -> Self {
		// API paths are joined relative to the base, so a path prefix needs a trailing slash.
		if !base_url.path().ends_with('/') {
			let path = format!("{}/", base_url.path());
			base_url.set_path(&path);
		}
		Self {
			http: cumulus_common_http::new_client_with_timeout(DEFAULT_REQUEST_TIMEOUT),
			base_url,
			api_key,
			user: user.into(),
			policy: RetryPolicy::http(),
			key_options: AuthKeyOptions::default(),
		}
	}

	pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.policy = policy;
		self
	}

	/// Options used when this manager acts as an [`AuthKeySource`].
	pub fn with_key_options(mut self, options: AuthKeyOptions) -> Self {
		self.key_options = options;
		self
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	pub fn user(&self) -> &str {
		&self.user
	}

	fn api_url(&self, path: &str) -> Result<Url, AuthKeyError> {
		Ok(self.base_url.join(path)?)
	}

	/// One request with retries. `build` is called once per attempt.
	async fn send<T, F>(&self, build: F) -> Result<T, AuthKeyError>
	where
		T: DeserializeOwned,
		F: Fn() -> RequestBuilder,
	{
		let build = &build;
		retry(&self.policy, move || self.attempt(build())).await
	}

	async fn attempt<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AuthKeyError> {
		let unreachable = |source: reqwest::Error| AuthKeyError::Unreachable {
			url: self.base_url.to_string(),
			source,
		};
		let response = request
			.bearer_auth(self.api_key.expose())
			.send()
			.await
			.map_err(unreachable)?;

		let status = response.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(AuthKeyError::Unauthorized {
				status: status.as_u16(),
			});
		}
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(AuthKeyError::Api {
				status: status.as_u16(),
				message,
			});
		}

		let body = response.text().await.map_err(unreachable)?;
		serde_json::from_str(&body).map_err(|e| AuthKeyError::InvalidResponse(e.to_string()))
	}

	fn request(&self, method: Method, url: Url) -> impl Fn() -> RequestBuilder + '_ {
		move || self.http.request(method.clone(), url.clone())
	}

	/// Issues a pre-auth key for the configured user.
	#[instrument(skip(self, options), fields(user = %self.user, reusable = options.reusable, ephemeral = options.ephemeral))]
	pub async fn create_auth_key(&self, options: &AuthKeyOptions) -> Result<AuthKey, AuthKeyError> {
		let url = self.api_url("api/v1/preauthkey")?;
		let expiration = Utc::now()
			+ chrono::Duration::from_std(options.expiration)
				.map_err(|e| AuthKeyError::InvalidResponse(format!("expiration out of range: {e}")))?;
		let request = CreatePreAuthKeyRequest {
			user: &self.user,
			reusable: options.reusable,
			ephemeral: options.ephemeral,
			expiration,
			acl_tags: &options.tags,
		};

		let build = self.request(Method::POST, url);
		let response: CreatePreAuthKeyResponse = self.send(|| build().json(&request)).await?;
		let body = response
			.pre_auth_key
			.ok_or_else(|| AuthKeyError::InvalidResponse("response has no preAuthKey".to_string()))?;
		if body.key.is_empty() {
			return Err(AuthKeyError::InvalidResponse("preAuthKey has an empty key".to_string()));
		}

		let user = match body.user {
			Some(UserRef::Name(name)) => name,
			Some(UserRef::User(user)) => user.name,
			None => self.user.clone(),
		};
		info!(id = %body.id, expiration = ?body.expiration, "auth key issued");
		Ok(AuthKey {
			id: body.id,
			key: SecretString::new(body.key),
			user,
			reusable: body.reusable,
			ephemeral: body.ephemeral,
			used: body.used,
			expiration: body.expiration,
		})
	}

	/// Creates the configured user unless it already exists.
	#[instrument(skip(self), fields(user = %self.user))]
	pub async fn ensure_user(&self) -> Result<HeadscaleUser, AuthKeyError> {
		let mut url = self.api_url("api/v1/user")?;
		url.query_pairs_mut().append_pair("name", &self.user);
		let list: ListUsersResponse = self.send(self.request(Method::GET, url)).await?;
		if let Some(existing) = list.users.into_iter().find(|u| u.name == self.user) {
			debug!(id = %existing.id, "user exists");
			return Ok(existing);
		}

		let url = self.api_url("api/v1/user")?;
		let build = self.request(Method::POST, url);
		let body = CreateUserRequest { name: &self.user };
		let created: CreateUserResponse = self.send(|| build().json(&body)).await?;
		let user = created
			.user
			.ok_or_else(|| AuthKeyError::InvalidResponse("response has no user".to_string()))?;
		info!(id = %user.id, "user created");
		Ok(user)
	}

	/// Probes the coordinator's health endpoint.
	#[instrument(skip(self), fields(url = %self.base_url))]
	pub async fn health(&self) -> Result<(), AuthKeyError> {
		let url = self.api_url("health")?;
		let _: serde_json::Value = self.send(self.request(Method::GET, url)).await?;
		Ok(())
	}
}

#[async_trait]
impl AuthKeySource for HeadscaleManager {
	async fn auth_key(&self, ephemeral: bool) -> Result<SecretString, AuthKeyError> {
		self.ensure_user().await?;
		let options = AuthKeyOptions {
			ephemeral,
			..self.key_options.clone()
		};
		Ok(self.create_auth_key(&options).await?.key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cumulus_common_http::Backoff;
	use wiremock::matchers::{body_partial_json, header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn manager(server: &MockServer) -> HeadscaleManager {
		HeadscaleManager::new(
			Url::parse(&server.uri()).unwrap(),
			SecretString::new("hs-api-key".to_string()),
			"cumulus",
		)
		.with_retry_policy(RetryPolicy {
			max_attempts: 3,
			backoff: Backoff::Fixed(Duration::from_millis(5)),
			jitter: false,
		})
	}

	fn key_response() -> serde_json::Value {
		serde_json::json!({
			"preAuthKey": {
				"user": "cumulus",
				"id": "7",
				"key": "4f1c0a0d6e0b5f5a",
				"reusable": false,
				"ephemeral": true,
				"used": false,
				"expiration": "2030-01-01T00:00:00Z",
				"createdAt": "2029-12-31T23:00:00Z",
				"aclTags": []
			}
		})
	}

	#[tokio::test]
	async fn creates_ephemeral_key() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.and(header("Authorization", "Bearer hs-api-key"))
			.and(body_partial_json(serde_json::json!({
				"user": "cumulus",
				"reusable": false,
				"ephemeral": true,
				"aclTags": []
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(key_response()))
			.expect(1)
			.mount(&server)
			.await;

		let key = manager(&server)
			.create_auth_key(&AuthKeyOptions::default())
			.await
			.unwrap();
		assert_eq!(key.key.expose(), "4f1c0a0d6e0b5f5a");
		assert_eq!(key.id, "7");
		assert!(key.ephemeral);
		assert!(!key.used);
		assert!(key.expiration.is_some());
		assert_eq!(format!("{:?}", key.key), "[REDACTED]");
	}

	#[tokio::test]
	async fn accepts_user_object_and_missing_optional_fields() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"preAuthKey": {
					"user": { "id": "3", "name": "cumulus" },
					"key": "abc"
				}
			})))
			.mount(&server)
			.await;

		let key = manager(&server)
			.create_auth_key(&AuthKeyOptions::default())
			.await
			.unwrap();
		assert_eq!(key.user, "cumulus");
		assert!(key.expiration.is_none());
		assert!(!key.reusable);
	}

	#[tokio::test]
	async fn invalid_api_key_is_not_retried() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
			.expect(1)
			.mount(&server)
			.await;

		let err = manager(&server)
			.create_auth_key(&AuthKeyOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, AuthKeyError::Unauthorized { status: 401 }));
	}

	#[tokio::test]
	async fn transient_failure_is_retried() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(503))
			.up_to_n_times(1)
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(200).set_body_json(key_response()))
			.expect(1)
			.mount(&server)
			.await;

		let key = manager(&server)
			.create_auth_key(&AuthKeyOptions::default())
			.await
			.unwrap();
		assert_eq!(key.id, "7");
	}

	#[tokio::test]
	async fn missing_key_is_invalid_response() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
			.mount(&server)
			.await;

		assert!(matches!(
			manager(&server).create_auth_key(&AuthKeyOptions::default()).await,
			Err(AuthKeyError::InvalidResponse(_))
		));
	}

	#[tokio::test]
	async fn unreachable_coordinator() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let manager = HeadscaleManager::new(
			Url::parse(&format!("http://{addr}")).unwrap(),
			SecretString::new("k".to_string()),
			"cumulus",
		)
		.with_retry_policy(RetryPolicy::none());

		assert!(matches!(
			manager.create_auth_key(&AuthKeyOptions::default()).await,
			Err(AuthKeyError::Unreachable { .. })
		));
	}

	#[tokio::test]
	async fn ensure_user_creates_missing_user() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api/v1/user"))
			.and(query_param("name", "cumulus"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "users": [] })))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v1/user"))
			.and(body_partial_json(serde_json::json!({ "name": "cumulus" })))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(serde_json::json!({ "user": { "id": "1", "name": "cumulus" } })),
			)
			.expect(1)
			.mount(&server)
			.await;

		let user = manager(&server).ensure_user().await.unwrap();
		assert_eq!(user.id, "1");
	}

	#[tokio::test]
	async fn ensure_user_keeps_existing_user() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api/v1/user"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"users": [{ "id": "4", "name": "cumulus" }]
			})))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v1/user"))
			.respond_with(ResponseTemplate::new(500))
			.expect(0)
			.mount(&server)
			.await;

		assert_eq!(manager(&server).ensure_user().await.unwrap().id, "4");
	}

	#[tokio::test]
	async fn auth_key_source_bootstraps_user_then_issues() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api/v1/user"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"users": [{ "id": "4", "name": "cumulus" }]
			})))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(200).set_body_json(key_response()))
			.mount(&server)
			.await;

		let key = manager(&server).auth_key(true).await.unwrap();
		assert_eq!(key.expose(), "4f1c0a0d6e0b5f5a");
	}

	#[tokio::test]
	async fn auth_key_source_requests_persistent_key_when_asked() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api/v1/user"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"users": [{ "id": "4", "name": "cumulus" }]
			})))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v1/preauthkey"))
			.and(body_partial_json(serde_json::json!({ "ephemeral": false })))
			.respond_with(ResponseTemplate::new(200).set_body_json(key_response()))
			.expect(1)
			.mount(&server)
			.await;

		manager(&server).auth_key(false).await.unwrap();
	}

	#[tokio::test]
	async fn base_url_path_prefix_is_kept() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/headscale/api/v1/preauthkey"))
			.respond_with(ResponseTemplate::new(200).set_body_json(key_response()))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/headscale/health"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "pass" })))
			.expect(1)
			.mount(&server)
			.await;

		let manager = HeadscaleManager::new(
			Url::parse(&format!("{}/headscale", server.uri())).unwrap(),
			SecretString::new("hs-api-key".to_string()),
			"cumulus",
		);
		assert_eq!(manager.base_url().path(), "/headscale/");
		manager.create_auth_key(&AuthKeyOptions::default()).await.unwrap();
		manager.health().await.unwrap();
	}

	#[tokio::test]
	async fn health_probe() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "pass" })))
			.mount(&server)
			.await;
		assert!(manager(&server).health().await.is_ok());
	}
}
