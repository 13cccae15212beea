//! Google Workspace directory client (Admin SDK directory and licensing APIs).

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use super::{
	decode_item, non_blank, parse_secret,
	transport::{endpoint, TokenRequest, Transport},
	DirectoryProvider, RetryPolicy, UserPatch,
};
use crate::{
	credentials::ProviderCredential,
	entity::{CanonicalEntity, CanonicalGroup, CanonicalLicense, CanonicalUser, FetchedEntity, Provider},
	error::{ProviderError, SyncResult},
};

/// Page size for directory listings
const PAGE_SIZE: &str = "500";

/// Google endpoint configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GoogleConfig {
	/// Base URL of the Admin SDK directory API
	#[serde(default = "default_api_url")]
	pub api_url: Url,
	/// Base URL of the enterprise license manager API
	#[serde(default = "default_licensing_url")]
	pub licensing_url: Url,
	/// OAuth2 token endpoint
	#[serde(default = "default_token_url")]
	pub token_url: Url,
	/// Products whose license assignments are synced
	#[serde(default = "default_product_ids")]
	pub product_ids: Vec<String>,
}

impl Default for GoogleConfig {
	fn default() -> Self {
		Self {
			api_url: default_api_url(),
			licensing_url: default_licensing_url(),
			token_url: default_token_url(),
			product_ids: default_product_ids(),
		}
	}
}

/// Default directory API base URL
#[allow(clippy::expect_used)]
fn default_api_url() -> Url {
	Url::parse("https://admin.googleapis.com/admin/directory/v1/").expect("valid default URL")
}

/// Default licensing API base URL
#[allow(clippy::expect_used)]
fn default_licensing_url() -> Url {
	Url::parse("https://licensing.googleapis.com/apps/licensing/v1/").expect("valid default URL")
}

/// Default token endpoint
#[allow(clippy::expect_used)]
fn default_token_url() -> Url {
	Url::parse("https://oauth2.googleapis.com/token").expect("valid default URL")
}

/// Google Workspace product ID
fn default_product_ids() -> Vec<String> {
	vec!["Google-Apps".to_owned()]
}

/// Refresh-token grant stored as the credential secret
#[derive(Deserialize)]
struct GoogleSecret {
	/// OAuth client ID
	client_id: String,
	/// OAuth client secret
	client_secret: String,
	/// Refresh token issued to the admin principal
	refresh_token: String,
}

/// One page of a Google listing; the item array's name varies per resource
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
	/// Items of this page
	#[serde(default, alias = "users", alias = "groups", alias = "members", alias = "items")]
	entries: Vec<Value>,
	/// Token of the next page
	next_page_token: Option<String>,
}

/// Fields of a directory user we care about
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUser {
	/// Immutable user ID
	id: String,
	/// Primary address
	primary_email: String,
	/// Name parts
	#[serde(default)]
	name: GoogleName,
	/// Whether the account is suspended
	#[serde(default)]
	suspended: bool,
	/// Organizational unit path
	org_unit_path: Option<String>,
	/// Super admin flag
	#[serde(default)]
	is_admin: bool,
	/// Organizations the user belongs to
	#[serde(default)]
	organizations: Vec<GoogleOrganization>,
}

/// Name of a directory user
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleName {
	/// First name
	#[serde(default)]
	given_name: String,
	/// Last name
	#[serde(default)]
	family_name: String,
	/// Full name
	full_name: Option<String>,
}

/// Organization entry of a directory user
#[derive(Debug, Deserialize)]
struct GoogleOrganization {
	/// Job title
	title: Option<String>,
}

/// Fields of a group we care about
#[derive(Debug, Deserialize)]
struct GoogleGroup {
	/// Immutable group ID
	id: String,
	/// Group address
	#[serde(default)]
	email: String,
	/// Display name
	#[serde(default)]
	name: String,
	/// Description
	description: Option<String>,
}

/// A group member
#[derive(Debug, Deserialize)]
struct GoogleMember {
	/// Member ID
	id: Option<String>,
	/// `USER`, `GROUP` or `CUSTOMER`
	#[serde(rename = "type", default)]
	member_type: String,
}

/// A license assignment
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseAssignment {
	/// Product ID
	product_id: String,
	/// SKU ID
	sku_id: String,
	/// SKU display name
	sku_name: Option<String>,
}

/// Aggregated assignments of one SKU
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SkuSummary {
	/// Product ID
	product_id: String,
	/// SKU ID
	sku_id: String,
	/// SKU display name
	sku_name: String,
	/// Assigned seats
	assignments: u64,
}

/// Client for one Google Workspace customer
#[derive(Debug)]
pub struct GoogleDirectory {
	/// Endpoint configuration
	config: GoogleConfig,
	/// Primary domain of the customer
	domain: String,
	/// Authenticated transport
	transport: Transport,
}

impl GoogleDirectory {
	/// Create a client. The credential secret must be a JSON refresh-token
	/// grant with `client_id`, `client_secret` and `refresh_token`.
	pub fn new(
		client: Client,
		config: GoogleConfig,
		retry: RetryPolicy,
		credential: &ProviderCredential,
	) -> SyncResult<Self> {
		let secret: GoogleSecret = parse_secret(Provider::Google, credential)?;
		let token_request = TokenRequest {
			url: config.token_url.clone(),
			form: vec![
				("grant_type", "refresh_token".to_owned()),
				("client_id", secret.client_id),
				("client_secret", secret.client_secret),
				("refresh_token", secret.refresh_token),
			],
		};
		Ok(Self {
			config,
			domain: credential.domain.clone(),
			transport: Transport::new(client, retry, token_request),
		})
	}

	/// Customer the credential belongs to; `my_customer` without a domain
	fn customer(&self) -> &str {
		if self.domain.is_empty() {
			"my_customer"
		} else {
			&self.domain
		}
	}

	/// Directory API URL scoped to this customer
	fn directory_url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
		let mut url = endpoint(&self.config.api_url, segments)?;
		if self.domain.is_empty() {
			url.query_pairs_mut().append_pair("customer", self.customer());
		} else {
			url.query_pairs_mut().append_pair("domain", &self.domain);
		}
		Ok(url)
	}

	/// Fetch every page of a listing
	async fn list_all(&self, url: Url) -> Result<Vec<Value>, ProviderError> {
		let mut entries = Vec::new();
		let mut page_token: Option<String> = None;
		loop {
			let mut page_url = url.clone();
			page_url.query_pairs_mut().append_pair("maxResults", PAGE_SIZE);
			if let Some(token) = &page_token {
				page_url.query_pairs_mut().append_pair("pageToken", token);
			}
			let page: Page = self.transport.get_json(page_url).await?;
			entries.extend(page.entries);
			match page.next_page_token {
				Some(token) if !token.is_empty() => page_token = Some(token),
				_ => return Ok(entries),
			}
		}
	}

	/// Split a license entity ID into product and SKU
	fn split_license_id(license_id: &str) -> Result<(&str, &str), ProviderError> {
		license_id.split_once('/').ok_or_else(|| ProviderError::Rejected {
			status: http::StatusCode::BAD_REQUEST,
			code: "invalidSku".to_owned(),
			message: format!("license `{license_id}` is not of the form `productId/skuId`"),
		})
	}
}

#[async_trait]
impl DirectoryProvider for GoogleDirectory {
	fn provider(&self) -> Provider {
		Provider::Google
	}

	async fn list_users(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let mut url = self.directory_url(&["users"])?;
		url.query_pairs_mut().append_pair("projection", "full");
		let users = self.list_all(url).await?;
		tracing::debug!(count = users.len(), "Fetched Google users");

		users
			.into_iter()
			.map(|raw| {
				let user: GoogleUser = decode_item(&raw)?;
				let display_name = non_blank(user.name.full_name).unwrap_or_else(|| {
					format!("{} {}", user.name.given_name, user.name.family_name).trim().to_owned()
				});
				let job_title =
					non_blank(user.organizations.into_iter().find_map(|organization| organization.title));
				Ok(FetchedEntity {
					provider_entity_id: user.id,
					canonical: CanonicalEntity::User(CanonicalUser {
						email: user.primary_email.trim().to_lowercase(),
						given_name: user.name.given_name.trim().to_owned(),
						family_name: user.name.family_name.trim().to_owned(),
						display_name,
						active: !user.suspended,
						org_unit: non_blank(user.org_unit_path),
						job_title,
						is_admin: user.is_admin,
					}),
					raw,
				})
			})
			.collect()
	}

	async fn list_groups(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let groups = self.list_all(self.directory_url(&["groups"])?).await?;
		tracing::debug!(count = groups.len(), "Fetched Google groups");

		groups
			.into_iter()
			.map(|raw| {
				let group: GoogleGroup = decode_item(&raw)?;
				Ok(FetchedEntity {
					provider_entity_id: group.id,
					canonical: CanonicalEntity::Group(CanonicalGroup {
						email: group.email.trim().to_lowercase(),
						name: group.name.trim().to_owned(),
						description: non_blank(group.description),
					}),
					raw,
				})
			})
			.collect()
	}

	async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>, ProviderError> {
		let url = endpoint(&self.config.api_url, &["groups", group_id, "members"])?;
		let members = self.list_all(url).await?;
		members
			.iter()
			.map(decode_item::<GoogleMember>)
			.filter_map(|member| match member {
				Ok(GoogleMember { id: Some(id), member_type }) if member_type == "USER" => {
					Some(Ok(id))
				}
				Ok(_) => None,
				Err(error) => Some(Err(error)),
			})
			.collect()
	}

	async fn list_license_skus(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let mut skus: BTreeMap<String, SkuSummary> = BTreeMap::new();
		for product_id in &self.config.product_ids {
			let mut url = endpoint(&self.config.licensing_url, &["product", product_id, "users"])?;
			url.query_pairs_mut().append_pair("customerId", self.customer());
			for raw in self.list_all(url).await? {
				let assignment: LicenseAssignment = decode_item(&raw)?;
				let license_id = format!("{}/{}", assignment.product_id, assignment.sku_id);
				let summary = skus.entry(license_id).or_insert_with(|| SkuSummary {
					sku_name: assignment.sku_name.clone().unwrap_or_else(|| assignment.sku_id.clone()),
					product_id: assignment.product_id,
					sku_id: assignment.sku_id,
					assignments: 0,
				});
				summary.assignments += 1;
			}
		}
		tracing::debug!(count = skus.len(), "Fetched Google license SKUs");

		skus.into_iter()
			.map(|(license_id, summary)| {
				let raw = serde_json::to_value(&summary)
					.map_err(|error| ProviderError::Decode(error.to_string()))?;
				Ok(FetchedEntity {
					provider_entity_id: license_id,
					canonical: CanonicalEntity::License(CanonicalLicense {
						sku_id: summary.sku_id,
						sku_name: summary.sku_name,
						product_id: Some(summary.product_id),
						assigned_units: summary.assignments,
						total_units: None,
					}),
					raw,
				})
			})
			.collect()
	}

	async fn update_user(&self, user_id: &str, patch: &UserPatch) -> Result<(), ProviderError> {
		let mut body = serde_json::Map::new();
		if let Some(suspended) = patch.suspended {
			body.insert("suspended".to_owned(), Value::Bool(suspended));
		}
		if let Some(org_unit) = &patch.org_unit {
			body.insert("orgUnitPath".to_owned(), Value::String(org_unit.clone()));
		}
		let url = endpoint(&self.config.api_url, &["users", user_id])?;
		self.transport.send(Method::PATCH, url, Some(&Value::Object(body))).await
	}

	async fn insert_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		let url = endpoint(&self.config.api_url, &["groups", group_id, "members"])?;
		self.transport.send(Method::POST, url, Some(&json!({"id": user_id, "role": "MEMBER"}))).await
	}

	async fn delete_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		let url = endpoint(&self.config.api_url, &["groups", group_id, "members", user_id])?;
		self.transport.send(Method::DELETE, url, None).await
	}

	async fn assign_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		let (product_id, sku_id) = Self::split_license_id(sku_id)?;
		let url =
			endpoint(&self.config.licensing_url, &["product", product_id, "sku", sku_id, "user"])?;
		self.transport.send(Method::POST, url, Some(&json!({"userId": user_id}))).await
	}

	async fn remove_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		let (product_id, sku_id) = Self::split_license_id(sku_id)?;
		let url = endpoint(
			&self.config.licensing_url,
			&["product", product_id, "sku", sku_id, "user", user_id],
		)?;
		self.transport.send(Method::DELETE, url, None).await
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use std::time::Duration;

	use wiremock::{
		matchers::{body_json, body_string_contains, method, path, query_param},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	async fn directory(server: &MockServer) -> GoogleDirectory {
		directory_for_domain(server, "example.com").await
	}

	async fn directory_for_domain(server: &MockServer, domain: &str) -> GoogleDirectory {
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=refresh_token"))
			.and(body_string_contains("refresh_token=mock_refresh"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!({"access_token": "mock_token", "expires_in": 3600})),
			)
			.mount(server)
			.await;

		let config = GoogleConfig {
			api_url: Url::parse(&format!("{}/admin/directory/v1/", server.uri())).unwrap(),
			licensing_url: Url::parse(&format!("{}/apps/licensing/v1/", server.uri())).unwrap(),
			token_url: Url::parse(&format!("{}/token", server.uri())).unwrap(),
			product_ids: vec!["Google-Apps".to_owned()],
		};
		let credential = ProviderCredential {
			secret: r#"{"client_id": "id", "client_secret": "secret", "refresh_token": "mock_refresh"}"#
				.to_owned(),
			principal: "admin@example.com".to_owned(),
			domain: domain.to_owned(),
		};
		let retry = RetryPolicy { max_attempts: 2, base_delay: Duration::from_millis(5) };
		GoogleDirectory::new(Client::new(), config, retry, &credential).expect("invalid credential")
	}

	#[test]
	fn test_malformed_secret_is_a_credential_error() {
		let credential = ProviderCredential {
			secret: "not json".to_owned(),
			principal: "admin@example.com".to_owned(),
			domain: "example.com".to_owned(),
		};
		let error = GoogleDirectory::new(
			Client::new(),
			GoogleConfig::default(),
			RetryPolicy::default(),
			&credential,
		)
		.expect_err("secret should be rejected");
		assert!(error.is_credential_error());
	}

	#[tokio::test]
	async fn test_list_users_follows_pages() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/admin/directory/v1/users"))
			.and(query_param("domain", "example.com"))
			.and(query_param("pageToken", "page2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"users": [{
					"id": "2",
					"primaryEmail": "Jane@Example.com",
					"name": {"givenName": "Jane", "familyName": "Smith"},
					"suspended": true
				}]
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/admin/directory/v1/users"))
			.and(query_param("domain", "example.com"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"users": [{
					"id": "1",
					"primaryEmail": "john@example.com",
					"name": {"givenName": "John", "familyName": "Doe", "fullName": "John Doe"},
					"orgUnitPath": "/Engineering",
					"isAdmin": true,
					"organizations": [{"title": "Engineer"}]
				}],
				"nextPageToken": "page2"
			})))
			.mount(&server)
			.await;

		let users = directory.list_users().await.expect("listing failed");
		assert_eq!(users.len(), 2);
		assert_eq!(users[0].provider_entity_id, "1");
		assert_eq!(
			users[0].canonical,
			CanonicalEntity::User(CanonicalUser {
				email: "john@example.com".to_owned(),
				given_name: "John".to_owned(),
				family_name: "Doe".to_owned(),
				display_name: "John Doe".to_owned(),
				active: true,
				org_unit: Some("/Engineering".to_owned()),
				job_title: Some("Engineer".to_owned()),
				is_admin: true,
			})
		);
		match &users[1].canonical {
			CanonicalEntity::User(user) => {
				assert_eq!(user.email, "jane@example.com");
				assert_eq!(user.display_name, "Jane Smith");
				assert!(!user.active);
			}
			other => panic!("unexpected entity: {other:?}"),
		}
		assert_eq!(users[1].raw["primaryEmail"], "Jane@Example.com");
	}

	#[tokio::test]
	async fn test_list_group_members_keeps_users_only() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/admin/directory/v1/groups/g1/members"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"members": [
					{"id": "u1", "type": "USER"},
					{"id": "g2", "type": "GROUP"},
					{"id": "u2", "type": "USER"}
				]
			})))
			.mount(&server)
			.await;

		let members = directory.list_group_members("g1").await.expect("listing failed");
		assert_eq!(members, vec!["u1".to_owned(), "u2".to_owned()]);
	}

	#[tokio::test]
	async fn test_license_assignments_are_aggregated_per_sku() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/apps/licensing/v1/product/Google-Apps/users"))
			.and(query_param("customerId", "example.com"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"items": [
					{"productId": "Google-Apps", "skuId": "1010020027", "skuName": "Business Starter", "userId": "a@example.com"},
					{"productId": "Google-Apps", "skuId": "1010020027", "skuName": "Business Starter", "userId": "b@example.com"},
					{"productId": "Google-Apps", "skuId": "1010020028", "skuName": "Business Standard", "userId": "c@example.com"}
				]
			})))
			.mount(&server)
			.await;

		let skus = directory.list_license_skus().await.expect("listing failed");
		assert_eq!(skus.len(), 2);
		assert_eq!(skus[0].provider_entity_id, "Google-Apps/1010020027");
		match &skus[0].canonical {
			CanonicalEntity::License(license) => {
				assert_eq!(license.assigned_units, 2);
				assert_eq!(license.sku_name, "Business Starter");
			}
			other => panic!("unexpected entity: {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_listings_without_domain_use_my_customer() {
		let server = MockServer::start().await;
		let directory = directory_for_domain(&server, "").await;

		Mock::given(method("GET"))
			.and(path("/admin/directory/v1/users"))
			.and(query_param("customer", "my_customer"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": []})))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/apps/licensing/v1/product/Google-Apps/users"))
			.and(query_param("customerId", "my_customer"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
			.expect(1)
			.mount(&server)
			.await;

		assert!(directory.list_users().await.expect("listing failed").is_empty());
		assert!(directory.list_license_skus().await.expect("listing failed").is_empty());
	}

	#[tokio::test]
	async fn test_suspend_user_sends_partial_patch() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("PATCH"))
			.and(path("/admin/directory/v1/users/u1"))
			.and(body_json(json!({"suspended": true})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})))
			.expect(1)
			.mount(&server)
			.await;

		directory
			.update_user("u1", &UserPatch { suspended: Some(true), org_unit: None })
			.await
			.expect("update failed");
	}

	#[tokio::test]
	async fn test_assign_license_requires_product_prefix() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("POST"))
			.and(path("/apps/licensing/v1/product/Google-Apps/sku/1010020027/user"))
			.and(body_json(json!({"userId": "a@example.com"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
			.expect(1)
			.mount(&server)
			.await;

		directory.assign_license("a@example.com", "Google-Apps/1010020027").await.expect("failed");
		let error = directory.assign_license("a@example.com", "1010020027").await.expect_err("ok");
		assert_eq!(error.status_code(), Some(400));
	}
}
