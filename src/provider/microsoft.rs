//! Microsoft Graph directory client.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
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

/// Properties requested for users
const USER_SELECT: &str =
	"id,userPrincipalName,mail,givenName,surname,displayName,accountEnabled,department,jobTitle";
/// Properties requested for groups
const GROUP_SELECT: &str = "id,displayName,mail,description";
/// Largest page size Graph accepts for directory objects
const PAGE_SIZE: &str = "999";
/// OData type of user directory objects
const USER_ODATA_TYPE: &str = "#microsoft.graph.user";

/// Microsoft Graph endpoint configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MicrosoftConfig {
	/// Base URL of the Graph API, including the version
	#[serde(default = "default_graph_url")]
	pub graph_url: Url,
	/// Base URL of the identity platform token service
	#[serde(default = "default_login_url")]
	pub login_url: Url,
}

impl Default for MicrosoftConfig {
	fn default() -> Self {
		Self { graph_url: default_graph_url(), login_url: default_login_url() }
	}
}

/// Default Graph base URL
#[allow(clippy::expect_used)]
fn default_graph_url() -> Url {
	Url::parse("https://graph.microsoft.com/v1.0/").expect("valid default URL")
}

/// Default login base URL
#[allow(clippy::expect_used)]
fn default_login_url() -> Url {
	Url::parse("https://login.microsoftonline.com/").expect("valid default URL")
}

/// Client-credentials grant stored as the credential secret
#[derive(Deserialize)]
struct GraphSecret {
	/// Application (client) ID
	client_id: String,
	/// Client secret
	client_secret: String,
}

/// One page of an OData collection
#[derive(Debug, Deserialize)]
struct ODataPage {
	/// Items of this page
	#[serde(default)]
	value: Vec<Value>,
	/// Absolute URL of the next page
	#[serde(rename = "@odata.nextLink")]
	next_link: Option<String>,
}

/// Fields of a Graph user we care about
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
	/// Object ID
	id: String,
	/// Sign-in name
	user_principal_name: String,
	/// Mail address, absent for unlicensed accounts
	mail: Option<String>,
	/// First name
	given_name: Option<String>,
	/// Last name
	surname: Option<String>,
	/// Display name
	display_name: Option<String>,
	/// Whether sign-in is allowed
	#[serde(default = "enabled_by_default")]
	account_enabled: bool,
	/// Department
	department: Option<String>,
	/// Job title
	job_title: Option<String>,
}

/// Graph omits `accountEnabled` for accounts that were never disabled
fn enabled_by_default() -> bool {
	true
}

/// Fields of a Graph group we care about
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphGroup {
	/// Object ID
	id: String,
	/// Display name
	display_name: Option<String>,
	/// Mail address of mail-enabled groups
	mail: Option<String>,
	/// Description
	description: Option<String>,
}

/// A group member directory object
#[derive(Debug, Deserialize)]
struct GraphMember {
	/// Object ID
	id: String,
	/// Object type
	#[serde(rename = "@odata.type", default)]
	odata_type: String,
}

/// A subscribed SKU
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribedSku {
	/// SKU ID
	sku_id: String,
	/// SKU part number, e.g. `ENTERPRISEPACK`
	sku_part_number: String,
	/// Seats in use
	#[serde(default)]
	consumed_units: u64,
	/// Purchased seats
	prepaid_units: Option<PrepaidUnits>,
}

/// Seat counts of a SKU
#[derive(Debug, Deserialize)]
struct PrepaidUnits {
	/// Active seats
	#[serde(default)]
	enabled: u64,
}

/// Client for one Entra ID tenant
#[derive(Debug)]
pub struct GraphDirectory {
	/// Endpoint configuration
	config: MicrosoftConfig,
	/// Authenticated transport
	transport: Transport,
}

impl GraphDirectory {
	/// Create a client. The credential secret must be a JSON
	/// client-credentials grant with `client_id` and `client_secret`; the
	/// credential's domain is used as the tenant.
	pub fn new(
		client: Client,
		config: MicrosoftConfig,
		retry: RetryPolicy,
		credential: &ProviderCredential,
	) -> SyncResult<Self> {
		let secret: GraphSecret = parse_secret(Provider::Microsoft, credential)?;
		let token_url =
			endpoint(&config.login_url, &[credential.domain.as_str(), "oauth2", "v2.0", "token"])?;
		let scope = format!("{}/.default", config.graph_url.origin().ascii_serialization());
		let token_request = TokenRequest {
			url: token_url,
			form: vec![
				("grant_type", "client_credentials".to_owned()),
				("client_id", secret.client_id),
				("client_secret", secret.client_secret),
				("scope", scope),
			],
		};
		Ok(Self { config, transport: Transport::new(client, retry, token_request) })
	}

	/// Graph URL for a resource path
	fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
		endpoint(&self.config.graph_url, segments)
	}

	/// Fetch every page of a collection by following `@odata.nextLink`
	async fn list_all(&self, url: Url) -> Result<Vec<Value>, ProviderError> {
		let mut entries = Vec::new();
		let mut next = Some(url);
		while let Some(url) = next {
			let page: ODataPage = self.transport.get_json(url).await?;
			entries.extend(page.value);
			next = match page.next_link {
				Some(link) => Some(
					Url::parse(&link)
						.map_err(|error| ProviderError::Decode(format!("invalid nextLink: {error}")))?,
				),
				None => None,
			};
		}
		Ok(entries)
	}

	/// Collection URL with `$select` and `$top`
	fn collection_url(&self, resource: &str, select: &str) -> Result<Url, ProviderError> {
		let mut url = self.url(&[resource])?;
		url.query_pairs_mut().append_pair("$select", select).append_pair("$top", PAGE_SIZE);
		Ok(url)
	}

	/// Post an `assignLicense` request
	async fn change_license(&self, user_id: &str, body: Value) -> Result<(), ProviderError> {
		let url = self.url(&["users", user_id, "assignLicense"])?;
		self.transport.send(Method::POST, url, Some(&body)).await
	}
}

#[async_trait]
impl DirectoryProvider for GraphDirectory {
	fn provider(&self) -> Provider {
		Provider::Microsoft
	}

	async fn list_users(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let users = self.list_all(self.collection_url("users", USER_SELECT)?).await?;
		tracing::debug!(count = users.len(), "Fetched Graph users");

		users
			.into_iter()
			.map(|raw| {
				let user: GraphUser = decode_item(&raw)?;
				let given_name = non_blank(user.given_name).unwrap_or_default();
				let family_name = non_blank(user.surname).unwrap_or_default();
				let display_name = non_blank(user.display_name)
					.unwrap_or_else(|| format!("{given_name} {family_name}").trim().to_owned());
				let email = non_blank(user.mail).unwrap_or(user.user_principal_name);
				Ok(FetchedEntity {
					provider_entity_id: user.id,
					canonical: CanonicalEntity::User(CanonicalUser {
						email: email.trim().to_lowercase(),
						given_name,
						family_name,
						display_name,
						active: user.account_enabled,
						org_unit: non_blank(user.department),
						job_title: non_blank(user.job_title),
						is_admin: false,
					}),
					raw,
				})
			})
			.collect()
	}

	async fn list_groups(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let groups = self.list_all(self.collection_url("groups", GROUP_SELECT)?).await?;
		tracing::debug!(count = groups.len(), "Fetched Graph groups");

		groups
			.into_iter()
			.map(|raw| {
				let group: GraphGroup = decode_item(&raw)?;
				Ok(FetchedEntity {
					provider_entity_id: group.id,
					canonical: CanonicalEntity::Group(CanonicalGroup {
						email: non_blank(group.mail).unwrap_or_default().to_lowercase(),
						name: non_blank(group.display_name).unwrap_or_default(),
						description: non_blank(group.description),
					}),
					raw,
				})
			})
			.collect()
	}

	async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>, ProviderError> {
		let mut url = self.url(&["groups", group_id, "members"])?;
		url.query_pairs_mut().append_pair("$select", "id").append_pair("$top", PAGE_SIZE);
		let members = self.list_all(url).await?;
		members
			.iter()
			.map(decode_item::<GraphMember>)
			.filter_map(|member| match member {
				Ok(member) if member.odata_type == USER_ODATA_TYPE => Some(Ok(member.id)),
				Ok(_) => None,
				Err(error) => Some(Err(error)),
			})
			.collect()
	}

	async fn list_license_skus(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		let skus = self.list_all(self.url(&["subscribedSkus"])?).await?;
		tracing::debug!(count = skus.len(), "Fetched Graph subscribed SKUs");

		skus.into_iter()
			.map(|raw| {
				let sku: SubscribedSku = decode_item(&raw)?;
				Ok(FetchedEntity {
					provider_entity_id: sku.sku_id.clone(),
					canonical: CanonicalEntity::License(CanonicalLicense {
						sku_id: sku.sku_id,
						sku_name: sku.sku_part_number,
						product_id: None,
						assigned_units: sku.consumed_units,
						total_units: sku.prepaid_units.map(|units| units.enabled),
					}),
					raw,
				})
			})
			.collect()
	}

	async fn update_user(&self, user_id: &str, patch: &UserPatch) -> Result<(), ProviderError> {
		let mut body = serde_json::Map::new();
		if let Some(suspended) = patch.suspended {
			body.insert("accountEnabled".to_owned(), Value::Bool(!suspended));
		}
		if let Some(department) = &patch.org_unit {
			body.insert("department".to_owned(), Value::String(department.clone()));
		}
		let url = self.url(&["users", user_id])?;
		self.transport.send(Method::PATCH, url, Some(&Value::Object(body))).await
	}

	async fn insert_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		let url = self.url(&["groups", group_id, "members", "$ref"])?;
		let member = self.url(&["directoryObjects", user_id])?;
		self.transport.send(Method::POST, url, Some(&json!({"@odata.id": member.as_str()}))).await
	}

	async fn delete_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		let url = self.url(&["groups", group_id, "members", user_id, "$ref"])?;
		self.transport.send(Method::DELETE, url, None).await
	}

	async fn assign_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		self.change_license(
			user_id,
			json!({"addLicenses": [{"skuId": sku_id, "disabledPlans": []}], "removeLicenses": []}),
		)
		.await
	}

	async fn remove_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		self.change_license(user_id, json!({"addLicenses": [], "removeLicenses": [sku_id]})).await
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use std::time::Duration;

	use http::StatusCode;
	use wiremock::{
		matchers::{body_json, body_string_contains, method, path, query_param},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;
	use crate::dispatch::{dispatch, BatchOptions, Mutation, Operation};

	async fn directory(server: &MockServer) -> GraphDirectory {
		Mock::given(method("POST"))
			.and(path("/login/contoso.onmicrosoft.com/oauth2/v2.0/token"))
			.and(body_string_contains("grant_type=client_credentials"))
			.and(body_string_contains("client_id=mock_client_id"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!({"access_token": "mock_token", "token_type": "Bearer"})),
			)
			.mount(server)
			.await;

		let config = MicrosoftConfig {
			graph_url: Url::parse(&format!("{}/v1.0/", server.uri())).unwrap(),
			login_url: Url::parse(&format!("{}/login/", server.uri())).unwrap(),
		};
		let credential = ProviderCredential {
			secret: r#"{"client_id": "mock_client_id", "client_secret": "mock_secret"}"#.to_owned(),
			principal: "admin@contoso.com".to_owned(),
			domain: "contoso.onmicrosoft.com".to_owned(),
		};
		let retry = RetryPolicy { max_attempts: 2, base_delay: Duration::from_millis(5) };
		GraphDirectory::new(Client::new(), config, retry, &credential).expect("invalid credential")
	}

	#[tokio::test]
	async fn test_list_users_follows_next_link() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/v1.0/users"))
			.and(query_param("$skiptoken", "abc"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"value": [{
					"id": "u2",
					"userPrincipalName": "Adele@contoso.com",
					"givenName": "Adele",
					"surname": "Vance",
					"accountEnabled": false
				}]
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1.0/users"))
			.and(query_param("$top", "999"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"value": [{
					"id": "u1",
					"userPrincipalName": "megan@contoso.com",
					"mail": "Megan.Bowen@contoso.com",
					"givenName": "Megan",
					"surname": "Bowen",
					"displayName": "Megan Bowen",
					"department": "Marketing",
					"jobTitle": "Marketing Manager"
				}],
				"@odata.nextLink": format!("{}/v1.0/users?$skiptoken=abc", server.uri())
			})))
			.mount(&server)
			.await;

		let users = directory.list_users().await.expect("listing failed");
		assert_eq!(users.len(), 2);
		match (&users[0].canonical, &users[1].canonical) {
			(CanonicalEntity::User(megan), CanonicalEntity::User(adele)) => {
				assert_eq!(megan.email, "megan.bowen@contoso.com");
				assert!(megan.active);
				assert_eq!(megan.org_unit.as_deref(), Some("Marketing"));
				assert_eq!(adele.email, "adele@contoso.com");
				assert_eq!(adele.display_name, "Adele Vance");
				assert!(!adele.active);
			}
			other => panic!("unexpected entities: {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_list_group_members_keeps_users_only() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/v1.0/groups/g1/members"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"value": [
					{"@odata.type": "#microsoft.graph.user", "id": "u1"},
					{"@odata.type": "#microsoft.graph.group", "id": "g2"},
					{"@odata.type": "#microsoft.graph.device", "id": "d1"}
				]
			})))
			.mount(&server)
			.await;

		let members = directory.list_group_members("g1").await.expect("listing failed");
		assert_eq!(members, vec!["u1".to_owned()]);
	}

	#[tokio::test]
	async fn test_subscribed_skus() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("GET"))
			.and(path("/v1.0/subscribedSkus"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"value": [{
					"skuId": "6fd2c87f-b296-42f0-b197-1e91e994b900",
					"skuPartNumber": "ENTERPRISEPACK",
					"consumedUnits": 14,
					"prepaidUnits": {"enabled": 25, "suspended": 0, "warning": 0}
				}]
			})))
			.mount(&server)
			.await;

		let skus = directory.list_license_skus().await.expect("listing failed");
		assert_eq!(skus.len(), 1);
		assert_eq!(
			skus[0].canonical,
			CanonicalEntity::License(CanonicalLicense {
				sku_id: "6fd2c87f-b296-42f0-b197-1e91e994b900".to_owned(),
				sku_name: "ENTERPRISEPACK".to_owned(),
				product_id: None,
				assigned_units: 14,
				total_units: Some(25),
			})
		);
	}

	#[tokio::test]
	async fn test_add_member_posts_reference() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("POST"))
			.and(path("/v1.0/groups/g1/members/$ref"))
			.and(body_json(json!({
				"@odata.id": format!("{}/v1.0/directoryObjects/u1", server.uri())
			})))
			.respond_with(ResponseTemplate::new(204))
			.expect(1)
			.mount(&server)
			.await;

		directory.insert_group_member("g1", "u1").await.expect("add failed");
	}

	#[tokio::test]
	async fn test_duplicate_member_reports_already_exists() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("POST"))
			.and(path("/v1.0/groups/g1/members/$ref"))
			.respond_with(ResponseTemplate::new(400).set_body_json(json!({
				"error": {
					"code": "Request_BadRequest",
					"message": "One or more added object references already exist for the following modified properties: 'members'."
				}
			})))
			.mount(&server)
			.await;

		let error = directory.insert_group_member("g1", "u1").await.expect_err("should fail");
		assert!(error.is_already_exists());
		assert_eq!(error.status_code(), Some(StatusCode::BAD_REQUEST.as_u16()));
	}

	#[tokio::test]
	async fn test_denied_member_keeps_forbidden_status_in_dispatch() {
		let server = MockServer::start().await;
		let directory = directory(&server).await;

		Mock::given(method("POST"))
			.and(path("/v1.0/groups/g1/members/$ref"))
			.respond_with(ResponseTemplate::new(403).set_body_json(json!({
				"error": {
					"code": "Authorization_RequestDenied",
					"message": "Insufficient privileges to complete the operation."
				}
			})))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1.0/groups/g2/members/$ref"))
			.respond_with(ResponseTemplate::new(204))
			.expect(1)
			.mount(&server)
			.await;

		let operations = vec![
			Operation {
				id: "op1".to_owned(),
				mutation: Mutation::AddGroupMember {
					group_id: "g1".to_owned(),
					user_id: "u1".to_owned(),
				},
			},
			Operation {
				id: "op2".to_owned(),
				mutation: Mutation::AddGroupMember {
					group_id: "g2".to_owned(),
					user_id: "u1".to_owned(),
				},
			},
		];
		let options = BatchOptions {
			per_item_stagger: Duration::ZERO,
			inter_batch_delay: Duration::ZERO,
			..BatchOptions::default()
		};
		let result = dispatch(&directory, &operations, &options, None).await;

		assert_eq!(result.success_count, 1);
		assert_eq!(result.failure_count, 1);
		assert!(!result.results[0].success);
		assert_eq!(result.results[0].status_code, Some(StatusCode::FORBIDDEN.as_u16()));
		assert!(result.results[1].success);
	}
}
