use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{AccessDescriptor, AccountSpec, PanelApi, PanelError, PanelStats};

/// Marzban tokens live for a day; renew a little earlier.
const TOKEN_TTL: Duration = Duration::from_secs(23 * 3600 + 50 * 60);

#[derive(Debug, Clone)]
pub struct MarzbanSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Base for relative subscription links. Falls back to `base_url`.
    pub subscription_prefix: Option<String>,
    /// Proxy protocols enabled on newly created accounts.
    pub proxies: Vec<String>,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

struct CachedToken {
    value: String,
    obtained: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserResponse {
    username: String,
    #[serde(default)]
    used_traffic: Option<i64>,
    #[serde(default)]
    subscription_url: Option<String>,
    #[serde(default)]
    links: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SystemResponse {
    version: Option<String>,
    total_user: i64,
    users_active: i64,
    incoming_bandwidth: i64,
    outgoing_bandwidth: i64,
}

pub struct MarzbanClient {
    http: Client,
    settings: MarzbanSettings,
    token: Mutex<Option<CachedToken>>,
}

impl MarzbanClient {
    pub fn new(settings: MarzbanSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()?;
        Ok(Self {
            http,
            settings,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url, path)
    }

    fn user_path(username: &str) -> String {
        format!("/api/user/{}", urlencoding::encode(username))
    }

    async fn login(&self) -> Result<String, PanelError> {
        let resp = self
            .http
            .post(self.url("/api/admin/token"))
            .form(&[
                ("username", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(PanelError::Unreachable(format!("login failed with {}", status)));
        }
        if !status.is_success() {
            return Err(PanelError::Rejected(format!(
                "panel refused admin credentials ({})",
                status
            )));
        }

        let body: TokenResponse = decode(resp).await?;
        info!("Authenticated against Marzban panel");
        Ok(body.access_token)
    }

    async fn token(&self) -> Result<String, PanelError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.obtained.elapsed() < TOKEN_TTL {
                return Ok(cached.value.clone());
            }
        }
        let value = self.login().await?;
        *guard = Some(CachedToken {
            value: value.clone(),
            obtained: Instant::now(),
        });
        Ok(value)
    }

    async fn forget_token(&self, rejected: &str) {
        let mut guard = self.token.lock().await;
        if guard.as_ref().is_some_and(|t| t.value == rejected) {
            *guard = None;
        }
    }

    /// Sends an authenticated request. On 401 the token is renewed and the
    /// request is repeated once; a second 401 counts as unreachable.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, PanelError> {
        let mut retried = false;
        loop {
            let token = self.token().await?;
            let mut req = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&token);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await.map_err(transport_error)?;

            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }
            if retried {
                return Err(PanelError::Unreachable(
                    "panel keeps refusing a freshly issued token".into(),
                ));
            }
            warn!("Marzban token rejected on {} {}, logging in again", method, path);
            self.forget_token(&token).await;
            retried = true;
        }
    }

    async fn get_user(&self, username: &str) -> Result<UserResponse, PanelError> {
        let resp = self.call(Method::GET, &Self::user_path(username), None).await?;
        decode(check(resp, username).await?).await
    }

    fn proxies(&self) -> Value {
        let map = self
            .settings
            .proxies
            .iter()
            .map(|p| (p.clone(), json!({})))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    fn access_for(&self, user: UserResponse) -> AccessDescriptor {
        let prefix = self
            .settings
            .subscription_prefix
            .as_deref()
            .unwrap_or(&self.settings.base_url)
            .trim_end_matches('/');
        let raw = user.subscription_url.unwrap_or_default();
        let subscription_url = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw
        } else if raw.is_empty() {
            format!("{}/sub/{}", prefix, urlencoding::encode(&user.username))
        } else {
            format!("{}/{}", prefix, raw.trim_start_matches('/'))
        };
        AccessDescriptor {
            username: user.username,
            subscription_url,
            links: user.links,
        }
    }

    async fn update_account(&self, spec: &AccountSpec) -> Result<UserResponse, PanelError> {
        let body = json!({
            "expire": spec.expire_at.timestamp(),
            "data_limit": spec.quota_bytes,
            "status": "active",
            "note": device_note(spec.device_limit),
        });
        let resp = self
            .call(Method::PUT, &Self::user_path(&spec.username), Some(&body))
            .await?;
        decode(check(resp, &spec.username).await?).await
    }

    async fn create_account(&self, spec: &AccountSpec) -> Result<UserResponse, PanelError> {
        let body = json!({
            "username": spec.username,
            "proxies": self.proxies(),
            "expire": spec.expire_at.timestamp(),
            "data_limit": spec.quota_bytes,
            "data_limit_reset_strategy": "no_reset",
            "status": "active",
            "note": device_note(spec.device_limit),
        });
        let resp = self.call(Method::POST, "/api/user", Some(&body)).await?;
        if resp.status() == StatusCode::CONFLICT {
            // Created concurrently; fall through to an update.
            return self.update_account(spec).await;
        }
        decode(check(resp, &spec.username).await?).await
    }
}

fn device_note(limit: u32) -> String {
    format!("max devices: {}", limit)
}

fn transport_error(e: reqwest::Error) -> PanelError {
    PanelError::Unreachable(e.to_string())
}

async fn check(resp: Response, username: &str) -> Result<Response, PanelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(PanelError::NotFound(username.to_string())),
        s if s.is_server_error() => Err(PanelError::Unreachable(format!("{}: {}", s, detail))),
        s => Err(PanelError::Rejected(format!("{}: {}", s, detail))),
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, PanelError> {
    resp.json::<T>()
        .await
        .map_err(|e| PanelError::Rejected(format!("unexpected panel response: {}", e)))
}

#[async_trait]
impl PanelApi for MarzbanClient {
    async fn ensure_account(&self, spec: &AccountSpec) -> Result<AccessDescriptor, PanelError> {
        let user = match self.get_user(&spec.username).await {
            Ok(_) => self.update_account(spec).await?,
            Err(PanelError::NotFound(_)) => self.create_account(spec).await?,
            Err(e) => return Err(e),
        };
        Ok(self.access_for(user))
    }

    async fn disable_account(&self, username: &str) -> Result<(), PanelError> {
        let body = json!({ "status": "disabled" });
        let resp = self
            .call(Method::PUT, &Self::user_path(username), Some(&body))
            .await?;
        match check(resp, username).await {
            Ok(_) | Err(PanelError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_usage(&self, username: &str) -> Result<i64, PanelError> {
        Ok(self.get_user(username).await?.used_traffic.unwrap_or(0))
    }

    async fn system_stats(&self) -> Result<PanelStats, PanelError> {
        let resp = self.call(Method::GET, "/api/system", None).await?;
        let sys: SystemResponse = decode(check(resp, "system").await?).await?;
        Ok(PanelStats {
            version: sys.version,
            total_users: sys.total_user,
            active_users: sys.users_active,
            incoming_bytes: sys.incoming_bandwidth,
            outgoing_bytes: sys.outgoing_bandwidth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MarzbanClient {
        MarzbanClient::new(MarzbanSettings {
            base_url: server.uri(),
            username: "admin".into(),
            password: "secret".into(),
            subscription_prefix: Some("https://sub.example.com/".into()),
            proxies: vec!["vless".into()],
            verify_ssl: true,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/api/admin/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": token, "token_type": "bearer"})),
            )
            .mount(server)
            .await;
    }

    fn spec() -> AccountSpec {
        AccountSpec {
            username: "user_42".into(),
            quota_bytes: 100 * 1024 * 1024 * 1024,
            expire_at: Utc.with_ymd_and_hms(2026, 11, 17, 12, 0, 0).unwrap(),
            device_limit: 2,
        }
    }

    #[tokio::test]
    async fn creates_missing_account_and_builds_link() {
        let server = MockServer::start().await;
        mount_login(&server, "t1").await;

        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "User not found"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/user"))
            .and(header("authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "username": "user_42",
                "used_traffic": 0,
                "subscription_url": "/sub/abcdef",
                "links": ["vless://x"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let access = client(&server).ensure_account(&spec()).await.unwrap();
        assert_eq!(access.subscription_url, "https://sub.example.com/sub/abcdef");
        assert_eq!(access.links, vec!["vless://x".to_string()]);
    }

    #[tokio::test]
    async fn updates_existing_account() {
        let server = MockServer::start().await;
        mount_login(&server, "t1").await;

        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "user_42"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/user/user_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "username": "user_42",
                "subscription_url": "https://panel.example.com/sub/zzz"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/user"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let access = client(&server).ensure_account(&spec()).await.unwrap();
        assert_eq!(access.subscription_url, "https://panel.example.com/sub/zzz");
    }

    #[tokio::test]
    async fn relogs_once_on_unauthorized() {
        let server = MockServer::start().await;
        mount_login(&server, "fresh").await;

        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"username": "user_42", "used_traffic": 1234})),
            )
            .mount(&server)
            .await;

        let used = client(&server).fetch_usage("user_42").await.unwrap();
        assert_eq!(used, 1234);
    }

    #[tokio::test]
    async fn persistent_unauthorized_is_unreachable() {
        let server = MockServer::start().await;
        mount_login(&server, "t").await;
        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).fetch_usage("user_42").await.unwrap_err();
        assert!(matches!(err, PanelError::Unreachable(_)));
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/admin/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server).system_stats().await.unwrap_err();
        assert!(matches!(err, PanelError::Rejected(_)));
    }

    #[tokio::test]
    async fn disabling_unknown_account_succeeds() {
        let server = MockServer::start().await;
        mount_login(&server, "t").await;
        Mock::given(method("PUT"))
            .and(path("/api/user/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server).disable_account("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        mount_login(&server, "t").await;
        Mock::given(method("GET"))
            .and(path("/api/user/user_42"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server).fetch_usage("user_42").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn token_is_reused_between_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/admin/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/system"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": "0.8.4",
                "total_user": 10,
                "users_active": 7,
                "incoming_bandwidth": 100,
                "outgoing_bandwidth": 200
            })))
            .mount(&server)
            .await;

        let panel = client(&server);
        let stats = panel.system_stats().await.unwrap();
        assert_eq!(stats.active_users, 7);
        panel.system_stats().await.unwrap();
    }
}
