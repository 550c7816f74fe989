#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use aliri_base64::Base64Url;
use entraid_tokens::RefreshConfig;
use redis_entraid::config::ServicePrincipalConfig;
use serde_json::json;
use url::Url;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

pub const TENANT: &str = "contoso";
pub const OBJECT_ID: &str = "9d3a1a58-4c0d-4a36-a6a3-2f6f1a2d0b7e";
pub const TOKEN_PATH: &str = "/contoso/oauth2/v2.0/token";

/// Builds an unsigned JWT issued now and valid for `ttl_secs`
pub fn jwt(ttl_secs: u64, jti: usize) -> String {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = json!({
        "iat": iat,
        "exp": iat + ttl_secs,
        "oid": OBJECT_ID,
        "jti": jti,
    });

    let header = Base64Url::from_raw(br#"{"alg":"RS256","typ":"JWT"}"#.to_vec());
    let payload = Base64Url::from_raw(claims.to_string().into_bytes());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

/// Responds with a freshly minted token on every request, counting them
pub fn minting_responder(
    counter: Arc<AtomicUsize>,
) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync + 'static {
    move |_: &Request| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": 3600,
            "access_token": jwt(3600, n),
        }))
    }
}

/// Mounts a client-credentials token endpoint for [`TENANT`]
pub async fn mount_token_endpoint(server: &MockServer) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(minting_responder(Arc::clone(&counter)))
        .mount(server)
        .await;
    counter
}

/// A service principal whose authority is the mock server
pub fn service_principal(server: &MockServer) -> ServicePrincipalConfig {
    let authority = Url::parse(&format!("{}/{}", server.uri(), TENANT))
        .unwrap_or_else(|e| panic!("mock server URI is not a URL: {}", e));
    ServicePrincipalConfig::from_secret("client-id".to_owned(), "client-secret".to_owned())
        .with_authority(authority)
}

/// A refresh configuration tolerant of a slow test host
pub fn refresh_config() -> RefreshConfig {
    RefreshConfig::default().with_request_timeout(Duration::from_secs(5))
}
