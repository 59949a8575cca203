//! HTTP plumbing shared by the webhook and gateway adapters.

use std::sync::OnceLock;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default header carrying the HMAC payload signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Signature-256";

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

pub fn build_client(timeout: Duration) -> Client {
    install_rustls_provider();
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Outbound HTTP authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HttpAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
    /// HMAC-SHA256 signature of the request body, hex encoded as `sha256=<digest>`.
    Hmac {
        secret: String,
        #[serde(default = "default_signature_header")]
        header: String,
    },
}

fn default_signature_header() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

/// Hex encoded HMAC-SHA256 of `payload`.
pub fn sign_payload(payload: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::config(format!("Invalid HMAC secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Custom headers plus any header-based auth.
pub fn build_headers(custom: &[(String, String)], auth: Option<&HttpAuth>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in custom {
        insert_header(&mut headers, name, value);
    }

    match auth {
        Some(HttpAuth::Bearer { token }) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        Some(HttpAuth::Header { name, value }) => insert_header(&mut headers, name, value),
        // Basic is applied on the request builder, Hmac needs the body.
        Some(HttpAuth::Basic { .. }) | Some(HttpAuth::Hmac { .. }) | None => {}
    }

    headers
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = %name, "Skipping invalid HTTP header"),
    }
}

/// POST a JSON body with headers and auth applied, mapping every failure to
/// [`Error::AdapterFailure`].
pub async fn post_json(
    client: &Client,
    url: &str,
    body: &serde_json::Value,
    custom_headers: &[(String, String)],
    auth: Option<&HttpAuth>,
    label: &str,
) -> Result<()> {
    let payload = serde_json::to_string(body)?;

    let mut request: RequestBuilder = client
        .post(url)
        .headers(build_headers(custom_headers, auth))
        .header(reqwest::header::CONTENT_TYPE, "application/json");

    match auth {
        Some(HttpAuth::Basic { username, password }) => {
            request = request.basic_auth(username, Some(password));
        }
        Some(HttpAuth::Hmac { secret, header }) => {
            let signature = sign_payload(&payload, secret)?;
            request = request.header(header.as_str(), format!("sha256={}", signature));
        }
        _ => {}
    }

    let response = request
        .body(payload)
        .send()
        .await
        .map_err(|e| Error::adapter(format!("{} request failed: {}", label, e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::adapter(format!(
            "{} returned {}: {}",
            label,
            status,
            body.chars().take(512).collect::<String>()
        )));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal one-shot HTTP responder for adapter tests.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve a single request with `status`, returning the raw request text.
    pub async fn respond_once(status: u16) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if request_complete(&buf) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (format!("http://{}/hook", addr), handle)
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        buf.len() >= header_end + 4 + content_length
    }
}
