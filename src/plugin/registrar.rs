//! Announcing the plugin to the proxy.
//!
//! Registration is a JSON `POST` to `<upstream>/register`; leaving is a `POST`
//! to `<upstream>/unregister` with the same payload. Only plain `http://`
//! upstreams are supported, which is what a loopback plugin endpoint uses.

use std::time::Duration;

use reqwest::{Client, Url};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use super::{Hook, PluginError};

/// Delay between registration attempts while the proxy is unreachable.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single exchange with the proxy.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the plugin tells the proxy about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Registration {
    pub name: String,
    pub address: String,
    pub methods: Vec<String>,
}

impl Registration {
    /// Creates a registration for `hooks` served at `address`.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        hooks: impl IntoIterator<Item = Hook>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            methods: hooks.into_iter().map(|h| h.as_str().to_owned()).collect(),
        }
    }
}

fn user_agent() -> &'static str {
    concat!("reproxy-cache/", env!("CARGO_PKG_VERSION"))
}

// Resolves `path` under the base path of `upstream`, keeping any prefix.
fn endpoint(upstream: &Url, path: &str) -> Url {
    let mut url = upstream.clone();
    let joined = format!("{}/{path}", upstream.path().trim_end_matches('/'));
    url.set_path(&joined);
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn parse_upstream(address: &str) -> Result<Url, PluginError> {
    let invalid = |reason: String| PluginError::InvalidUpstream {
        address: address.to_owned(),
        reason,
    };

    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" => {}
        "https" => return Err(invalid("TLS upstreams are not supported".to_owned())),
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials are not supported".to_owned()));
    }
    Ok(url)
}

/// Registers a plugin with the proxy and removes it again on shutdown.
#[derive(Debug, Clone)]
pub struct Registrar {
    client: Client,
    register_url: Url,
    unregister_url: Url,
    registration: Registration,
    retry_interval: Duration,
}

impl Registrar {
    /// Creates a registrar for the proxy at `upstream` (e.g. `http://127.0.0.1:8081`).
    ///
    /// # Errors
    ///
    /// [`PluginError::InvalidUpstream`] if the address cannot be used, or
    /// [`PluginError::Http`] if the HTTP client cannot be built.
    pub fn new(upstream: &str, registration: Registration) -> Result<Self, PluginError> {
        let upstream = parse_upstream(upstream)?;
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(EXCHANGE_TIMEOUT)
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            register_url: endpoint(&upstream, "register"),
            unregister_url: endpoint(&upstream, "unregister"),
            registration,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        })
    }

    /// Overrides the delay between failed registration attempts.
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Returns the payload sent to the proxy.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Keeps trying to register until the proxy accepts or `shutdown` fires.
    ///
    /// Returns `true` once registered, `false` if shut down first.
    pub async fn register(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            attempt += 1;

            match self.send(&self.register_url).await {
                Ok(()) => {
                    info!(
                        name = %self.registration.name,
                        upstream = %self.register_url,
                        attempt,
                        "registered with proxy"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "registration failed, retrying");
                }
            }

            tokio::select! {
                _ = time::sleep(self.retry_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Tells the proxy to stop calling this plugin. Not retried.
    ///
    /// # Errors
    ///
    /// Any [`PluginError`] from the single exchange.
    pub async fn unregister(&self) -> Result<(), PluginError> {
        self.send(&self.unregister_url).await?;
        info!(name = %self.registration.name, "unregistered from proxy");
        Ok(())
    }

    async fn send(&self, url: &Url) -> Result<(), PluginError> {
        let response = self
            .client
            .post(url.clone())
            .json(&self.registration)
            .send()
            .await?;

        let status = response.status();
        debug!(%url, %status, "proxy answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(PluginError::Rejected {
                address: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn registrar(upstream: &str) -> Registrar {
        Registrar::new(upstream, Registration::new("cache", "127.0.0.1:1", Hook::ALL)).unwrap()
    }

    #[test]
    fn endpoints_keep_base_path() {
        let r = registrar("http://127.0.0.1:8081");
        assert_eq!(r.register_url.as_str(), "http://127.0.0.1:8081/register");
        assert_eq!(r.unregister_url.as_str(), "http://127.0.0.1:8081/unregister");

        let r = registrar("http://proxy.local/plugins/");
        assert_eq!(r.register_url.as_str(), "http://proxy.local/plugins/register");

        let r = registrar("http://proxy.local/plugins?x=1");
        assert_eq!(r.unregister_url.as_str(), "http://proxy.local/plugins/unregister");
    }

    #[test]
    fn rejects_unusable_upstreams() {
        for bad in [
            "https://proxy:443",
            "http://",
            "host:port",
            "not a url",
            "http://user:pw@host:81",
            "http://user@host",
        ] {
            let res = Registrar::new(bad, Registration::new("cache", "x", Hook::ALL));
            assert!(
                matches!(res, Err(PluginError::InvalidUpstream { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn registration_payload() {
        let reg = Registration::new("cache", "0.0.0.0:8080", Hook::ALL);
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Name": "cache",
                "Address": "0.0.0.0:8080",
                "Methods": ["Before", "After"]
            })
        );
    }

    // Accepts one connection, records the request and answers `status`.
    async fn one_shot_proxy(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let declared: usize = text[..pos]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().to_owned())
                        })
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    if buf.len() >= pos + 4 + declared {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let answer =
                format!("HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            stream.write_all(answer.as_bytes()).await.unwrap();
            String::from_utf8(buf).unwrap()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn register_posts_json_payload() {
        let (upstream, proxy) = one_shot_proxy(200).await;
        let registrar = registrar(&upstream);
        let (_tx, rx) = watch::channel(false);

        assert!(registrar.register(rx).await);

        let seen = proxy.await.unwrap();
        assert!(seen.starts_with("POST /register HTTP/1.1\r\n"));
        assert!(seen.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(seen.ends_with(r#"{"Name":"cache","Address":"127.0.0.1:1","Methods":["Before","After"]}"#));
    }

    #[tokio::test]
    async fn unregister_reports_rejection() {
        let (upstream, proxy) = one_shot_proxy(503).await;
        let registrar = registrar(&upstream);

        let err = registrar.unregister().await.unwrap_err();
        assert!(matches!(err, PluginError::Rejected { status: 503, .. }));
        assert!(proxy.await.unwrap().starts_with("POST /unregister "));
    }

    #[tokio::test]
    async fn register_gives_up_on_shutdown() {
        // Nothing listens on this port once the listener is dropped.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let registrar = registrar(&format!("http://{addr}"))
            .with_retry_interval(Duration::from_millis(20));

        let (tx, rx) = watch::channel(false);
        let attempt = tokio::spawn(async move { registrar.register(rx).await });
        time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let registered = time::timeout(Duration::from_secs(5), attempt)
            .await
            .unwrap()
            .unwrap();
        assert!(!registered);
    }
}
