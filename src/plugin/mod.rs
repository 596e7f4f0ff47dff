//! Proxy plugin boundary — hook contract, HTTP endpoint and registration.
//!
//! The proxy calls two hooks per request:
//!
//! - **Before** runs before the request is forwarded to the origin and may
//!   short-circuit it with a ready response.
//! - **After** runs once the origin has answered, with the origin's status,
//!   body and headers attached to the [`HookRequest`].
//!
//! [`Plugin`] serves both hooks over HTTP and registers itself with the proxy:
//!
//! | Method | Path      | Body               | Answer                          |
//! |--------|-----------|--------------------|---------------------------------|
//! | `POST` | `/Before` | [`HookRequest`]    | [`HookResponse`] or `500`       |
//! | `POST` | `/After`  | [`HookRequest`]    | [`HookResponse`] or `500`       |
//! | `GET`  | `/ping`   | —                  | `pong`                          |
//!
//! A hook error is answered with `500` and `{"Error": "<message>"}` so the
//! proxy can abort or flag the request.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::http::{Method, Request, Response, StatusCode};
use crate::server::{Server, ServerError};

mod payload;
mod registrar;

pub use payload::{HookRequest, HookResponse};
pub use registrar::{Registrar, Registration};

/// Errors raised while running the plugin endpoint or talking to the proxy.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("invalid proxy address {address:?}: {reason}")]
    InvalidUpstream { address: String, reason: String },

    #[error("request to proxy failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("proxy at {address} answered with status {status}")]
    Rejected { address: String, status: u16 },
}

/// The two interception points a plugin can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Before,
    After,
}

impl Hook {
    /// Every hook, in pipeline order.
    pub const ALL: [Hook; 2] = [Hook::Before, Hook::After];

    /// The name the proxy knows this hook by.
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Before => "Before",
            Hook::After => "After",
        }
    }

    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/Before" => Some(Hook::Before),
            "/After" => Some(Hook::After),
            _ => None,
        }
    }
}

/// Request-pipeline hooks, invoked concurrently from many tasks.
///
/// Implementations mutate `res` to influence what the proxy sends back; leaving
/// it at its default passes the request through untouched.
pub trait Hooks: Send + Sync + 'static {
    /// Error surfaced to the proxy when a hook cannot complete.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs before the request reaches the origin.
    fn before(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), Self::Error>;

    /// Runs after the origin has produced a response.
    fn after(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), Self::Error>;
}

impl<H: Hooks> Hooks for Arc<H> {
    type Error = H::Error;

    fn before(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), Self::Error> {
        (**self).before(req, res)
    }

    fn after(&self, req: &HookRequest, res: &mut HookResponse) -> Result<(), Self::Error> {
        (**self).after(req, res)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    error: String,
}

/// Routes one transport request to the matching hook.
pub fn dispatch<H: Hooks>(hooks: &H, request: &Request) -> Response {
    let path = request.path();

    if path == "/ping" {
        return match request.method() {
            Method::Get | Method::Head => Response::new(StatusCode::Ok).body("pong"),
            _ => Response::new(StatusCode::MethodNotAllowed),
        };
    }

    let Some(hook) = Hook::from_path(path) else {
        return Response::new(StatusCode::NotFound).body("Not Found");
    };
    if *request.method() != Method::Post {
        return Response::new(StatusCode::MethodNotAllowed);
    }

    let req: HookRequest = match request.json() {
        Ok(req) => req,
        Err(e) => {
            warn!(hook = hook.as_str(), error = %e, "undecodable hook payload");
            return Response::json(
                StatusCode::BadRequest,
                &ErrorBody {
                    error: format!("invalid payload: {e}"),
                },
            );
        }
    };

    debug!(hook = hook.as_str(), method = %req.method, route = %req.route, "hook called");

    let mut res = HookResponse::default();
    let outcome = match hook {
        Hook::Before => hooks.before(&req, &mut res),
        Hook::After => hooks.after(&req, &mut res),
    };

    match outcome {
        Ok(()) => Response::json(StatusCode::Ok, &res),
        Err(e) => {
            error!(hook = hook.as_str(), route = %req.route, error = %e, "hook failed");
            Response::json(
                StatusCode::InternalServerError,
                &ErrorBody {
                    error: e.to_string(),
                },
            )
        }
    }
}

/// Static settings of a plugin instance.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Name announced to the proxy.
    pub name: String,
    /// Address the hook endpoint listens on, also announced to the proxy.
    pub listen: String,
    /// Base URL of the proxy's plugin registration endpoint.
    pub upstream: String,
}

/// A running hook endpoint plus its registration with the proxy.
pub struct Plugin<H> {
    config: PluginConfig,
    hooks: Arc<H>,
}

impl<H: Hooks> Plugin<H> {
    /// Creates a plugin serving `hooks`.
    pub fn new(config: PluginConfig, hooks: Arc<H>) -> Self {
        Self { config, hooks }
    }

    /// Binds the endpoint, registers with the proxy and serves until `shutdown`
    /// flips to `true`. Unregisters on the way out if registration succeeded.
    ///
    /// # Errors
    ///
    /// - [`PluginError::InvalidUpstream`] — the proxy address cannot be used.
    /// - [`PluginError::Server`] — the endpoint could not bind or its listener failed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), PluginError> {
        let registrar = Registrar::new(
            &self.config.upstream,
            Registration::new(&self.config.name, &self.config.listen, Hook::ALL),
        )?;
        let server = Server::bind(&self.config.listen).await?;
        info!(
            name = %self.config.name,
            address = %server.local_addr(),
            upstream = %self.config.upstream,
            "plugin endpoint ready"
        );

        let hooks = self.hooks;
        let handler = move |request: Request| {
            let hooks = Arc::clone(&hooks);
            async move { dispatch(&*hooks, &request) }
        };

        let (served, registered) = tokio::join!(
            server.run_until(handler, shutdown.clone()),
            registrar.register(shutdown),
        );

        if registered {
            if let Err(e) = registrar.unregister().await {
                warn!(error = %e, "failed to unregister from proxy");
            }
        }

        served.map_err(PluginError::from)
    }
}
