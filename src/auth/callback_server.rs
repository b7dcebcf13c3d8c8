//! Loopback listener receiving the OAuth authorization redirect
//!
//! Binds `127.0.0.1` on an ephemeral port and serves `/callback` until the
//! first redirect carrying `code` or `error` arrives. The caller owns the
//! listener and must call [`CallbackServer::stop`] on every exit path; `Drop`
//! schedules a stop as a backstop.

use crate::error::{AgentError, Result};
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const SUCCESS_HTML: &str = "<!DOCTYPE html>
<html><head><title>Authentication Successful</title></head>
<body style=\"font-family:system-ui;text-align:center;padding:3em\">
<h1>&#x2705; Authentication Successful</h1>
<p>You can close this tab and return to the terminal.</p>
</body></html>
";

const ERROR_HTML: &str = "<!DOCTYPE html>
<html><head><title>Authentication Failed</title></head>
<body style=\"font-family:system-ui;text-align:center;padding:3em\">
<h1>&#x274c; Authentication Failed</h1>
<p>{error}</p>
</body></html>
";

/// What the browser redirect carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    Code { code: String, state: Option<String> },
    Error { error: String, description: Option<String> },
}

struct CallbackSlot(Mutex<Option<oneshot::Sender<CallbackResult>>>);

impl CallbackSlot {
    fn deliver(&self, result: CallbackResult) {
        let sender = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!("OAuth callback arrived after the waiter gave up");
                }
            }
            None => debug!("Ignoring repeated OAuth callback"),
        }
    }
}

async fn handle_callback(
    query: web::Query<HashMap<String, String>>,
    slot: web::Data<CallbackSlot>,
) -> HttpResponse {
    if let Some(error) = query.get("error") {
        let description = query.get("error_description").cloned();
        let shown = description.clone().unwrap_or_else(|| error.clone());
        slot.deliver(CallbackResult::Error {
            error: error.clone(),
            description,
        });
        return HttpResponse::BadRequest()
            .content_type("text/html; charset=utf-8")
            .body(ERROR_HTML.replace("{error}", &html_escape(&shown)));
    }

    let Some(code) = query.get("code") else {
        return HttpResponse::BadRequest()
            .content_type("text/html; charset=utf-8")
            .body(ERROR_HTML.replace("{error}", "Missing code parameter"));
    };

    slot.deliver(CallbackResult::Code {
        code: code.clone(),
        state: query.get("state").cloned(),
    });
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(SUCCESS_HTML)
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// A running redirect listener
pub struct CallbackServer {
    port: u16,
    handle: ServerHandle,
    receiver: Option<oneshot::Receiver<CallbackResult>>,
    stopped: bool,
}

impl CallbackServer {
    /// Bind an ephemeral loopback port and start serving `/callback`
    pub fn start() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| AgentError::auth(format!("Failed to bind OAuth callback listener: {}", e)))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let (sender, receiver) = oneshot::channel();
        let slot = web::Data::new(CallbackSlot(Mutex::new(Some(sender))));

        let server = HttpServer::new(move || {
            App::new()
                .app_data(slot.clone())
                .route("/callback", web::get().to(handle_callback))
        })
        .workers(1)
        .disable_signals()
        .shutdown_timeout(1)
        .listen(listener)
        .map_err(|e| AgentError::auth(format!("Failed to start OAuth callback listener: {}", e)))?
        .run();

        let handle = server.handle();
        tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!("OAuth callback listener exited with error: {}", e);
            }
        });

        debug!("OAuth callback listener bound on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            handle,
            receiver: Some(receiver),
            stopped: false,
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Wait for the redirect, failing with `AuthTimeout` after `limit`
    pub async fn wait(&mut self, limit: Duration) -> Result<CallbackResult> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| AgentError::auth("OAuth callback already consumed"))?;
        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(AgentError::auth("OAuth callback listener closed unexpectedly")),
            Err(_) => Err(AgentError::auth_timeout(format!(
                "No authorization redirect received within {}s",
                limit.as_secs()
            ))),
        }
    }

    /// Shut the listener down and release the port
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.handle.stop(false).await;
        debug!("OAuth callback listener on port {} stopped", self.port);
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if !self.stopped {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let handle = self.handle.clone();
                runtime.spawn(async move { handle.stop(false).await });
            }
        }
    }
}
