//! Single-shot local HTTP listener for the PKCE redirect.
//!
//! Binds an OS-assigned port (unless configured otherwise), serves exactly one
//! callback on the configured path, and reports it through a oneshot channel.
//! The server task is owned by [`CallbackListener`]: it stops on
//! [`shutdown`](CallbackListener::shutdown) or when the listener is dropped.

use crate::config::CallbackConfig;
use crate::error::{LifecycleError, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a graceful stop may take before the server task is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Query parameters of the authorization redirect
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// A validated authorization code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCode {
    pub code: String,
    pub state: String,
}

struct CallbackState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<Result<ReceivedCode>>>>,
}

/// Local redirect target for one authorization attempt.
pub struct CallbackListener {
    redirect_uri: String,
    receiver: Option<oneshot::Receiver<Result<ReceivedCode>>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Binds the listener and starts serving.
    ///
    /// Only a request carrying exactly `expected_state` yields a code.
    pub async fn bind(config: &CallbackConfig, expected_state: String) -> Result<Self> {
        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                LifecycleError::Callback(format!(
                    "failed to bind {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://{}:{}{}", config.host, port, path);

        let (sender, receiver) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(CallbackState {
            expected_state,
            sender: Mutex::new(Some(sender)),
        });
        let app = Router::new()
            .route(&path, get(handle_callback))
            .with_state(state);

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Callback server stopped with error");
            }
        });

        debug!(redirect_uri = %redirect_uri, "Callback listener bound");

        Ok(Self {
            redirect_uri,
            receiver: Some(receiver),
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// True while the server task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Waits for the callback. Expiry of `timeout` is `AuthorizationTimeout`.
    ///
    /// The wait can be repeated after a timeout; once a callback has been
    /// delivered the listener is spent.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ReceivedCode> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| LifecycleError::Flow("callback already received".to_string()))?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => {
                self.receiver = None;
                outcome
            }
            Ok(Err(_)) => {
                self.receiver = None;
                Err(LifecycleError::Callback(
                    "listener stopped before a callback arrived".to_string(),
                ))
            }
            Err(_) => Err(LifecycleError::AuthorizationTimeout {
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Stops the server and releases the port. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Callback server did not stop in time, aborting");
                task.abort();
            }
            debug!(redirect_uri = %self.redirect_uri, "Callback listener closed");
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// GET {path}?code=...&state=...
///
/// The first request is the only one that counts; later ones get 409.
async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let sender = state
        .sender
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();

    let Some(sender) = sender else {
        return page(
            StatusCode::CONFLICT,
            "Already handled",
            "This authorization request has already been processed.",
        );
    };

    let outcome = evaluate(&state.expected_state, params);
    let response = match &outcome {
        Ok(_) => page(
            StatusCode::OK,
            "Authorization successful",
            "You can close this window and return to the application.",
        ),
        Err(e) => page(StatusCode::BAD_REQUEST, "Authorization failed", &e.to_string()),
    };

    if sender.send(outcome).is_err() {
        debug!("Callback arrived after the waiter went away");
    }
    response
}

fn evaluate(expected_state: &str, params: CallbackParams) -> Result<ReceivedCode> {
    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        warn!(error = %message, "Authorization server returned an error");
        return Err(LifecycleError::AuthorizationDenied(message));
    }

    let state = params.state.unwrap_or_default();
    if state != expected_state {
        warn!("Callback state does not match the issued state");
        return Err(LifecycleError::StateMismatch);
    }

    match params.code {
        Some(code) if !code.is_empty() => Ok(ReceivedCode { code, state }),
        _ => Err(LifecycleError::Flow(
            "callback carried no authorization code".to_string(),
        )),
    }
}

fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p></body></html>",
        title = escape_html(title),
        message = escape_html(message),
    );
    (status, [(header::CONNECTION, "close")], Html(body)).into_response()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
