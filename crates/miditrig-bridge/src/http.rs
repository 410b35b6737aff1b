//! HTTP side of the bridge
//!
//! - Client: one outbound request per matching note trigger
//! - Server: request paths are looked up verbatim in a table of trigger
//!   URIs shared by every router that declares them

use axum::{
    extract::Query,
    http::{StatusCode, Uri},
    routing::get,
    Router,
};
use miditrig_core::{NoteEvent, NoteTrigger};
use reqwest::{Method, Url};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::router::MidiRouter;
use crate::{BridgeError, Result};

/// Issues the HTTP request configured on a note trigger
#[derive(Debug, Clone)]
pub struct HttpAction {
    client: reqwest::Client,
    /// Used only by triggers that opt out of certificate verification
    insecure_client: reqwest::Client,
}

impl HttpAction {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            insecure_client: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }

    /// Resolve the trigger URL, appending MIDI info when requested
    pub fn request_url(trigger: &NoteTrigger, event: &NoteEvent) -> Result<Url> {
        let raw = trigger.url().unwrap_or_default();
        let mut url = Url::parse(raw).map_err(|e| BridgeError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        if trigger.midi_info_in_request {
            url.query_pairs_mut()
                .append_pair("channel", &event.channel.to_string())
                .append_pair("note", &event.note.to_string())
                .append_pair("velocity", &event.velocity.to_string());
        }
        Ok(url)
    }

    pub fn method(trigger: &NoteTrigger) -> Result<Method> {
        Method::from_bytes(trigger.method().to_ascii_uppercase().as_bytes())
            .map_err(|_| BridgeError::InvalidMethod(trigger.method().to_string()))
    }

    /// Send the request. Non-2xx responses are not errors.
    pub async fn execute(
        &self,
        trigger: &NoteTrigger,
        event: &NoteEvent,
    ) -> Result<reqwest::Response> {
        let url = Self::request_url(trigger, event)?;
        let method = Self::method(trigger)?;

        let client = if trigger.insecure_skip_verify {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut request = client.request(method, url);
        for (name, value) in &trigger.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = trigger.body.as_deref().filter(|b| !b.is_empty()) {
            request = request.body(body.to_string());
        }

        Ok(request.send().await?)
    }
}

/// Outcome of offering one request to the routers sharing its path
pub async fn dispatch_request(
    routers: &[Arc<MidiRouter>],
    path: &str,
    query: &HashMap<String, String>,
) -> StatusCode {
    let mut status = StatusCode::NOT_FOUND;
    for router in routers {
        match router.on_http_request(path, query).await {
            StatusCode::INTERNAL_SERVER_ERROR => return StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::NO_CONTENT => status = StatusCode::NO_CONTENT,
            _ => {}
        }
    }
    status
}

async fn available() -> &'static str {
    "MIDI Request Trigger is available\n"
}

/// Collapse query pairs, keeping the first value of a repeated key
pub fn first_values(pairs: Vec<(String, String)>) -> HashMap<String, String> {
    let mut query = HashMap::with_capacity(pairs.len());
    for (key, value) in pairs {
        query.entry(key).or_insert(value);
    }
    query
}

/// Build the HTTP surface for all routers
///
/// Trigger URIs never enter axum's route table. They are plain strings,
/// so `:` and `*` carry no pattern meaning and a shared URI cannot
/// conflict.
pub fn build_app(routers: &[Arc<MidiRouter>], debug: bool) -> Router {
    let mut routes: BTreeMap<String, Vec<Arc<MidiRouter>>> = BTreeMap::new();
    for router in routers {
        for uri in router.config().uris() {
            if !uri.starts_with('/') {
                warn!(router = %router.name(), "Ignoring request trigger uri without leading '/': {}", uri);
                continue;
            }
            routes.entry(uri.to_string()).or_default().push(router.clone());
        }
    }

    let mut app = Router::new();
    if !routes.contains_key("/") {
        app = app.route("/", get(available));
    }

    let routes = Arc::new(routes);
    app = app.fallback(
        move |uri: Uri, Query(pairs): Query<Vec<(String, String)>>| {
            let routes = routes.clone();
            async move {
                match routes.get(uri.path()) {
                    Some(targets) => {
                        dispatch_request(targets, uri.path(), &first_values(pairs)).await
                    }
                    None => StatusCode::NOT_FOUND,
                }
            }
        },
    );

    if debug {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

/// Bind the listener so callers know the server is reachable before serving
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting http server: {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve until `shutdown` is cancelled, letting in-flight requests finish
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(url: &str) -> NoteTrigger {
        NoteTrigger {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_without_midi_info() {
        let url = HttpAction::request_url(&trigger("http://x/y"), &NoteEvent::start(0, 60, 90)).unwrap();
        assert_eq!(url.as_str(), "http://x/y");
    }

    #[test]
    fn test_url_with_midi_info_keeps_existing_query() {
        let mut t = trigger("http://x/y?scene=2");
        t.midi_info_in_request = true;
        let url = HttpAction::request_url(&t, &NoteEvent::end(1, 61)).unwrap();
        assert_eq!(url.as_str(), "http://x/y?scene=2&channel=1&note=61&velocity=0");
    }

    #[test]
    fn test_malformed_url() {
        let err = HttpAction::request_url(&trigger("::nope"), &NoteEvent::start(0, 1, 1)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidUrl { .. }));
    }

    #[test]
    fn test_method() {
        let mut t = trigger("http://x/y");
        assert_eq!(HttpAction::method(&t).unwrap(), Method::GET);
        t.method = "post".into();
        assert_eq!(HttpAction::method(&t).unwrap(), Method::POST);
        t.method = "BAD METHOD".into();
        assert!(HttpAction::method(&t).is_err());
    }

    #[test]
    fn test_first_values_keeps_first_occurrence() {
        let query = first_values(vec![
            ("note".into(), "1".into()),
            ("velocity".into(), "90".into()),
            ("note".into(), "2".into()),
        ]);
        assert_eq!(query.len(), 2);
        assert_eq!(query["note"], "1");
        assert_eq!(query["velocity"], "90");
    }
}
