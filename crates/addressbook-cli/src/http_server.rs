//! Address book HTTP server.
//!
//! One hyper http1 connection task per client. Each `/rest/addressbook/*`
//! request goes through the same steps:
//!
//! ```text
//! authenticate ──► acquire connection ──► pipeline ──► release ──► status + JSON
//!   (401 {})                                 │
//!                                            └─ PipelineError ──► 403 {} / 500 {}
//! ```
//!
//! Error bodies are always `{}`; details go to the log only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use addressbook_core::{AddressBook, PipelineError, PipelineResult, Principal};
use addressbook_store::{Connection, MemoryStore, Store, StoreResult};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::identity::TokenDirectory;

#[derive(Debug, Clone)]
struct ServerConfig {
    listen: SocketAddr,
    tokens: PathBuf,
    ready_file: Option<PathBuf>,
}

struct ServerState {
    book: AddressBook,
    tokens: TokenDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    Tree,
    TestData,
    TestDataDestructor,
    UserInfo,
}

impl Route {
    fn parse(method: &Method, path: &str) -> Option<Self> {
        if *method != Method::GET {
            return None;
        }
        match path {
            "/healthz" => Some(Self::Health),
            "/rest/addressbook/tree" => Some(Self::Tree),
            "/rest/addressbook/testdata" => Some(Self::TestData),
            "/rest/addressbook/testdataDestructor" => Some(Self::TestDataDestructor),
            "/rest/addressbook/userinfo" => Some(Self::UserInfo),
            _ => None,
        }
    }
}

pub(crate) fn cmd_serve(args: crate::ServeArgs) -> Result<()> {
    let tokens = args.tokens.ok_or_else(|| {
        anyhow!("serve: pass --tokens <file.json> or set ADDRESSBOOK_TOKENS")
    })?;
    let config = ServerConfig {
        listen: args.listen,
        tokens,
        ready_file: args.ready_file,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    rt.block_on(async move { serve_async(config).await })
}

async fn serve_async(config: ServerConfig) -> Result<()> {
    let tokens = TokenDirectory::load(&config.tokens)
        .map_err(|e| anyhow!("serve: {e}"))?;
    if tokens.is_empty() {
        tracing::warn!(path = %config.tokens.display(), "token file has no entries; every request will be rejected");
    }

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = Arc::new(ServerState {
        book: AddressBook::new(store),
        tokens,
    });

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {}: {e}", config.listen))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    tracing::info!(addr = %bound, tokens = state.tokens.len(), "listening");
    if let Some(path) = config.ready_file.as_ref() {
        let payload = json!({
            "version": "addressbook_server_ready_v1",
            "addr": bound.to_string(),
            "pid": std::process::id(),
        });
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|e| anyhow!("serve: failed to encode ready file: {e}"))?;
        std::fs::write(path, text)
            .map_err(|e| anyhow!("serve: failed to write {}: {e}", path.display()))?;
    }

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|e| anyhow!("serve: accept failed: {e}"))?
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let auth = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let resp = respond(&state, req.method(), req.uri().path(), auth).await;
    tracing::debug!(method = %req.method(), path = req.uri().path(), status = resp.status().as_u16(), "request");
    Ok(resp)
}

async fn respond(
    state: &ServerState,
    method: &Method,
    path: &str,
    auth: Option<&str>,
) -> Response<Full<Bytes>> {
    let Some(route) = Route::parse(method, path) else {
        return empty_json(StatusCode::NOT_FOUND);
    };
    if route == Route::Health {
        return text_response(StatusCode::OK, "ok\n");
    }

    let principal = match state.tokens.authenticate(auth) {
        Ok(principal) => principal,
        Err(e) => {
            tracing::warn!(path, error = %e, "rejected request");
            return empty_json(StatusCode::UNAUTHORIZED);
        }
    };

    if route == Route::UserInfo {
        return json_response(StatusCode::OK, principal);
    }

    let lease = match ConnectionLease::acquire(state.book.store().as_ref()).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::error!(path, error = %e, "failed to acquire a connection");
            return empty_json(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let outcome = run_pipeline(&state.book, route, lease.connection(), principal).await;
    drop(lease);

    match outcome {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => pipeline_failure(path, principal, &e),
    }
}

/// A connection held for one request. Dropping the lease hands the
/// connection back, including when the request future is cancelled.
struct ConnectionLease<'s> {
    store: &'s dyn Store,
    connection: Connection,
}

impl<'s> ConnectionLease<'s> {
    async fn acquire(store: &'s dyn Store) -> StoreResult<Self> {
        let connection = store.acquire().await?;
        Ok(Self { store, connection })
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        // Handles are plain ids; releasing a rebuilt handle frees the same slot.
        self.store.release(Connection::new(self.connection.id()));
    }
}

async fn run_pipeline(
    book: &AddressBook,
    route: Route,
    connection: &Connection,
    principal: &Principal,
) -> PipelineResult<serde_json::Value> {
    let success = || json!({ "status": "success" });
    match route {
        Route::Tree => {
            let tree = book.list_books_with_addresses(connection).await?;
            Ok(json!({ "books": tree.into_value() }))
        }
        Route::TestData => {
            book.create_sample_book(connection, &principal.user).await?;
            Ok(success())
        }
        Route::TestDataDestructor => {
            book.purge_all_books(connection, principal).await?;
            Ok(success())
        }
        Route::Health | Route::UserInfo => Ok(json!({})),
    }
}

fn pipeline_failure(path: &str, principal: &Principal, err: &PipelineError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::FORBIDDEN {
        tracing::warn!(path, user = %principal.user, kind = err.kind(), error = %err, "request denied");
    } else {
        tracing::error!(path, user = %principal.user, kind = err.kind(), error = %err, "request failed");
    }
    empty_json(status)
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))))
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{}"))))
}

fn empty_json(status: StatusCode) -> Response<Full<Bytes>> {
    json_response(status, &json!({}))
}
