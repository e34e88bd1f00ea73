//! Tokio TCP engine.
//!
//! Accepts TCP connections and hands HTTP/1.1 requests to the hook installed
//! for their method. Connections are persistent (keep-alive) and serve one
//! request at a time; a request stays open until its [`Completion`] is
//! fulfilled, dropped, or the request timeout fires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Completion, Engine, EngineError, RequestHook};
use crate::config::BridgeConfig;
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

type HookTable = RwLock<HashMap<Method, RequestHook>>;

#[derive(Debug, Clone)]
struct Settings {
    host: String,
    request_timeout: Option<Duration>,
    max_request_size: usize,
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// HTTP/1.1 engine on a Tokio [`TcpListener`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use http_bridge::BridgeConfig;
/// use http_bridge::engine::{Completion, Engine, TcpEngine};
/// use http_bridge::http::{Method, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = TcpEngine::new(&BridgeConfig::default());
///     engine.install_handler(Method::Get, Arc::new(|_body: String, completion: Completion| {
///         completion.fulfil(StatusCode::OK, "hi".to_owned(), "text/plain");
///     }));
///     let url = engine.bind(8080)?;
///     println!("listening on {url}");
///     Ok(())
/// }
/// ```
pub struct TcpEngine {
    settings: Arc<Settings>,
    hooks: Arc<HookTable>,
    listening: Mutex<Option<Listening>>,
}

impl TcpEngine {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            settings: Arc::new(Settings {
                host: config.host.clone(),
                request_timeout: config.timeout(),
                max_request_size: config.max_request_size,
            }),
            hooks: Arc::new(RwLock::new(HashMap::new())),
            listening: Mutex::new(None),
        }
    }

    /// Returns the bound address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.local_addr)
    }

    fn listen(&self, port: u16) -> Result<(TcpListener, SocketAddr), EngineError> {
        let addr = format!("{}:{}", self.settings.host, port);
        let bind_err = |source| EngineError::Bind {
            addr: addr.clone(),
            source,
        };

        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = std_listener.local_addr().map_err(bind_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
        Ok((listener, local_addr))
    }
}

impl Engine for TcpEngine {
    fn bind(&self, port: u16) -> Result<String, EngineError> {
        let mut listening = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listening.is_some() {
            return Err(EngineError::AlreadyBound);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let _guard = runtime.enter();
        let (listener, local_addr) = self.listen(port)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.hooks),
            Arc::clone(&self.settings),
            shutdown_rx,
        ));

        info!(address = %local_addr, "engine listening");
        *listening = Some(Listening {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(format!("http://{local_addr}/"))
    }

    fn unbind(&self) {
        let listening = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listening) = listening {
            let _ = listening.shutdown.send(true);
            listening.accept_task.abort();
            info!(address = %listening.local_addr, "engine stopped listening");
        }
    }

    fn install_handler(&self, method: Method, hook: RequestHook) {
        debug!(%method, "installing request hook");
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method, hook);
    }

    fn remove_handlers(&self) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for TcpEngine {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Resolves once the engine signals shutdown, or the engine is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    listener: TcpListener,
    hooks: Arc<HookTable>,
    settings: Arc<Settings>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stopped(&mut shutdown) => break,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        debug!(peer = %peer_addr, "connection accepted");
        let hooks = Arc::clone(&hooks);
        let settings = Arc::clone(&settings);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, hooks, settings, shutdown).await {
                warn!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}

// What the read side produced for the next request on a connection.
enum Inbound {
    Request(Request),
    Reject(Response),
    Closed,
}

/// Serves one connection until the peer closes it, a request asks for
/// `Connection: close`, a request is abandoned, or the engine shuts down.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hooks: Arc<HookTable>,
    settings: Arc<Settings>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let request = match read_request(&mut stream, &mut buf, &settings, &mut shutdown).await? {
            Inbound::Request(request) => request,
            Inbound::Reject(response) => {
                stream.write_all(&response.keep_alive(false).into_bytes()).await?;
                break;
            }
            Inbound::Closed => {
                debug!(peer = %peer_addr, "connection closed");
                break;
            }
        };

        let mut keep_alive = request.is_keep_alive();
        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let Some(response) = dispatch(request, &hooks, &settings, &mut shutdown).await else {
            debug!(peer = %peer_addr, "request abandoned, closing connection");
            break;
        };
        keep_alive &= response.is_keep_alive();
        stream.write_all(&response.keep_alive(keep_alive).into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            break;
        }
    }

    Ok(())
}

/// Buffers bytes until one complete request (head and body) is available.
async fn read_request(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    settings: &Settings,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Inbound, std::io::Error> {
    loop {
        if !buf.is_empty() {
            match Request::parse(buf) {
                Ok((head, body_offset)) => {
                    let content_length = match head.content_length() {
                        Ok(len) => len,
                        Err(e) => return Ok(Inbound::Reject(bad_request(&e))),
                    };
                    let total_needed = body_offset.saturating_add(content_length);
                    if total_needed > settings.max_request_size {
                        return Ok(Inbound::Reject(too_large()));
                    }
                    if buf.len() >= total_needed {
                        let frame = buf.split_to(total_needed);
                        return Ok(Inbound::Request(head.with_body(&frame[body_offset..])));
                    }
                }
                Err(RequestError::Incomplete) => {
                    if buf.len() > settings.max_request_size {
                        return Ok(Inbound::Reject(too_large()));
                    }
                }
                Err(e) => return Ok(Inbound::Reject(bad_request(&e))),
            }
        }

        tokio::select! {
            read = stream.read_buf(buf) => {
                if read? == 0 {
                    return Ok(Inbound::Closed);
                }
            }
            _ = stopped(shutdown) => return Ok(Inbound::Closed),
        }
    }
}

/// Hands the request to its method's hook and waits for the completion.
///
/// Returns `None` when the request is abandoned.
async fn dispatch(
    request: Request,
    hooks: &HookTable,
    settings: &Settings,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Response> {
    let hook = hooks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(request.method())
        .cloned();
    let Some(hook) = hook else {
        return Some(
            Response::new(StatusCode::METHOD_NOT_ALLOWED)
                .body(format!("No handler for {}", request.method())),
        );
    };

    let (completion, rx) = Completion::pair();
    hook(request.body_text(), completion);

    let completed = async {
        match settings.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    warn!(method = %request.method(), ?limit, "request timed out waiting for a response");
                    Some(Response::new(StatusCode::GATEWAY_TIMEOUT).keep_alive(false))
                }
            },
            None => rx.await.ok(),
        }
    };

    tokio::select! {
        response = completed => response,
        _ = stopped(shutdown) => None,
    }
}

fn bad_request(e: &RequestError) -> Response {
    warn!(error = %e, "bad request, sending 400");
    Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}"))
}

fn too_large() -> Response {
    warn!("request too large, sending 413");
    Response::new(StatusCode::PAYLOAD_TOO_LARGE).body("Request entity too large")
}
