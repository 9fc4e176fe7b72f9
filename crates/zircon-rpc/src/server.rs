//! The RPC server.
//!
//! [`publish`] starts the accept loop and hands back a [`ServerHandle`]
//! whose teardown has two modes: graceful (stop accepting, drain in-flight
//! connections between requests) and kill (abort everything now). A panic
//! in the serve loop surfaces as an error value from teardown; a panic in
//! a single handler is confined to that call's response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use zircon_types::{ServerAddress, ZirconError};

use crate::error::RpcError;
use crate::service::ServiceRegistry;
use crate::socket::{recv_frame, send_frame, Listener, Socket};

/// `[service_id: u16 LE][method_id: u16 LE]` in front of every request body.
pub const REQUEST_ENVELOPE_SIZE: usize = 4;

/// Response envelope status bytes.
pub const RESPONSE_OK: u8 = 0;
pub const RESPONSE_ERR: u8 = 1;

/// Build the on-wire request envelope.
pub fn encode_request(service_id: u16, method_id: u16, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_ENVELOPE_SIZE + body.len());
    buf.put_u16_le(service_id);
    buf.put_u16_le(method_id);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn ok_response(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(RESPONSE_OK);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn err_response(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + message.len());
    buf.put_u8(RESPONSE_ERR);
    buf.extend_from_slice(message.as_bytes());
    buf.freeze()
}

/// Split a response envelope into the success body or the error message.
pub fn decode_response(payload: Bytes) -> Result<Bytes, RpcError> {
    match payload.first() {
        Some(&RESPONSE_OK) => Ok(payload.slice(1..)),
        Some(&RESPONSE_ERR) => Err(RpcError::Remote(
            String::from_utf8_lossy(&payload[1..]).into_owned(),
        )),
        _ => Err(crate::error::FrameDefect::Short(payload.len()).into()),
    }
}

/// Shutdown coordination shared by the accept loop and every connection.
///
/// The flag backs up the `Notify`: a handler that was mid-request when
/// `notify_waiters` fired re-checks it before waiting again, so graceful
/// drain never hangs on a missed wakeup.
pub(crate) struct Shutdown {
    notify: Notify,
    stopping: AtomicBool,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self {
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    fn signal(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        if self.is_stopping() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Handle to a published server.
pub struct ServerHandle {
    shutdown: Arc<Shutdown>,
    kill: Arc<AtomicBool>,
    task: JoinHandle<Result<(), RpcError>>,
    local_addr: ServerAddress,
}

impl ServerHandle {
    /// The bound address (with the resolved port).
    pub fn local_addr(&self) -> &ServerAddress {
        &self.local_addr
    }

    /// Stop the server. `kill` aborts in-flight connections immediately;
    /// otherwise they drain between requests. Returns the serve loop's
    /// termination error, with a panic converted into an error value.
    pub async fn teardown(self, kill: bool) -> Result<(), RpcError> {
        self.kill.store(kill, Ordering::SeqCst);
        self.shutdown.signal();
        match self.task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(RpcError::Panicked),
            Err(_) => Ok(()),
        }
    }
}

/// Start serving `services` on `listener`.
pub fn publish<L: Listener>(listener: L, services: Arc<ServiceRegistry>) -> ServerHandle {
    let shutdown = Arc::new(Shutdown::new());
    let kill = Arc::new(AtomicBool::new(false));
    let local_addr = listener.local_addr();
    info!(%local_addr, "server starting");

    let task = tokio::spawn(accept_loop(
        listener,
        services,
        Arc::clone(&shutdown),
        Arc::clone(&kill),
    ));

    ServerHandle {
        shutdown,
        kill,
        task,
        local_addr,
    }
}

async fn accept_loop<L: Listener>(
    listener: L,
    services: Arc<ServiceRegistry>,
    shutdown: Arc<Shutdown>,
    kill: Arc<AtomicBool>,
) -> Result<(), RpcError> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait() => {
                info!("server shutdown signal received");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok(socket) => {
                        let services = Arc::clone(&services);
                        let shutdown = Arc::clone(&shutdown);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(socket, services, shutdown).await {
                                debug!("connection finished: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        // Brief pause to avoid tight error loops.
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    if kill.load(Ordering::SeqCst) {
        connections.shutdown().await;
    } else {
        // Drain: connection handlers exit between requests.
        while connections.join_next().await.is_some() {}
    }
    Ok(())
}

pub(crate) async fn handle_connection<S: Socket>(
    socket: S,
    services: Arc<ServiceRegistry>,
    shutdown: Arc<Shutdown>,
) -> Result<(), RpcError> {
    let peer = socket.peer();
    debug!(%peer, "new connection");

    loop {
        // Check for shutdown between requests.
        let payload = tokio::select! {
            biased;

            _ = shutdown.wait() => {
                debug!(%peer, "connection shutting down");
                return Err(RpcError::Draining);
            }

            received = recv_frame(&socket) => received?,
        };

        if payload.len() < REQUEST_ENVELOPE_SIZE {
            warn!(%peer, "request too small: {} bytes", payload.len());
            send_frame(&socket, &err_response("truncated request envelope")).await?;
            continue;
        }
        let service_id = u16::from_le_bytes([payload[0], payload[1]]);
        let method_id = u16::from_le_bytes([payload[2], payload[3]]);
        let body = payload.slice(REQUEST_ENVELOPE_SIZE..);

        debug!(%peer, service_id, method_id, body_len = body.len(), "dispatching request");

        let response = match services.get(service_id) {
            Some(handler) => dispatch(handler, method_id, body).await,
            None => {
                warn!(%peer, service_id, "service not found");
                err_response(&RpcError::NoSuchService(service_id).to_string())
            }
        };

        send_frame(&socket, &response).await?;
    }
}

/// Run one handler call on its own task so a panicking handler poisons
/// only its own response.
async fn dispatch(
    handler: Arc<dyn crate::service::ServiceHandler>,
    method_id: u16,
    body: Bytes,
) -> Bytes {
    let name = handler.service_name().to_owned();
    let call = tokio::spawn(async move { handler.handle(method_id, body).await });
    match call.await {
        Ok(Ok(response)) => ok_response(&response),
        Ok(Err(e)) => {
            debug!(service = %name, method_id, error = %e, "handler returned error");
            err_response(&e.to_string())
        }
        Err(join_err) if join_err.is_panic() => {
            warn!(service = %name, method_id, "handler panicked");
            err_response(&ZirconError::internal("handler panicked").to_string())
        }
        Err(_) => err_response(&ZirconError::internal("handler cancelled").to_string()),
    }
}
