// Copyright 2018-2026 the Vela authors. MIT license.

//! Default transport behind the service isolate: a websocket server that
//! proxies connections from diagnostic clients to registered session
//! targets. Messages are opaque strings; the service protocol they encode
//! is not this crate's business.

use core::convert::Infallible as Never;
use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::pin;
use std::process;
use std::rc::Rc;
use std::thread;

use anyhow::anyhow;
use anyhow::Context as ErrorContext;
use fastwebsockets::Frame;
use fastwebsockets::OpCode;
use fastwebsockets::WebSocket;
use futures::channel::mpsc;
use futures::channel::mpsc::UnboundedReceiver;
use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot;
use futures::future;
use futures::future::Future;
use futures::prelude::*;
use futures::select;
use futures::stream::StreamExt;
use futures::task::Poll;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;
use url::Url;
use uuid::Uuid;
use vela_core::error::AnyError;
use vela_core::ServiceTransport;
use vela_core::TransportConfig;

use crate::tokio_util::create_basic_runtime;

/// One accepted diagnostic client session. `tx` carries messages to the
/// client, `rx` messages from it.
pub struct SessionProxy {
  pub tx: UnboundedSender<String>,
  pub rx: UnboundedReceiver<String>,
}

/// Returned from [`ServiceServer::register_session_target`]. New client
/// sessions arrive on `sessions`; dropping the handle deregisters the
/// target.
pub struct SessionTargetHandle {
  pub sessions: UnboundedReceiver<SessionProxy>,
  _deregister: oneshot::Sender<()>,
}

/// A session target registered with the server, as seen from the server
/// thread.
struct SessionTarget {
  uuid: Uuid,
  thread_name: Option<String>,
  new_session_tx: UnboundedSender<SessionProxy>,
  deregister_rx: oneshot::Receiver<()>,
  url: String,
}

impl SessionTarget {
  fn get_json_metadata(&self, host: &str) -> Value {
    json!({
      "description": "vela",
      "id": self.uuid.to_string(),
      "title": self.get_title(),
      "type": "vela",
      "url": self.url.to_string(),
      "webSocketDebuggerUrl": self.get_websocket_debugger_url(host),
    })
  }

  fn get_websocket_debugger_url(&self, host: &str) -> String {
    format!("ws://{}/ws/{}", host, &self.uuid)
  }

  fn get_title(&self) -> String {
    format!(
      "vela{} [pid: {}]",
      self
        .thread_name
        .as_ref()
        .map(|n| format!(" - {n}"))
        .unwrap_or_default(),
      process::id(),
    )
  }
}

struct ServerHandle {
  shutdown_tx: oneshot::Sender<()>,
  thread_handle: thread::JoinHandle<()>,
}

/// Websocket server proxying diagnostic clients to session targets. Binds
/// at startup time so a failure to take the configured port is reported to
/// the caller, which treats it as fatal.
pub struct ServiceServer {
  register_tx: UnboundedSender<SessionTarget>,
  register_rx: Mutex<Option<UnboundedReceiver<SessionTarget>>>,
  server: Mutex<Option<ServerHandle>>,
  local_addr: Mutex<Option<SocketAddr>>,
}

impl Default for ServiceServer {
  fn default() -> Self {
    Self::new()
  }
}

impl ServiceServer {
  pub fn new() -> Self {
    let (register_tx, register_rx) = mpsc::unbounded::<SessionTarget>();
    Self {
      register_tx,
      register_rx: Mutex::new(Some(register_rx)),
      server: Mutex::new(None),
      local_addr: Mutex::new(None),
    }
  }

  /// The address actually bound, available once startup succeeded.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.local_addr.lock()
  }

  /// Registers a target clients can connect to. Registration is accepted
  /// before and after startup; targets registered early are announced once
  /// the server runs.
  pub fn register_session_target(&self, url: String) -> SessionTargetHandle {
    let (new_session_tx, sessions) = mpsc::unbounded::<SessionProxy>();
    let (deregister_tx, deregister_rx) = oneshot::channel();
    let target = SessionTarget {
      uuid: Uuid::new_v4(),
      thread_name: thread::current().name().map(|n| n.to_owned()),
      new_session_tx,
      deregister_rx,
      url,
    };
    self
      .register_tx
      .unbounded_send(target)
      .expect("service server thread is gone");
    SessionTargetHandle {
      sessions,
      _deregister: deregister_tx,
    }
  }
}

impl ServiceTransport for ServiceServer {
  fn startup(&self, config: &TransportConfig) -> Result<(), AnyError> {
    let register_rx = self
      .register_rx
      .lock()
      .take()
      .context("service transport already started")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (bind_tx, bind_rx) = std::sync::mpsc::channel();
    let addr = config.addr;
    let disable_origin_check = config.disable_origin_check;

    let thread_handle = thread::Builder::new()
      .name("vela-vm-service".to_string())
      .spawn(move || {
        let rt = create_basic_runtime();
        let local = tokio::task::LocalSet::new();
        local.block_on(
          &rt,
          server(addr, register_rx, shutdown_rx, bind_tx, disable_origin_check),
        )
      })?;

    let local_addr = bind_rx
      .recv()
      .map_err(|_| anyhow!("service transport thread exited before binding"))?
      .context("cannot bind the service transport")?;
    *self.local_addr.lock() = Some(local_addr);
    *self.server.lock() = Some(ServerHandle {
      shutdown_tx,
      thread_handle,
    });
    eprintln!("Vela VM service listening on http://{local_addr}/");
    Ok(())
  }

  fn shutdown(&self) {
    if let Some(handle) = self.server.lock().take() {
      let _ = handle.shutdown_tx.send(());
      handle
        .thread_handle
        .join()
        .expect("unable to join the service transport thread");
    }
  }
}

impl Drop for ServiceServer {
  fn drop(&mut self) {
    ServiceTransport::shutdown(self);
  }
}

// Needed so hyper can use non Send futures
#[derive(Clone)]
struct LocalExecutor;

impl<Fut> hyper::rt::Executor<Fut> for LocalExecutor
where
  Fut: Future + 'static,
  Fut::Output: 'static,
{
  fn execute(&self, fut: Fut) {
    tokio::task::spawn_local(fut);
  }
}

/// Loopback-only origin policy: diagnostic clients connect locally, and a
/// browser page from some other origin must not be able to drive the
/// protocol through DNS rebinding.
fn host_is_trusted(
  req: &http::Request<hyper::Body>,
  disable_origin_check: bool,
) -> bool {
  if disable_origin_check {
    return true;
  }
  let trusted = |value: &str| -> bool {
    Url::parse(&format!("http://{value}"))
      .ok()
      .and_then(|url| url.host_str().map(|h| h.to_string()))
      .map(|host| {
        host == "localhost" || host == "127.0.0.1" || host == "[::1]"
      })
      .unwrap_or(false)
  };
  let host_ok = match req.headers().get("host").and_then(|h| h.to_str().ok())
  {
    Some(host) => trusted(host),
    None => true,
  };
  let origin_ok = match req
    .headers()
    .get("origin")
    .and_then(|o| o.to_str().ok())
    .and_then(|o| Url::parse(o).ok())
  {
    Some(origin) => origin
      .host_str()
      .map(|host| {
        host == "localhost" || host == "127.0.0.1" || host == "::1"
      })
      .unwrap_or(false),
    None => true,
  };
  host_ok && origin_ok
}

fn handle_ws_request(
  req: http::Request<hyper::Body>,
  targets_rc: Rc<RefCell<HashMap<Uuid, SessionTarget>>>,
) -> http::Result<http::Response<hyper::Body>> {
  let (parts, body) = req.into_parts();
  let req = http::Request::from_parts(parts, ());

  let maybe_uuid = req
    .uri()
    .path()
    .strip_prefix("/ws/")
    .and_then(|s| Uuid::parse_str(s).ok());

  if maybe_uuid.is_none() {
    return http::Response::builder()
      .status(http::StatusCode::BAD_REQUEST)
      .body("Malformed session target UUID".into());
  }

  // run in a block to not hold borrow to `targets` for too long
  let new_session_tx = {
    let targets = targets_rc.borrow();
    let maybe_target = targets.get(&maybe_uuid.unwrap());

    if maybe_target.is_none() {
      return http::Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .body("Invalid session target UUID".into());
    }

    maybe_target.unwrap().new_session_tx.clone()
  };
  let (parts, _) = req.into_parts();
  let mut req = http::Request::from_parts(parts, body);

  let (resp, fut) = match fastwebsockets::upgrade::upgrade(&mut req) {
    Ok(e) => e,
    _ => {
      return http::Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .body("Not a valid Websocket Request".into());
    }
  };

  // spawn a task that will wait for websocket connection and then pump
  // messages between the socket and the session target
  tokio::task::spawn_local(async move {
    let websocket = if let Ok(w) = fut.await {
      w
    } else {
      eprintln!("Service server failed to upgrade to WS connection");
      return;
    };

    // The 'outbound' channel carries messages sent to the websocket.
    let (outbound_tx, outbound_rx) = mpsc::unbounded();
    // The 'inbound' channel carries messages received from the websocket.
    let (inbound_tx, inbound_rx) = mpsc::unbounded();

    let session_proxy = SessionProxy {
      tx: outbound_tx,
      rx: inbound_rx,
    };

    eprintln!("Service protocol session started.");
    let _ = new_session_tx.unbounded_send(session_proxy);
    pump_websocket_messages(websocket, inbound_tx, outbound_rx).await;
  });

  Ok(resp)
}

fn handle_json_request(
  targets: Rc<RefCell<HashMap<Uuid, SessionTarget>>>,
  host: String,
) -> http::Result<http::Response<hyper::Body>> {
  let data = targets
    .borrow()
    .values()
    .map(move |target| target.get_json_metadata(&host))
    .collect::<Vec<_>>();
  http::Response::builder()
    .status(http::StatusCode::OK)
    .header(http::header::CONTENT_TYPE, "application/json")
    .body(serde_json::to_string(&data).unwrap().into())
}

fn handle_json_version_request(
  version_response: Value,
) -> http::Result<http::Response<hyper::Body>> {
  http::Response::builder()
    .status(http::StatusCode::OK)
    .header(http::header::CONTENT_TYPE, "application/json")
    .body(serde_json::to_string(&version_response).unwrap().into())
}

async fn server(
  addr: SocketAddr,
  register_rx: UnboundedReceiver<SessionTarget>,
  shutdown_server_rx: oneshot::Receiver<()>,
  bind_tx: std::sync::mpsc::Sender<Result<SocketAddr, AnyError>>,
  disable_origin_check: bool,
) {
  let incoming = match hyper::server::conn::AddrIncoming::bind(&addr) {
    Ok(incoming) => {
      let local_addr = incoming.local_addr();
      let _ = bind_tx.send(Ok(local_addr));
      incoming
    }
    Err(error) => {
      let _ = bind_tx.send(Err(error.into()));
      return;
    }
  };
  let local_addr = incoming.local_addr();

  let targets_ =
    Rc::new(RefCell::new(HashMap::<Uuid, SessionTarget>::new()));

  let targets = Rc::clone(&targets_);
  let mut register_targets_handler = pin!(register_rx
    .map(|target| {
      eprintln!(
        "VM service target listening on {}",
        target.get_websocket_debugger_url(&local_addr.to_string())
      );
      if targets.borrow_mut().insert(target.uuid, target).is_some() {
        panic!("Session target UUID already in map");
      }
    })
    .collect::<()>());

  let targets = Rc::clone(&targets_);
  let mut deregister_targets_handler = pin!(future::poll_fn(|cx| {
    targets
      .borrow_mut()
      .retain(|_, target| {
        target.deregister_rx.poll_unpin(cx) == Poll::Pending
      });
    Poll::<Never>::Pending
  })
  .fuse());

  let json_version_response = json!({
    "Browser": "Vela",
    "Protocol-Version": "1.0",
    "Vela-Version": env!("CARGO_PKG_VERSION"),
  });

  let make_svc = hyper::service::make_service_fn(|_| {
    let targets = Rc::clone(&targets_);
    let json_version_response = json_version_response.clone();

    future::ok::<_, Infallible>(hyper::service::service_fn(
      move |req: http::Request<hyper::Body>| {
        future::ready({
          if !host_is_trusted(&req, disable_origin_check) {
            http::Response::builder()
              .status(http::StatusCode::FORBIDDEN)
              .body("Connection rejected: untrusted origin".into())
          } else {
            // If the host header can make a valid URL, use it
            let host = req
              .headers()
              .get("host")
              .and_then(|host| host.to_str().ok())
              .and_then(|host| {
                Url::parse(&format!("http://{host}")).ok()
              })
              .and_then(|url| match (url.host(), url.port()) {
                (Some(host), Some(port)) => Some(format!("{host}:{port}")),
                (Some(host), None) => Some(format!("{host}")),
                _ => None,
              })
              .unwrap_or_else(|| local_addr.to_string());
            match (req.method(), req.uri().path()) {
              (&http::Method::GET, path) if path.starts_with("/ws/") => {
                handle_ws_request(req, Rc::clone(&targets))
              }
              (&http::Method::GET, "/json/version") => {
                handle_json_version_request(json_version_response.clone())
              }
              (&http::Method::GET, "/json") => {
                handle_json_request(Rc::clone(&targets), host)
              }
              (&http::Method::GET, "/json/list") => {
                handle_json_request(Rc::clone(&targets), host)
              }
              _ => http::Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body("Not Found".into()),
            }
          }
        })
      },
    ))
  });

  // Create the server manually so it can use the Local Executor
  let mut server_handler = pin!(hyper::server::Builder::new(
    incoming,
    hyper::server::conn::Http::new().with_executor(LocalExecutor),
  )
  .serve(make_svc)
  .with_graceful_shutdown(async {
    shutdown_server_rx.await.ok();
  })
  .unwrap_or_else(|err| {
    eprintln!("Cannot serve the VM service protocol: {err}.");
  })
  .fuse());

  select! {
    _ = register_targets_handler => {},
    _ = deregister_targets_handler => unreachable!(),
    _ = server_handler => {},
  }
}

/// The pump future takes care of forwarding messages between the websocket
/// and the session channels. It resolves when either side disconnects,
/// ignoring any errors.
///
/// The channel ends are unbounded on purpose: the session consumer may
/// block its thread while managed code is paused, and these senders must
/// not participate in any cooperative task budget while it does.
async fn pump_websocket_messages(
  mut websocket: WebSocket<hyper::upgrade::Upgraded>,
  inbound_tx: UnboundedSender<String>,
  mut outbound_rx: UnboundedReceiver<String>,
) {
  'pump: loop {
    tokio::select! {
        Some(msg) = outbound_rx.next() => {
            let msg = Frame::text(msg.into_bytes().into());
            let _ = websocket.write_frame(msg).await;
        }
        Ok(msg) = websocket.read_frame() => {
            match msg.opcode {
                OpCode::Text => {
                    if let Ok(s) = String::from_utf8(msg.payload.to_vec()) {
                      let _ = inbound_tx.unbounded_send(s);
                    }
                }
                OpCode::Close => {
                    // Clients don't care why a session ended, only that
                    // it did.
                    eprintln!("Service protocol session ended.");
                    break 'pump;
                }
                _ => {
                    // Ignore other messages.
                }
            }
        }
    }
  }
}
