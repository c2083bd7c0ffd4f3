//! WebSocket listener and per-connection delivery threads.
//!
//! Binds to the configured address and speaks one JSON envelope per text
//! frame. Each connection gets its own thread, which owns the connection's
//! [`Session`] and is the only writer to the socket.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tungstenite::{Message, WebSocket};

use tdsweb_protocol::{ProtocolError, ServerMessage};
use tdsweb_tds::Connector;

use crate::session_server::dispatch::dispatch;
use crate::session_server::outbox::{Events, Outbox};
use crate::session_server::session::{Session, SessionSettings};

/// Read timeout on connection sockets, so queued events get written while
/// the client is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed for the HTTP upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Events written per loop turn before the socket is polled for input.
const FLUSH_BATCH: usize = 64;

/// Read timeout while events are still queued.
const BUSY_POLL: Duration = Duration::from_millis(1);

/// Configuration for the gateway server.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `host:port` to bind. Port 0 picks a free port.
    pub bind_addr: String,
    pub max_connections: usize,
    /// Largest text frame accepted, in bytes.
    pub max_message_size: usize,
    pub session: SessionSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:52441".to_string(),
            max_connections: 64,
            max_message_size: 1024 * 1024,
            session: SessionSettings::default(),
        }
    }
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Live connections, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<u64, ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub since: Instant,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection unless `limit` connections are already live.
    pub fn try_register(&self, peer: SocketAddr, limit: usize) -> Option<u64> {
        let mut connections = self.connections.lock();
        if connections.len() >= limit {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        connections.insert(id, ConnectionInfo { peer, since: Instant::now() });
        Some(id)
    }

    pub fn unregister(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.lock().remove(&id)
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Operational counters.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    pub connections_accepted: Arc<AtomicU64>,
    /// Connections refused due to the connection limit.
    pub connections_refused_limit: Arc<AtomicU64>,
    /// Connections dropped during the WebSocket upgrade.
    pub handshakes_failed: Arc<AtomicU64>,
    /// Text frames rejected for size.
    pub messages_oversize: Arc<AtomicU64>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The gateway server - owns the listener thread.
pub struct GatewayServer {
    listener_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    bound_addr: Option<SocketAddr>,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

impl GatewayServer {
    pub fn new() -> Self {
        Self {
            listener_handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            bound_addr: None,
            registry: ConnectionRegistry::new(),
            metrics: ServerMetrics::new(),
        }
    }

    /// Bind and start accepting connections. Returns once listening.
    pub fn start(&mut self, config: GatewayConfig, connector: Arc<dyn Connector>) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let listener = TcpListener::bind(&config.bind_addr)?;
        let addr = listener.local_addr()?;
        self.bound_addr = Some(addr);

        // Non-blocking so the shutdown flag is checked between accepts
        listener.set_nonblocking(true)?;

        let shutdown = Arc::clone(&self.shutdown);
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();

        self.listener_handle = Some(
            thread::Builder::new()
                .name("tdsweb-listener".to_string())
                .spawn(move || run_listener(listener, shutdown, config, connector, registry, metrics))?,
        );

        log::info!("Gateway listening on {}", addr);
        Ok(())
    }

    /// Block until the listener exits (after [`ShutdownHandle::shutdown`]).
    pub fn wait(&mut self) {
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
    }

    /// Stop accepting and wait for the listener thread.
    pub fn stop(&mut self) {
        if self.listener_handle.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.wait();
        self.bound_addr = None;
        log::info!("Gateway stopped");
    }

    /// Wait for connection threads to finish tearing down their sessions.
    /// Returns false if some are still open after `timeout`.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.registry.count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { flag: Arc::clone(&self.shutdown) }
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}

impl Default for GatewayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept loop, run on the listener thread.
fn run_listener(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let Some(conn_id) = registry.try_register(addr, config.max_connections) else {
                    log::warn!(
                        "Connection refused from {}: limit of {} reached",
                        addr,
                        config.max_connections
                    );
                    metrics.connections_refused_limit.fetch_add(1, Ordering::Relaxed);
                    drop(stream);
                    continue;
                };

                log::info!("Accepted connection {} from {}", conn_id, addr);
                metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);

                let connector = Arc::clone(&connector);
                let config = config.clone();
                let conn_registry = registry.clone();
                let metrics = metrics.clone();
                let shutdown = Arc::clone(&shutdown);

                let spawned = thread::Builder::new()
                    .name(format!("tdsweb-conn-{}", conn_id))
                    .spawn(move || {
                        let result = handle_connection(stream, conn_id, &config, connector, &metrics, &shutdown);
                        let open_for = conn_registry
                            .unregister(conn_id)
                            .map(|info| info.since.elapsed())
                            .unwrap_or_default();
                        match result {
                            Ok(()) => log::info!("Connection {} closed after {:.1?}", conn_id, open_for),
                            Err(e) => log::warn!(
                                "Connection {} from {} ended after {:.1?}: {}",
                                conn_id,
                                addr,
                                open_for,
                                e
                            ),
                        }
                    });
                if let Err(e) = spawned {
                    log::error!("Cannot start connection thread: {}", e);
                    registry.unregister(conn_id);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// Serve one client until it disconnects or the server shuts down.
///
/// The session is torn down (and any running query joined) before this
/// returns, so no event can follow the disconnect.
fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    config: &GatewayConfig,
    connector: Arc<dyn Connector>,
    metrics: &ServerMetrics,
    shutdown: &AtomicBool,
) -> Result<(), tungstenite::Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("handshake failed: {}", e)).into());
        }
    };
    ws.get_ref().set_read_timeout(Some(POLL_INTERVAL))?;

    let (outbox, events) = Outbox::channel();
    let mut session = Session::new(connector, config.session.clone(), outbox);

    let result = serve(&mut ws, &mut session, &events, conn_id, config, metrics, shutdown);

    // Closing the queue releases an executor waiting for space; late events are discarded
    drop(events);
    session.close();
    result
}

fn serve(
    ws: &mut WebSocket<TcpStream>,
    session: &mut Session,
    events: &Events,
    conn_id: u64,
    config: &GatewayConfig,
    metrics: &ServerMetrics,
    shutdown: &AtomicBool,
) -> Result<(), tungstenite::Error> {
    let mut read_timeout = POLL_INTERVAL;
    loop {
        flush_events(ws, events)?;

        if shutdown.load(Ordering::SeqCst) {
            log::debug!("Connection {} closing for shutdown", conn_id);
            let _ = ws.close(None);
            let _ = ws.flush();
            return Ok(());
        }

        // Short reads while events are still queued
        let wanted = if events.pending() > 0 { BUSY_POLL } else { POLL_INTERVAL };
        if wanted != read_timeout {
            ws.get_ref().set_read_timeout(Some(wanted))?;
            read_timeout = wanted;
        }

        let msg = match ws.read() {
            Ok(msg) => msg,
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match msg {
            Message::Text(text) => {
                if text.len() > config.max_message_size {
                    log::warn!("Connection {} sent oversized message ({} bytes)", conn_id, text.len());
                    metrics.messages_oversize.fetch_add(1, Ordering::Relaxed);
                    session.outbox().send(ServerMessage::error(ProtocolError::MessageTooLarge.to_string()));
                    continue;
                }
                dispatch(session, text.as_str());
            }
            Message::Binary(_) => {
                session.outbox().send(ServerMessage::error(ProtocolError::BinaryFrame.to_string()));
            }
            Message::Close(_) => {
                // The close reply is queued by tungstenite; push it out
                let _ = ws.flush();
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Write up to one batch of queued events to the socket.
fn flush_events(ws: &mut WebSocket<TcpStream>, events: &Events) -> Result<(), tungstenite::Error> {
    for event in events.take(FLUSH_BATCH) {
        let json = event
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        ws.send(Message::text(json))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_server::testing::{int, row, table, text, ScriptedConnector, Step, ENDLESS_ROWS};
    use serde_json::json;
    use tdsweb_tds::SqlType;

    fn start_server(max_connections: usize, max_message_size: usize) -> (GatewayServer, ScriptedConnector) {
        let connector = ScriptedConnector::new("luthien", "p", &["master", "model", "test"]);
        let mut server = GatewayServer::new();
        server
            .start(
                GatewayConfig {
                    bind_addr: "127.0.0.1:0".to_string(),
                    max_connections,
                    max_message_size,
                    session: SessionSettings::default(),
                },
                Arc::new(connector.clone()),
            )
            .unwrap();
        (server, connector)
    }

    fn connect(addr: SocketAddr) -> WebSocket<TcpStream> {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (ws, _response) = tungstenite::client(format!("ws://{}/", addr), stream).unwrap();
        ws
    }

    fn send(ws: &mut WebSocket<TcpStream>, value: serde_json::Value) {
        ws.send(Message::text(value.to_string())).unwrap();
    }

    fn recv(ws: &mut WebSocket<TcpStream>) -> serde_json::Value {
        loop {
            match ws.read().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[test]
    fn test_server_lifecycle() {
        let (mut server, _connector) = start_server(4, 1024);
        assert!(server.is_running());
        assert!(server.bound_addr().is_some());

        server.stop();
        assert!(!server.is_running());
        assert!(server.bound_addr().is_none());
    }

    #[test]
    fn test_shutdown_handle_stops_listener() {
        let (mut server, _connector) = start_server(4, 1024);
        let handle = server.shutdown_handle();
        let waiter = thread::spawn(move || {
            server.wait();
            server
        });
        handle.shutdown();
        let server = waiter.join().unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let (mut server, _connector) = start_server(4, 1024);
        let mut ws = connect(server.bound_addr().unwrap());
        send(&mut ws, json!({"type": "ping"}));
        assert_eq!(recv(&mut ws), json!({"type": "pong"}));

        server.stop();
        assert!(server.drain(Duration::from_secs(5)));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_websocket_conversation() {
        let (mut server, connector) = start_server(4, 1024);
        connector.script(
            "SELECT id, name FROM t",
            vec![
                table(&[("id", SqlType::Int), ("name", SqlType::NVarChar)]),
                row(vec![int(1), text("alice")]),
                row(vec![int(2), None]),
            ],
        );
        let mut ws = connect(server.bound_addr().unwrap());

        send(&mut ws, json!({"type": "ping"}));
        assert_eq!(recv(&mut ws), json!({"type": "pong"}));

        send(&mut ws, json!({"type": "login", "username": "u", "password": "p"}));
        let login = recv(&mut ws);
        assert_eq!(login["type"], json!("login"));
        assert_eq!(login["database"], json!("test"));

        send(&mut ws, json!({"type": "query", "query": "SELECT id, name FROM t"}));
        assert_eq!(
            recv(&mut ws),
            json!({"type": "table", "columns": [{"name": "id", "type": "int"}, {"name": "name", "type": "nvarchar"}]})
        );
        assert_eq!(recv(&mut ws), json!({"type": "row", "columns": [1, "alice"]}));
        assert_eq!(recv(&mut ws), json!({"type": "row", "columns": [2, null]}));
        assert_eq!(recv(&mut ws), json!({"type": "query_finished"}));

        send(&mut ws, json!({"type": "bogus"}));
        assert_eq!(recv(&mut ws), json!({"type": "error", "message": "Unrecognized message type \"bogus\"."}));

        ws.send(Message::binary(vec![1u8, 2, 3])).unwrap();
        assert_eq!(recv(&mut ws), json!({"type": "error", "message": "Binary messages are not supported."}));

        send(&mut ws, json!({"type": "logout"}));
        assert_eq!(recv(&mut ws), json!({"type": "logout", "success": true}));

        ws.close(None).unwrap();
        server.stop();
    }

    #[test]
    fn test_cancel_delivered_during_row_stream() {
        let (mut server, connector) = start_server(4, 1024);
        connector.script("endless", vec![table(&[("n", SqlType::Int)]), Step::RowsUntilCancel(vec![int(1)])]);
        let mut ws = connect(server.bound_addr().unwrap());

        send(&mut ws, json!({"type": "login", "username": "u", "password": "p"}));
        assert_eq!(recv(&mut ws)["type"], json!("login"));
        send(&mut ws, json!({"type": "query", "query": "endless"}));
        assert_eq!(recv(&mut ws)["type"], json!("table"));

        let mut rows = 0;
        while rows < 100 {
            assert_eq!(recv(&mut ws), json!({"type": "row", "columns": [1]}));
            rows += 1;
        }

        send(&mut ws, json!({"type": "cancel"}));
        send(&mut ws, json!({"type": "ping"}));
        let mut got_pong = false;
        loop {
            let event = recv(&mut ws);
            match event["type"].as_str().unwrap() {
                "row" => rows += 1,
                "pong" => got_pong = true,
                "query_finished" => break,
                other => panic!("unexpected event {}", other),
            }
        }
        if !got_pong {
            assert_eq!(recv(&mut ws), json!({"type": "pong"}));
        }

        assert!(rows < ENDLESS_ROWS, "stream ran to its limit: {} rows", rows);
        assert_eq!(connector.last_connection().unwrap().cancel_count(), 1);
        server.stop();
    }

    #[test]
    fn test_oversized_message_keeps_connection() {
        let (mut server, _connector) = start_server(4, 64);
        let mut ws = connect(server.bound_addr().unwrap());

        send(&mut ws, json!({"type": "login", "username": "x".repeat(100), "password": "p"}));
        assert_eq!(recv(&mut ws), json!({"type": "error", "message": "Message too large."}));
        assert_eq!(server.metrics().messages_oversize.load(Ordering::Relaxed), 1);

        send(&mut ws, json!({"type": "ping"}));
        assert_eq!(recv(&mut ws), json!({"type": "pong"}));
        server.stop();
    }

    #[test]
    fn test_connection_limit_enforced() {
        let (mut server, _connector) = start_server(1, 1024);
        let addr = server.bound_addr().unwrap();

        let mut first = connect(addr);
        send(&mut first, json!({"type": "ping"}));
        assert_eq!(recv(&mut first), json!({"type": "pong"}));
        assert_eq!(server.connection_count(), 1);

        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert!(tungstenite::client(format!("ws://{}/", addr), stream).is_err());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.metrics().connections_refused_limit.load(Ordering::Relaxed), 1);
        server.stop();
    }

    #[test]
    fn test_connection_slot_freed_on_disconnect() {
        let (mut server, _connector) = start_server(1, 1024);
        let addr = server.bound_addr().unwrap();

        let mut first = connect(addr);
        send(&mut first, json!({"type": "ping"}));
        assert_eq!(recv(&mut first), json!({"type": "pong"}));
        drop(first);

        // Give the server time to notice the disconnect
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.connection_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.connection_count(), 0);

        let mut second = connect(addr);
        send(&mut second, json!({"type": "ping"}));
        assert_eq!(recv(&mut second), json!({"type": "pong"}));
        server.stop();
    }

    #[test]
    fn test_registry() {
        let registry = ConnectionRegistry::new();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let a = registry.try_register(peer, 2).unwrap();
        let b = registry.try_register(peer, 2).unwrap();
        assert_ne!(a, b);
        assert!(registry.try_register(peer, 2).is_none());

        let info = registry.unregister(a).unwrap();
        assert_eq!(info.peer, peer);
        assert!(info.since.elapsed() < Duration::from_secs(60));
        assert_eq!(registry.count(), 1);
        assert!(registry.unregister(a).is_none());
        assert!(registry.try_register(peer, 2).is_some());
    }
}
