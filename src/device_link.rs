//! WebSocket server the device and monitors connect to.
//!
//! `/device` carries the device's microphone frames and control signals,
//! `/monitor` only receives. Every connected socket is registered in a
//! shared [`ClientRegistry`] under its route. Model output goes to every
//! client, device microphone audio only to monitors.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::error::{RelayError, Result};

pub type ClientId = u64;

/// A frame received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Binary(Bytes),
    Text(String),
}

/// Which endpoint a socket connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Device,
    Monitor,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/device" => Some(Route::Device),
            "/monitor" => Some(Route::Monitor),
            _ => None,
        }
    }
}

/// Outbound channels of all connected sockets.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, (Route, mpsc::UnboundedSender<Message>)>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, route: Route, tx: mpsc::UnboundedSender<Message>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, (route, tx));
        }
        id
    }

    pub fn remove(&self, id: ClientId) -> bool {
        self.clients
            .lock()
            .map(|mut clients| clients.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many clients the frame was queued for.
    pub fn broadcast_binary(&self, data: Bytes) -> usize {
        self.broadcast(Message::Binary(data), |_| true)
    }

    pub fn broadcast_text(&self, text: &str) -> usize {
        self.broadcast(Message::Text(text.into()), |_| true)
    }

    /// Binary frame for `/monitor` sockets only.
    pub fn broadcast_to_monitors(&self, data: Bytes) -> usize {
        self.broadcast(Message::Binary(data), |route| route == Route::Monitor)
    }

    /// Clients whose writer is gone are pruned here, matched or not.
    fn broadcast(&self, msg: Message, to: impl Fn(Route) -> bool) -> usize {
        let Ok(mut clients) = self.clients.lock() else {
            return 0;
        };
        let mut delivered = 0;
        clients.retain(|id, (route, tx)| {
            let open = if to(*route) {
                let sent = tx.send(msg.clone()).is_ok();
                delivered += sent as usize;
                sent
            } else {
                !tx.is_closed()
            };
            if !open {
                log::debug!("Pruning closed client {}", id);
            }
            open
        });
        delivered
    }
}

/// Our side of one registered socket. Dropping it unregisters the socket.
pub struct DeviceHandle {
    id: ClientId,
    registry: Arc<ClientRegistry>,
}

impl DeviceHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn broadcast_binary(&self, data: Bytes) -> usize {
        self.registry.broadcast_binary(data)
    }

    pub fn broadcast_text(&self, text: &str) -> usize {
        self.registry.broadcast_text(text)
    }

    pub fn forward_to_monitors(&self, data: Bytes) -> usize {
        self.registry.broadcast_to_monitors(data)
    }

    pub fn release(&self) {
        if self.registry.remove(self.id) {
            log::info!("Client {} disconnected", self.id);
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A handshaken device socket.
pub struct DeviceConnection {
    handle: DeviceHandle,
    messages: BoxStream<'static, DeviceMessage>,
}

impl DeviceConnection {
    /// Wrap an open WebSocket and register it for broadcasts under `route`.
    pub fn attach<S>(socket: S, route: Route, registry: Arc<ClientRegistry>) -> Self
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut write, read) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    log::debug!("Client write failed: {}", e);
                    return;
                }
            }
            let _ = write.close().await;
        });

        let id = registry.add(route, tx);
        Self::from_parts(DeviceHandle { id, registry }, device_frames(read))
    }

    /// Use an arbitrary message stream as the device, registered under `id`.
    pub fn detached(
        id: ClientId,
        registry: Arc<ClientRegistry>,
        messages: BoxStream<'static, DeviceMessage>,
    ) -> Self {
        Self::from_parts(DeviceHandle { id, registry }, messages)
    }

    fn from_parts(handle: DeviceHandle, messages: BoxStream<'static, DeviceMessage>) -> Self {
        Self { handle, messages }
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn split(self) -> (DeviceHandle, BoxStream<'static, DeviceMessage>) {
        (self.handle, self.messages)
    }
}

/// A `/device` socket whose handshake may still be running.
pub struct PendingDevice {
    peer: SocketAddr,
    handshake: JoinHandle<Result<WebSocketStream<TcpStream>>>,
    registry: Arc<ClientRegistry>,
}

impl PendingDevice {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for the handshake to finish.
    pub async fn ready(self) -> Result<DeviceConnection> {
        let ws = join_handshake(self.handshake).await?;
        let conn = DeviceConnection::attach(ws, Route::Device, self.registry);
        log::info!("Device {} registered as client {}", self.peer, conn.id());
        Ok(conn)
    }
}

pub struct DeviceServer {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    handshake_timeout: Duration,
}

impl DeviceServer {
    pub async fn bind(addr: &str, handshake_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry: Arc::new(ClientRegistry::new()),
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Accept forever. `handler` gets every `/device` connection as soon as
    /// its request path is known; monitors are served here.
    pub async fn run<H, Fut>(self, handler: H) -> Result<()>
    where
        H: Fn(PendingDevice) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let registry = self.registry.clone();
            let handler = handler.clone();
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                handle_connection(stream, peer, registry, handshake_timeout, handler).await;
            });
        }
    }
}

async fn handle_connection<H, Fut>(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ClientRegistry>,
    handshake_timeout: Duration,
    handler: Arc<H>,
) where
    H: Fn(PendingDevice) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (route_tx, route_rx) = oneshot::channel();
    let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let path = req.uri().path().to_string();
        let route = Route::from_path(&path);
        let _ = route_tx.send(route);
        match route {
            Some(_) => Ok(resp),
            None => {
                let mut err = ErrorResponse::new(Some(format!("no route for {}", path)));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    };

    // 握手在独立任务里继续，路由确定后即可并行连接上游
    let timeout_ms = handshake_timeout.as_millis() as u64;
    let handshake = tokio::spawn(async move {
        match timeout(handshake_timeout, accept_hdr_async(stream, callback)).await {
            Ok(Ok(ws)) => Ok(ws),
            Ok(Err(e)) => Err(RelayError::from(e)),
            Err(_) => Err(RelayError::ConnectTimeout(timeout_ms)),
        }
    });

    match route_rx.await {
        Ok(Some(Route::Device)) => {
            log::info!("Device connecting from {}", peer);
            handler(PendingDevice {
                peer,
                handshake,
                registry,
            })
            .await;
        }
        Ok(Some(Route::Monitor)) => match join_handshake(handshake).await {
            Ok(ws) => serve_monitor(ws, registry, peer).await,
            Err(e) => log::warn!("Monitor handshake with {} failed: {}", peer, e),
        },
        Ok(None) => log::warn!("Rejected {}: unknown path", peer),
        // 回调未执行，说明请求本身就没读完
        Err(_) => {
            if let Err(e) = join_handshake(handshake).await {
                log::warn!("Handshake with {} failed: {}", peer, e);
            }
        }
    }
}

async fn serve_monitor(ws: WebSocketStream<TcpStream>, registry: Arc<ClientRegistry>, peer: SocketAddr) {
    let (handle, mut messages) = DeviceConnection::attach(ws, Route::Monitor, registry).split();
    log::info!("Monitor {} registered as client {}", peer, handle.id());
    while let Some(msg) = messages.next().await {
        log::trace!("Ignoring monitor frame: {:?}", msg);
    }
    handle.release();
}

async fn join_handshake(
    handshake: JoinHandle<Result<WebSocketStream<TcpStream>>>,
) -> Result<WebSocketStream<TcpStream>> {
    handshake
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e)))?
}

fn device_frames<R>(read: R) -> BoxStream<'static, DeviceMessage>
where
    R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Send + Unpin + 'static,
{
    stream::unfold(read, |mut read| async move {
        loop {
            match read.next().await? {
                Ok(Message::Binary(data)) => return Some((DeviceMessage::Binary(data), read)),
                Ok(Message::Text(text)) => {
                    return Some((DeviceMessage::Text(text.as_str().to_owned()), read))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Client read error: {}", e);
                    return None;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[test]
    fn broadcast_prunes_closed_clients() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = registry.add(Route::Device, tx_a);
        let b = registry.add(Route::Monitor, tx_b);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        drop(rx_b);
        assert_eq!(registry.broadcast_text("hi"), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), Message::Text("hi".into()));

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.broadcast_binary(Bytes::from_static(&[1, 2])), 0);
    }

    #[test]
    fn microphone_audio_goes_to_monitors_only() {
        let registry = ClientRegistry::new();
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        registry.add(Route::Device, device_tx);
        registry.add(Route::Monitor, monitor_tx);
        registry.add(Route::Monitor, gone_tx);
        drop(gone_rx);

        assert_eq!(registry.broadcast_to_monitors(Bytes::from_static(&[4, 0])), 1);
        assert_eq!(monitor_rx.try_recv().unwrap(), Message::Binary(Bytes::from_static(&[4, 0])));
        assert!(device_rx.try_recv().is_err());
        assert_eq!(registry.len(), 2);

        // the device still gets model output
        assert_eq!(registry.broadcast_binary(Bytes::from_static(&[1, 0])), 2);
        assert!(device_rx.try_recv().is_ok());
    }

    #[test]
    fn dropping_handle_unregisters() {
        let registry = Arc::new(ClientRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add(Route::Device, tx);
        let conn = DeviceConnection::detached(id, registry.clone(), stream::empty().boxed());
        assert_eq!(registry.len(), 1);
        drop(conn);
        assert!(registry.is_empty());
    }

    #[test]
    fn routes_by_path() {
        assert_eq!(Route::from_path("/device"), Some(Route::Device));
        assert_eq!(Route::from_path("/monitor/"), Some(Route::Monitor));
        assert_eq!(Route::from_path("/"), None);
    }

    #[tokio::test]
    async fn device_frames_reach_handler_and_monitors_get_broadcasts() {
        let server = DeviceServer::bind("127.0.0.1:0", Duration::from_secs(5))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.run(move |pending: PendingDevice| {
            let seen_tx = seen_tx.clone();
            async move {
                let (_handle, mut messages) = pending.ready().await.unwrap().split();
                while let Some(msg) = messages.next().await {
                    let _ = seen_tx.send(msg);
                }
            }
        }));

        let (mut device, _) = connect_async(format!("ws://{}/device", addr)).await.unwrap();
        device.send(Message::Binary(vec![1u8].into())).await.unwrap();
        device.send(Message::Text("START_RECORD".into())).await.unwrap();
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            DeviceMessage::Binary(Bytes::from_static(&[1]))
        );
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            DeviceMessage::Text("START_RECORD".into())
        );

        let (mut monitor, _) = connect_async(format!("ws://{}/monitor", addr)).await.unwrap();
        while registry.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.broadcast_text("speech_started"), 2);
        let got = monitor.next().await.unwrap().unwrap();
        assert_eq!(got, Message::Text("speech_started".into()));

        assert!(connect_async(format!("ws://{}/elsewhere", addr)).await.is_err());
    }
}
