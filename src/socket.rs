//! Reconnecting WebSocket channel.
//!
//! One persistent connection per logical channel. A fixed timer sends a ping
//! while connected and re-dials while disconnected; there is no backoff and
//! nothing written while disconnected is replayed.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Logical push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
  /// Everything for the tenant agency
  Agency,
  /// Updates scoped to one scene
  Scene(String),
}

impl Channel {
  fn query(&self) -> Vec<(&str, &str)> {
    match self {
      Channel::Agency => Vec::new(),
      Channel::Scene(id) => vec![("scene_id", id.as_str())],
    }
  }
}

impl std::fmt::Display for Channel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Channel::Agency => write!(f, "agency"),
      Channel::Scene(id) => write!(f, "scene:{}", id),
    }
  }
}

/// What subscribers observe.
#[derive(Debug, Clone)]
pub enum SocketEvent {
  Connected,
  /// A JSON frame from the server
  Message(Value),
  /// `ApiError::Disconnected` when the connection drops; any other error
  /// (failed handshake, malformed frame) is passed through as-is
  Error(Arc<ApiError>),
}

/// Handle to a live socket channel. Dropping it stops the connection.
pub struct SocketChannel {
  channel: Channel,
  url: Url,
  events: broadcast::Sender<SocketEvent>,
  outgoing: mpsc::UnboundedSender<Message>,
  connected: Arc<AtomicBool>,
  task: JoinHandle<()>,
}

impl SocketChannel {
  /// Start the channel. Returns immediately; the first dial happens on the
  /// background task. Subscribe right away, earlier events are not replayed.
  pub fn connect(
    client: &ApiClient,
    socket_path: &str,
    channel: Channel,
    ping_interval: Duration,
  ) -> ApiResult<Self> {
    let url = client.socket_url(socket_path, &channel.query())?;
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run(
      url.clone(),
      client.headers(),
      channel.clone(),
      events.clone(),
      outgoing_rx,
      connected.clone(),
      ping_interval,
    ));

    Ok(Self {
      channel,
      url,
      events,
      outgoing,
      connected,
      task,
    })
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
    self.events.subscribe()
  }

  pub fn channel(&self) -> &Channel {
    &self.channel
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  /// Write a JSON text frame. Fails with `Disconnected` when not connected.
  pub fn send(&self, value: &Value) -> ApiResult<()> {
    if !self.is_connected() {
      return Err(ApiError::Disconnected);
    }
    self
      .outgoing
      .send(Message::Text(value.to_string()))
      .map_err(|_| ApiError::Disconnected)
  }

  /// Stop the background task and drop the connection.
  pub fn close(&self) {
    self.task.abort();
    self.connected.store(false, Ordering::SeqCst);
  }
}

impl Drop for SocketChannel {
  fn drop(&mut self) {
    self.close();
  }
}

fn emit(events: &broadcast::Sender<SocketEvent>, event: SocketEvent) {
  // No subscribers is fine
  let _ = events.send(event);
}

fn parse_frame(bytes: &[u8]) -> SocketEvent {
  match serde_json::from_slice(bytes) {
    Ok(value) => SocketEvent::Message(value),
    Err(e) => SocketEvent::Error(Arc::new(ApiError::Json(e))),
  }
}

async fn run(
  url: Url,
  headers: HeaderMap,
  channel: Channel,
  events: broadcast::Sender<SocketEvent>,
  mut outgoing: mpsc::UnboundedReceiver<Message>,
  connected: Arc<AtomicBool>,
  ping_interval: Duration,
) {
  let mut ticker = tokio::time::interval(ping_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    // First tick completes immediately; later ones pace the re-dials
    ticker.tick().await;

    // Same tenant and auth headers as the REST requests
    let mut request = match url.as_str().into_client_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(%channel, error = %e, "invalid socket request");
        emit(&events, SocketEvent::Error(Arc::new(ApiError::Socket(e))));
        continue;
      }
    };
    request.headers_mut().extend(headers.clone());

    let ws = match connect_async(request).await {
      Ok((ws, _)) => ws,
      Err(e) => {
        warn!(%channel, error = %e, "socket connect failed");
        emit(&events, SocketEvent::Error(Arc::new(ApiError::Socket(e))));
        continue;
      }
    };

    // Anything queued before this connection came up is stale
    while outgoing.try_recv().is_ok() {}

    info!(%channel, "socket connected");
    connected.store(true, Ordering::SeqCst);
    emit(&events, SocketEvent::Connected);

    let (mut sink, mut stream) = ws.split();
    ticker.reset();

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
            debug!(%channel, error = %e, "ping failed");
            break;
          }
        }
        Some(message) = outgoing.recv() => {
          if let Err(e) = sink.send(message).await {
            debug!(%channel, error = %e, "send failed");
            break;
          }
        }
        frame = stream.next() => match frame {
          Some(Ok(Message::Text(text))) => emit(&events, parse_frame(text.as_bytes())),
          Some(Ok(Message::Binary(bytes))) => emit(&events, parse_frame(&bytes)),
          Some(Ok(Message::Close(_))) | None => break,
          // Pings are answered by tungstenite itself
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            debug!(%channel, error = %e, "socket read failed");
            break;
          }
        }
      }
    }

    connected.store(false, Ordering::SeqCst);
    warn!(%channel, "socket disconnected");
    emit(&events, SocketEvent::Error(Arc::new(ApiError::Disconnected)));
  }
}
