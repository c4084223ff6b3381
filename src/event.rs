use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::socket::{Channel, SocketEvent};

/// Daemon events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick for draining live queries and fetch state
  Tick,
  /// Time for the periodic REST refresh
  Poll,
  /// Something happened on a socket channel
  Socket(Channel, SocketEvent),
  /// A socket subscriber fell behind and dropped frames
  SocketLagged(Channel, u64),
  /// Ctrl-C
  Shutdown,
}

/// Merges timers, socket channels and the shutdown signal into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration, poll_interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    spawn_timer(tx.clone(), tick_rate, || Event::Tick);
    spawn_timer(tx.clone(), poll_interval, || Event::Poll);

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(Event::Shutdown);
      }
    });

    Self { tx, rx }
  }

  /// Forward a socket channel's events until either side goes away.
  pub fn attach(&self, channel: Channel, mut events: broadcast::Receiver<SocketEvent>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        let event = match events.recv().await {
          Ok(event) => Event::Socket(channel.clone(), event),
          Err(broadcast::error::RecvError::Lagged(n)) => Event::SocketLagged(channel.clone(), n),
          Err(broadcast::error::RecvError::Closed) => break,
        };
        if tx.send(event).is_err() {
          break;
        }
      }
      debug!(%channel, "socket forwarder stopped");
    });
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn spawn_timer(tx: mpsc::UnboundedSender<Event>, period: Duration, make: fn() -> Event) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    // The first tick is immediate; the daemon does its own initial work
    interval.tick().await;
    loop {
      interval.tick().await;
      if tx.send(make()).is_err() {
        break;
      }
    }
  });
}
