//! Headless sync loop: keeps the local store mirrored for one device profile.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{
  search, Applied, CacheResult, CacheSource, Filter, LiveQuery, Predicate, Resource, SortDescriptor,
  Store, SyncLayer,
};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventHandler};
use crate::model::{Agency, CodeList, Facility, Patient, PriorityCounts, Responder, Scene};
use crate::query::{QueryState, RemoteQuery};
use crate::socket::{Channel, SocketChannel, SocketEvent};

const TICK_RATE: Duration = Duration::from_millis(250);

/// Fields matched by the patient search box
pub const PATIENT_SEARCH_FIELDS: &[&str] = &["first_name", "last_name", "pin", "location"];

/// Record counts from one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
  pub agencies: usize,
  pub facilities: usize,
  pub scenes: usize,
  pub code_lists: usize,
  pub responders: usize,
  pub patients: usize,
  /// Resources served from cache because the network failed
  pub offline: usize,
  /// Resources that failed with nothing cached to fall back on
  pub failed: usize,
}

pub fn scene_responders(scene: &str) -> Resource {
  Resource::new(format!("/api/scenes/{}/responders", scene))
}

pub fn scene_patients(scene: &str) -> Resource {
  Resource::new(format!("/api/scenes/{}/patients", scene))
}

/// Patients of a scene (or all), optionally narrowed by search text, by name.
pub fn patient_filter(scene: Option<&str>, search_text: Option<&str>) -> Filter {
  let mut predicate = scene
    .map(|id| Predicate::eq("scene_id", id))
    .unwrap_or_default();
  if let Some(text) = search_text {
    predicate = predicate.and(search(PATIENT_SEARCH_FIELDS, text));
  }

  Filter::new(predicate)
    .sorted_by(SortDescriptor::asc("last_name"))
    .sorted_by(SortDescriptor::asc("first_name"))
}

/// Outcome of one refresh pass, gathered resource by resource.
#[derive(Default)]
struct Pass {
  summary: RefreshSummary,
  errors: Vec<ApiError>,
  attempted: usize,
}

impl Pass {
  fn record<T>(&mut self, resource: &Resource, outcome: ApiResult<CacheResult<Vec<T>>>) -> usize {
    self.attempted += 1;
    match outcome {
      Ok(result) => {
        if result.source == CacheSource::Offline {
          self.summary.offline += 1;
        }
        result.data.len()
      }
      Err(e) => {
        warn!(resource = %resource.description(), error = %e, "resource refresh failed");
        self.errors.push(e);
        0
      }
    }
  }

  /// An auth failure anywhere fails the pass so the sign-in hint shows; other
  /// failures only when nothing succeeded.
  fn finish(mut self) -> ApiResult<RefreshSummary> {
    self.summary.failed = self.errors.len();
    if let Some(i) = self.errors.iter().position(ApiError::is_auth) {
      return Err(self.errors.swap_remove(i));
    }
    if !self.errors.is_empty() && self.errors.len() == self.attempted {
      return Err(self.errors.swap_remove(0));
    }
    Ok(self.summary)
  }
}

/// Sync every mirrored resource with the server once.
///
/// Always goes to the network (incrementally where a previous sync left a
/// high-water mark), whatever the cache freshness. A failing resource is
/// logged and skipped; the rest still sync.
pub async fn refresh_all(sync: &SyncLayer, scene: Option<&str>) -> ApiResult<RefreshSummary> {
  let mut pass = Pass::default();

  let agencies = Resource::new("/api/agencies");
  pass.summary.agencies = pass.record(&agencies, sync.sync_incremental::<Agency>(&agencies).await);
  let facilities = Resource::new("/api/facilities");
  pass.summary.facilities =
    pass.record(&facilities, sync.sync_incremental::<Facility>(&facilities).await);
  let scenes = Resource::new("/api/scenes");
  pass.summary.scenes = pass.record(&scenes, sync.sync_incremental::<Scene>(&scenes).await);
  let code_lists = Resource::new("/api/code_lists");
  pass.summary.code_lists =
    pass.record(&code_lists, sync.sync_incremental::<CodeList>(&code_lists).await);

  if let Some(scene) = scene {
    let responders = scene_responders(scene);
    pass.summary.responders =
      pass.record(&responders, sync.sync_incremental::<Responder>(&responders).await);
    let patients = scene_patients(scene);
    pass.summary.patients = pass.record(&patients, sync.sync_incremental::<Patient>(&patients).await);
  }

  pass.finish()
}

/// Main daemon state
pub struct Daemon {
  config: Config,
  sync: Arc<SyncLayer>,
  scene: Option<String>,
  refresh: RemoteQuery<RefreshSummary>,
  patients: LiveQuery<Patient>,
  /// Keeps the socket channels open
  sockets: Vec<SocketChannel>,
  should_quit: bool,
}

impl Daemon {
  pub fn new(config: Config, sync: SyncLayer) -> Result<Self> {
    let sync = Arc::new(sync);
    let scene = config.sync.scene.clone();

    let refresh = {
      let sync = sync.clone();
      let scene = scene.clone();
      RemoteQuery::new(move || {
        let sync = sync.clone();
        let scene = scene.clone();
        async move { refresh_all(&sync, scene.as_deref()).await }
      })
    };

    let patients = LiveQuery::new(
      sync.store().clone(),
      patient_filter(scene.as_deref(), None),
    )?;

    Ok(Self {
      config,
      sync,
      scene,
      refresh,
      patients,
      sockets: Vec::new(),
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE, self.config.sync.poll_interval());

    let mut channels = vec![Channel::Agency];
    if let Some(scene) = &self.scene {
      channels.push(Channel::Scene(scene.clone()));
    }
    for channel in channels {
      let socket = SocketChannel::connect(
        self.sync.client(),
        &self.config.server.socket_path,
        channel.clone(),
        self.config.sync.ping_interval(),
      )?;
      events.attach(channel, socket.subscribe());
      self.sockets.push(socket);
    }

    info!(
      server = %self.sync.client().base_url(),
      subdomain = self.sync.client().subdomain(),
      scene = self.scene.as_deref().unwrap_or("-"),
      "sync started"
    );
    // Initial sync before reacting to events; pushes meanwhile stay queued
    self.refresh.fetch();
    self.refresh.settle().await;
    self.report_refresh();
    self.log_counts();

    while !self.should_quit {
      if let Some(event) = events.next().await {
        self.handle_event(event)?;
      } else {
        break;
      }
    }

    for socket in &self.sockets {
      socket.close();
    }
    info!("sync stopped");
    Ok(())
  }

  fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Tick => {
        if self.refresh.poll() {
          self.report_refresh();
        }
        if let Some(changes) = self.patients.poll()? {
          debug!(
            deleted = ?changes.deletions,
            inserted = ?changes.insertions,
            modified = ?changes.modifications,
            "patients changed"
          );
          self.log_counts();
        }
      }
      Event::Poll => self.refresh.fetch(),
      Event::Socket(channel, event) => self.handle_socket_event(&channel, event),
      Event::SocketLagged(channel, missed) => {
        // Pushed frames were dropped; a fresh sync catches up
        warn!(%channel, missed, "socket events dropped, refreshing");
        self.refresh.refetch();
      }
      Event::Shutdown => self.should_quit = true,
    }
    Ok(())
  }

  fn handle_socket_event(&mut self, channel: &Channel, event: SocketEvent) {
    match event {
      SocketEvent::Connected => {
        // Catch up on whatever was pushed while we were away
        debug!(%channel, "socket up, syncing");
        self.refresh.refetch();
      }
      SocketEvent::Message(frame) => match self.sync.apply_push(&frame) {
        Ok(Applied::Ignored) => {}
        Ok(applied) => debug!(%channel, ?applied, "push applied"),
        Err(e) => warn!(%channel, error = %e, "push rejected"),
      },
      SocketEvent::Error(e) => match e.as_ref() {
        ApiError::Disconnected => debug!(%channel, "waiting to reconnect"),
        other => warn!(%channel, error = %other, "socket error"),
      },
    }
  }

  fn report_refresh(&self) {
    match self.refresh.state() {
      QueryState::Success(summary) => info!(
        agencies = summary.agencies,
        facilities = summary.facilities,
        scenes = summary.scenes,
        code_lists = summary.code_lists,
        responders = summary.responders,
        patients = summary.patients,
        offline = summary.offline,
        failed = summary.failed,
        "refresh complete"
      ),
      QueryState::Error(e) if e.is_auth() => {
        warn!(error = %e, "refresh rejected; sign in again and restart")
      }
      QueryState::Error(e) => warn!(error = %e, "refresh failed; will retry on next poll"),
      QueryState::Idle | QueryState::Loading => {}
    }
  }

  fn log_counts(&self) {
    let counts = PriorityCounts::from_patients(&self.patients.to_vec());
    info!(scene = self.scene.as_deref().unwrap_or("all"), "{}", counts);
  }
}

/// Cached patients for display, most urgent first, then by name.
pub fn cached_patients(
  store: &Store,
  scene: Option<&str>,
  search_text: Option<&str>,
) -> ApiResult<Vec<Patient>> {
  let mut patients = store.query::<Patient>(&patient_filter(scene, search_text))?;
  // Stable: name order from the filter survives within a priority
  patients.sort_by_key(|p| p.priority);
  Ok(patients)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::test_server::{http_response, TestServer};
  use crate::api::ApiClient;
  use crate::config::ServerConfig;
  use crate::model::Priority;
  use serde_json::json;

  fn sync_layer(url: String) -> SyncLayer {
    let server_config = ServerConfig {
      url,
      subdomain: "metro".into(),
      socket_path: "/cable".into(),
    };
    let client = ApiClient::new(&server_config, None).unwrap();
    SyncLayer::new(client, Arc::new(Store::open_in_memory().unwrap()))
  }

  /// One refresh pass for scene s1 where every resource but patients is empty.
  fn pass_responses(patients: &str) -> Vec<String> {
    let mut responses: Vec<String> = (0..5).map(|_| http_response(200, &[], "[]")).collect();
    responses.push(http_response(200, &[], patients));
    responses
  }

  fn patient(id: &str, scene: &str, first: &str, last: &str, priority: &str) -> Patient {
    serde_json::from_value(json!({
      "id": id,
      "scene_id": scene,
      "first_name": first,
      "last_name": last,
      "priority": priority,
    }))
    .unwrap()
  }

  #[test]
  fn test_cached_patients_order_and_search() {
    let store = Store::open_in_memory().unwrap();
    store
      .upsert(&[
        patient("1", "s1", "Ada", "Lovelace", "delayed"),
        patient("2", "s1", "Alan", "Turing", "immediate"),
        patient("3", "s1", "Grace", "Hopper", "delayed"),
        patient("4", "s2", "Edsger", "Dijkstra", "immediate"),
      ])
      .unwrap();

    let ids: Vec<_> = cached_patients(&store, Some("s1"), None)
      .unwrap()
      .into_iter()
      .map(|p| p.id)
      .collect();
    assert_eq!(ids, vec!["2", "3", "1"]);

    let found = cached_patients(&store, None, Some("gra hop")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].priority, Priority::Delayed);

    assert_eq!(cached_patients(&store, Some("s2"), Some("ada")).unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_refresh_all_with_scene() {
    let server = TestServer::bind().await;
    let url = server.url();
    let requests = server.serve(vec![
      http_response(200, &[], r#"[{"id":"a1","name":"Metro EMS"}]"#),
      http_response(200, &[], r#"{"facilities":[{"id":"f1","name":"General"},{"id":"f2","name":"Mercy"}]}"#),
      http_response(200, &[], r#"[{"id":"s1","name":"Stadium","is_mci":true}]"#),
      http_response(200, &[], r#"[]"#),
      http_response(200, &[], r#"[{"id":"r1","scene_id":"s1","vehicle":"M12"}]"#),
      http_response(200, &[], r#"[{"id":"p1","scene_id":"s1","priority":"immediate"}]"#),
    ]);

    let sync = sync_layer(url);

    let summary = refresh_all(&sync, Some("s1")).await.unwrap();
    assert_eq!(
      summary,
      RefreshSummary {
        agencies: 1,
        facilities: 2,
        scenes: 1,
        code_lists: 0,
        responders: 1,
        patients: 1,
        offline: 0,
        failed: 0,
      }
    );

    let seen = requests.await.unwrap();
    assert!(seen[4].starts_with("GET /api/scenes/s1/responders "));
    assert!(seen[5].starts_with("GET /api/scenes/s1/patients "));

    let counts = PriorityCounts::from_patients(&sync.store().all::<Patient>().unwrap());
    assert_eq!(counts.immediate, 1);
  }

  #[tokio::test]
  async fn test_one_failing_resource_does_not_stop_the_pass() {
    let server = TestServer::bind().await;
    let url = server.url();
    let mut responses = vec![http_response(500, &[], r#"{"error":"boom"}"#)];
    responses.extend(pass_responses(r#"[{"id":"p1","scene_id":"s1"}]"#).into_iter().skip(1));
    let _requests = server.serve(responses);

    let sync = sync_layer(url);
    let summary = refresh_all(&sync, Some("s1")).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.agencies, 0);
    assert_eq!(summary.patients, 1);
    assert_eq!(sync.store().all::<Patient>().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_auth_failure_fails_the_pass_after_syncing_the_rest() {
    let server = TestServer::bind().await;
    let url = server.url();
    let mut responses = vec![http_response(403, &[], "")];
    responses.extend(pass_responses(r#"[{"id":"p1","scene_id":"s1"}]"#).into_iter().skip(1));
    let _requests = server.serve(responses);

    let sync = sync_layer(url);
    let err = refresh_all(&sync, Some("s1")).await.unwrap_err();
    assert!(matches!(err, ApiError::Forbidden));
    assert_eq!(sync.store().all::<Patient>().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_poll_reconnect_and_lag_each_sync_with_the_server() {
    let server = TestServer::bind().await;
    let url = server.url();
    let mut responses = pass_responses(
      r#"[{"id":"p1","scene_id":"s1","last_name":"Able","updated_at":"2026-10-16T08:00:00Z"}]"#,
    );
    responses.extend(pass_responses(
      r#"[{"id":"p2","scene_id":"s1","last_name":"Baker","updated_at":"2026-10-16T09:00:00Z"}]"#,
    ));
    responses.extend(pass_responses(
      r#"[{"id":"p3","scene_id":"s1","last_name":"Carter","updated_at":"2026-10-16T10:00:00Z"}]"#,
    ));
    let requests = server.serve(responses);

    let config = Config::parse(&format!(
      "server:\n  url: {}\n  subdomain: metro\nsync:\n  scene: s1\n",
      url
    ))
    .unwrap();
    let sync = sync_layer(url).with_stale_time(config.sync.stale_time());
    let mut daemon = Daemon::new(config, sync).unwrap();

    daemon.handle_event(Event::Poll).unwrap();
    assert!(daemon.refresh.settle().await);
    assert_eq!(daemon.refresh.data().map(|s| s.patients), Some(1));

    // Cache is fresh now; reconnecting must still reach the server
    daemon
      .handle_event(Event::Socket(Channel::Scene("s1".into()), SocketEvent::Connected))
      .unwrap();
    assert!(daemon.refresh.settle().await);
    assert_eq!(daemon.refresh.data().map(|s| s.patients), Some(2));

    daemon
      .handle_event(Event::SocketLagged(Channel::Agency, 12))
      .unwrap();
    assert!(daemon.refresh.settle().await);
    assert_eq!(daemon.refresh.data().map(|s| s.patients), Some(3));

    daemon.handle_event(Event::Tick).unwrap();
    let names: Vec<_> = daemon
      .patients
      .results()
      .map(|p| p.last_name.clone().unwrap_or_default())
      .collect();
    assert_eq!(names, vec!["Able", "Baker", "Carter"]);

    let seen = requests.await.unwrap();
    assert_eq!(seen.len(), 18);
    assert!(seen[11].contains("updated_since=2026-10-16T08%3A00%3A00Z"));
    assert!(seen[17].contains("updated_since=2026-10-16T09%3A00%3A00Z"));
  }

  #[tokio::test]
  async fn test_pushed_frames_reach_the_store() {
    let config = Config::parse("server:\n  url: http://127.0.0.1:9\n  subdomain: metro\n").unwrap();
    let sync = sync_layer(config.server.url.clone());
    let mut daemon = Daemon::new(config, sync).unwrap();

    daemon
      .handle_event(Event::Socket(
        Channel::Agency,
        SocketEvent::Message(json!({"type": "patient", "data": {"id": "p9", "scene_id": "s2"}})),
      ))
      .unwrap();
    daemon.handle_event(Event::Tick).unwrap();
    assert_eq!(daemon.patients.len(), 1);

    daemon.handle_event(Event::Shutdown).unwrap();
    assert!(daemon.should_quit);
  }
}
