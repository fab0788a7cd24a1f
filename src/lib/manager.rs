use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::client::{Capabilities, ControlPlane};
use crate::config::Persistence;
use crate::radar::RadarError;
use crate::receiver::DEFAULT_RECONNECT_INTERVAL;
use crate::session::RadarSession;

/// Shortest wait between two spoke stream connection attempts.
pub const MIN_SPOKE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    pub discovery_interval: Duration,
    pub reconnect_interval: Duration,
    pub spoke_backoff: Duration,
    pub poll_interval: Duration,
}

impl ManagerConfig {
    /// Build from command line units, raising values that are too small to use.
    pub fn new(discovery_s: u64, reconnect_s: u64, spoke_backoff_ms: u64, poll_ms: u64) -> Self {
        ManagerConfig {
            discovery_interval: Duration::from_secs(discovery_s.max(1)),
            reconnect_interval: Duration::from_secs(reconnect_s.max(1)),
            spoke_backoff: Duration::from_millis(spoke_backoff_ms).max(MIN_SPOKE_BACKOFF),
            poll_interval: Duration::from_millis(poll_ms.max(1)),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            discovery_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            spoke_backoff: DEFAULT_RECONNECT_INTERVAL,
            poll_interval: Duration::from_millis(100),
        }
    }
}

///
/// The sessions of all radars the server currently reports, keyed by id.
/// Cloning gives another handle to the same set.
///
#[derive(Clone, Default)]
pub struct SharedSessions {
    sessions: Arc<RwLock<BTreeMap<String, Arc<RadarSession>>>>,
}

impl SharedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<RadarSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<RadarSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, session: Arc<RadarSession>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_owned(), session);
    }

    fn remove(&self, id: &str) -> Option<Arc<RadarSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    fn drain(&self) -> Vec<Arc<RadarSession>> {
        std::mem::take(&mut *self.sessions.write().unwrap_or_else(PoisonError::into_inner))
            .into_values()
            .collect()
    }
}

///
/// Keeps the set of sessions in line with what the server reports.
///
/// It is driven by `poll()`. While the server is reachable the radar list
/// is fetched every `discovery_interval`; new radars get a session that is
/// started right away, radars that disappeared are stopped and dropped,
/// the others get their state refreshed. When the server cannot be
/// reached it is tried again every `reconnect_interval` instead, and discovery
/// resumes on the poll after a successful attempt.
///
pub struct RadarManager {
    control: Arc<dyn ControlPlane>,
    config: ManagerConfig,
    sessions: SharedSessions,
    persistence: Option<Persistence>,
    running: bool,
    connected: bool,
    outage_logged: bool,
    known_ids: BTreeSet<String>,
    last_discovery: Option<Instant>,
    last_reconnect_attempt: Option<Instant>,
}

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.is_none_or(|t| now.saturating_duration_since(t) >= interval)
}

impl RadarManager {
    pub fn new(control: Arc<dyn ControlPlane>, config: ManagerConfig) -> Self {
        RadarManager {
            control,
            config,
            sessions: SharedSessions::new(),
            persistence: None,
            running: false,
            connected: false,
            outage_logged: false,
            known_ids: BTreeSet::new(),
            last_discovery: None,
            last_reconnect_attempt: None,
        }
    }

    /// Remember radars in, and fall back on, these settings.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn sessions(&self) -> SharedSessions {
        self.sessions.clone()
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        log::info!("Looking for radars at {}", self.control.address());
        self.running = true;
        self.last_discovery = None;
        self.last_reconnect_attempt = None;
    }

    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        for session in self.sessions.drain() {
            session.stop().await;
        }
        self.known_ids.clear();
        self.connected = false;
        log::info!("Stopped all radar sessions");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connection_status(&self) -> &'static str {
        if self.connected {
            "Connected"
        } else {
            "Disconnected"
        }
    }

    pub fn active_radars(&self) -> Vec<Arc<RadarSession>> {
        self.sessions.all()
    }

    pub fn radar(&self, id: &str) -> Option<Arc<RadarSession>> {
        self.sessions.get(id)
    }

    pub fn known_ids(&self) -> impl Iterator<Item = &str> {
        self.known_ids.iter().map(String::as_str)
    }

    pub async fn poll(&mut self) {
        self.poll_at(Instant::now()).await
    }

    pub async fn poll_at(&mut self, now: Instant) {
        if !self.running {
            return;
        }

        if self.connected {
            if is_due(self.last_discovery, self.config.discovery_interval, now) {
                self.last_discovery = Some(now);
                self.discover().await;
            }
        } else if is_due(
            self.last_reconnect_attempt,
            self.config.reconnect_interval,
            now,
        ) {
            self.last_reconnect_attempt = Some(now);
            self.try_reconnect().await;
        }
    }

    async fn try_reconnect(&mut self) {
        log::debug!("Trying to connect to {}", self.control.address());

        match self.control.radar_ids().await {
            Ok(ids) => {
                log::info!(
                    "Connected to {}, it reports {} radar(s)",
                    self.control.address(),
                    ids.len()
                );
                self.connected = true;
                self.outage_logged = false;
                self.last_discovery = None;
            }
            Err(e) => {
                self.connection_lost(e);
            }
        }
    }

    fn connection_lost(&mut self, e: RadarError) {
        self.connected = false;
        if !self.outage_logged {
            log::warn!("Cannot connect to {}: {}", self.control.address(), e);
            self.outage_logged = true;
        } else {
            log::debug!("Still no connection to {}: {}", self.control.address(), e);
        }
    }

    async fn discover(&mut self) {
        let ids = match self.control.radar_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                // Sessions keep running; their receivers retry on their own
                self.connection_lost(e);
                return;
            }
        };
        log::trace!("Discovery found {:?}", ids);

        let current: BTreeSet<String> = ids.into_iter().collect();

        for id in &current {
            if self.known_ids.contains(id) {
                if let Some(session) = self.sessions.get(id) {
                    self.refresh_capabilities(&session).await;
                    self.refresh(&session).await;
                }
            } else {
                self.handle_new_radar(id).await;
            }
        }

        let removed: Vec<String> = self.known_ids.difference(&current).cloned().collect();
        for id in removed {
            self.handle_removed_radar(&id).await;
        }
    }

    fn remembered_capabilities(&self, id: &str) -> Capabilities {
        let mut capabilities = Capabilities::default();
        if let Some(radar) = self.persistence.as_ref().and_then(|p| p.radar(id)) {
            capabilities.model = radar.model.clone().unwrap_or_default();
            if let Some(c) = radar.characteristics {
                capabilities.characteristics = c;
            }
        }
        capabilities
    }

    async fn handle_new_radar(&mut self, id: &str) {
        self.known_ids.insert(id.to_owned());

        let capabilities = match self.control.capabilities(id).await {
            Ok(c) => c,
            Err(e) => {
                let c = self.remembered_capabilities(id);
                log::warn!(
                    "{}: no capabilities ({}), assuming {}",
                    id,
                    e,
                    c.characteristics
                );
                c
            }
        };

        let session = Arc::new(RadarSession::new(
            id,
            &capabilities,
            &self.control.spoke_stream_url(id),
            self.config.spoke_backoff,
        ));
        self.refresh(&session).await;
        session.start().await;

        let info = session.info();
        log::info!(
            "Found radar '{}' name '{}' make '{}' with {}",
            id,
            info.name,
            info.brand,
            session.characteristics()
        );
        if let Some(persistence) = &mut self.persistence {
            persistence.store(&info, session.characteristics());
        }

        self.sessions.insert(session);
    }

    async fn handle_removed_radar(&mut self, id: &str) {
        self.known_ids.remove(id);

        if let Some(session) = self.sessions.remove(id) {
            log::info!("Radar '{}' is gone", id);
            session.stop().await;
        }
    }

    /// A radar that started out on assumed characteristics gets its real
    /// ones as soon as the server hands them out.
    async fn refresh_capabilities(&mut self, session: &RadarSession) {
        let id = session.id();
        let capabilities = match self.control.capabilities(id).await {
            Ok(c) => c,
            Err(e) => {
                log::trace!("{}: cannot get capabilities: {}", id, e);
                return;
            }
        };
        if session.update_capabilities(&capabilities).await {
            log::info!("{}: now using {}", id, session.characteristics());
            if let Some(persistence) = &mut self.persistence {
                persistence.store(&session.info(), session.characteristics());
            }
        }
    }

    async fn refresh(&self, session: &RadarSession) {
        let id = session.id();
        match self.control.state(id).await {
            Ok(state) => session.update_state(&state),
            Err(e) => log::debug!("{}: cannot get state: {}", id, e),
        }
        match self.control.targets(id).await {
            Ok(targets) => session.update_targets(targets),
            Err(e) => log::trace!("{}: cannot get targets: {}", id, e),
        }
    }

    ///
    /// Poll until shutdown is requested, then stop every session. A poll
    /// that has started runs to the end before shutdown is looked at.
    ///
    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), RadarError> {
        self.start();

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    log::debug!("Radar manager shutdown");
                    break;
                },
                _ = ticker.tick() => {}
            }
            self.poll().await;
        }

        self.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RadarState;
    use crate::radar::{ArpaTarget, Characteristics, RadarStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeServer {
        reachable: bool,
        radars: BTreeMap<String, Capabilities>,
        states: HashMap<String, RadarState>,
        capabilities_broken: bool,
    }

    #[derive(Default)]
    struct FakeControlPlane {
        server: Mutex<FakeServer>,
        id_requests: AtomicUsize,
    }

    impl FakeControlPlane {
        fn set_reachable(&self, reachable: bool) {
            self.server.lock().unwrap().reachable = reachable;
        }

        fn add_radar(&self, id: &str, spokes: usize, len: usize) {
            let capabilities = Capabilities {
                make: "Navico".to_owned(),
                model: "HALO".to_owned(),
                characteristics: Characteristics::new(spokes, len),
            };
            self.server
                .lock()
                .unwrap()
                .radars
                .insert(id.to_owned(), capabilities);
        }

        fn remove_radar(&self, id: &str) {
            self.server.lock().unwrap().radars.remove(id);
        }

        fn set_state(&self, id: &str, status: RadarStatus, range_meters: u32) {
            self.server.lock().unwrap().states.insert(
                id.to_owned(),
                RadarState {
                    status,
                    range_meters,
                    ..Default::default()
                },
            );
        }

        fn id_requests(&self) -> usize {
            self.id_requests.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn radar_ids(&self) -> Result<Vec<String>, RadarError> {
            self.id_requests.fetch_add(1, Ordering::Relaxed);
            let server = self.server.lock().unwrap();
            if !server.reachable {
                return Err(RadarError::NotConnected);
            }
            Ok(server.radars.keys().cloned().collect())
        }

        async fn capabilities(&self, id: &str) -> Result<Capabilities, RadarError> {
            let server = self.server.lock().unwrap();
            if server.capabilities_broken {
                return Err(RadarError::HttpStatus(500));
            }
            server
                .radars
                .get(id)
                .cloned()
                .ok_or_else(|| RadarError::NoSuchRadar(id.to_owned()))
        }

        async fn state(&self, id: &str) -> Result<RadarState, RadarError> {
            let server = self.server.lock().unwrap();
            server
                .states
                .get(id)
                .cloned()
                .ok_or_else(|| RadarError::NoSuchRadar(id.to_owned()))
        }

        async fn targets(&self, _id: &str) -> Result<Vec<ArpaTarget>, RadarError> {
            Ok(vec![ArpaTarget {
                target_id: 1,
                ..Default::default()
            }])
        }

        fn spoke_stream_url(&self, id: &str) -> String {
            // Nothing listens on port 9, receivers just keep retrying
            format!("ws://127.0.0.1:9/v2/api/radars/{}/spokes", id)
        }

        fn address(&self) -> String {
            "fake:6502".to_owned()
        }
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            discovery_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            spoke_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn manager(fake: &Arc<FakeControlPlane>) -> RadarManager {
        let control: Arc<dyn ControlPlane> = fake.clone();
        let mut manager = RadarManager::new(control, config());
        manager.start();
        manager
    }

    #[tokio::test]
    async fn connect_then_discover() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_reachable(true);
        fake.add_radar("radar-1", 2048, 512);
        fake.set_state("radar-1", RadarStatus::Transmit, 1852);
        let mut manager = manager(&fake);
        let t0 = Instant::now();

        // First poll only connects
        manager.poll_at(t0).await;
        assert!(manager.is_connected());
        assert_eq!(manager.connection_status(), "Connected");
        assert!(manager.active_radars().is_empty());

        // The next one discovers
        manager.poll_at(t0 + Duration::from_millis(100)).await;
        let session = manager.radar("radar-1").unwrap();
        assert_eq!(session.status(), RadarStatus::Transmit);
        assert_eq!(session.range_meters(), 1852);
        assert_eq!(session.targets().len(), 1);
        assert_eq!(session.info().name, "HALO");
        assert!(session.is_started().await);

        manager.stop().await;
        assert!(manager.active_radars().is_empty());
        assert!(!session.is_started().await);
    }

    #[tokio::test]
    async fn discovery_diff() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_reachable(true);
        fake.add_radar("radar-1", 2048, 512);
        fake.add_radar("radar-2", 4096, 1024);
        let mut manager = manager(&fake);
        let t0 = Instant::now();

        manager.poll_at(t0).await;
        manager.poll_at(t0).await;
        assert_eq!(manager.known_ids().collect::<Vec<_>>(), vec!["radar-1", "radar-2"]);
        assert_eq!(
            manager.radar("radar-2").unwrap().characteristics(),
            Characteristics::new(4096, 1024)
        );
        let first = manager.radar("radar-1").unwrap();
        let gone = manager.radar("radar-2").unwrap();

        fake.remove_radar("radar-2");
        fake.add_radar("radar-3", 2048, 512);
        fake.set_state("radar-1", RadarStatus::Standby, 926);

        // Not due yet
        manager.poll_at(t0 + Duration::from_secs(5)).await;
        assert!(manager.radar("radar-3").is_none());

        manager.poll_at(t0 + Duration::from_secs(10)).await;
        assert_eq!(manager.known_ids().collect::<Vec<_>>(), vec!["radar-1", "radar-3"]);
        assert!(manager.radar("radar-2").is_none());
        assert!(!gone.is_started().await);

        // Existing sessions are kept and updated
        let still = manager.radar("radar-1").unwrap();
        assert!(Arc::ptr_eq(&first, &still));
        assert_eq!(still.status(), RadarStatus::Standby);
        assert_eq!(still.range_meters(), 926);

        manager.stop().await;
    }

    #[tokio::test]
    async fn outage_and_reconnect() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_radar("radar-1", 2048, 512);
        let mut manager = manager(&fake);
        let t0 = Instant::now();

        manager.poll_at(t0).await;
        assert!(!manager.is_connected());
        assert_eq!(manager.connection_status(), "Disconnected");
        assert_eq!(fake.id_requests(), 1);

        // Reconnect attempts only happen every reconnect interval
        manager.poll_at(t0 + Duration::from_secs(1)).await;
        assert_eq!(fake.id_requests(), 1);
        manager.poll_at(t0 + Duration::from_secs(5)).await;
        assert_eq!(fake.id_requests(), 2);

        fake.set_reachable(true);
        manager.poll_at(t0 + Duration::from_secs(10)).await;
        assert!(manager.is_connected());
        manager.poll_at(t0 + Duration::from_secs(10)).await;
        assert!(manager.radar("radar-1").is_some());

        // Losing the server keeps the sessions around
        fake.set_reachable(false);
        manager.poll_at(t0 + Duration::from_secs(20)).await;
        assert!(!manager.is_connected());
        assert!(manager.radar("radar-1").is_some());

        manager.stop().await;
    }

    #[tokio::test]
    async fn remembered_characteristics_when_capabilities_fail() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_reachable(true);
        fake.add_radar("radar-1", 2048, 512);
        fake.server.lock().unwrap().capabilities_broken = true;

        let mut persistence = Persistence::in_memory();
        persistence.config.radars.insert(
            "radar-1".to_owned(),
            crate::config::Radar {
                name: "Mast".to_owned(),
                model: Some("4G".to_owned()),
                characteristics: Some(Characteristics::new(2048, 1024)),
            },
        );

        let control: Arc<dyn ControlPlane> = fake.clone();
        let mut manager = RadarManager::new(control, config()).with_persistence(persistence);
        manager.start();
        let t0 = Instant::now();
        manager.poll_at(t0).await;
        manager.poll_at(t0).await;

        let session = manager.radar("radar-1").unwrap();
        assert_eq!(session.characteristics(), Characteristics::new(2048, 1024));
        assert_eq!(session.info().model, "4G");

        // A radar nobody remembers gets the defaults
        fake.add_radar("radar-2", 4096, 1024);
        manager.poll_at(t0 + Duration::from_secs(10)).await;
        assert_eq!(
            manager.radar("radar-2").unwrap().characteristics(),
            Characteristics::default()
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn capabilities_are_fetched_again_until_they_arrive() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_reachable(true);
        fake.add_radar("radar-1", 4096, 1024);
        fake.server.lock().unwrap().capabilities_broken = true;
        let mut manager = manager(&fake);
        let t0 = Instant::now();

        manager.poll_at(t0).await;
        manager.poll_at(t0).await;
        let session = manager.radar("radar-1").unwrap();
        assert_eq!(session.characteristics(), Characteristics::default());

        fake.server.lock().unwrap().capabilities_broken = false;
        manager.poll_at(t0 + Duration::from_secs(10)).await;

        let same = manager.radar("radar-1").unwrap();
        assert!(Arc::ptr_eq(&session, &same));
        assert_eq!(same.characteristics(), Characteristics::new(4096, 1024));
        assert_eq!(same.sweep().characteristics().spokes_per_revolution, 4096);
        assert!(same.is_started().await);

        manager.stop().await;
    }

    #[test]
    fn config_from_arguments() {
        assert_eq!(ManagerConfig::new(10, 5, 5000, 100), ManagerConfig::default());

        let config = ManagerConfig::new(0, 0, 0, 0);
        assert_eq!(config.discovery_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.spoke_backoff, MIN_SPOKE_BACKOFF);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn shutdown_stops_sessions() {
        use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

        let fake = Arc::new(FakeControlPlane::default());
        fake.set_reachable(true);
        fake.add_radar("radar-1", 2048, 512);
        let control: Arc<dyn ControlPlane> = fake.clone();
        let manager = RadarManager::new(control, ManagerConfig::new(10, 5, 60_000, 10));
        let sessions = manager.sessions();

        let seen: Arc<Mutex<Option<Arc<RadarSession>>>> = Arc::new(Mutex::new(None));
        let watched = sessions.clone();
        let seen_by_watcher = seen.clone();

        let toplevel = Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("Radar manager", |a| manager.run(a)));
            s.start(SubsystemBuilder::new(
                "Watcher",
                move |a: SubsystemHandle| async move {
                    while watched.is_empty() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    *seen_by_watcher.lock().unwrap() = watched.all().into_iter().next();
                    a.request_shutdown();
                    Ok::<(), RadarError>(())
                },
            ));
        })
        .handle_shutdown_requests(Duration::from_secs(5));

        tokio::time::timeout(Duration::from_secs(10), toplevel)
            .await
            .unwrap()
            .unwrap();

        let session = seen.lock().unwrap().take().unwrap();
        assert_eq!(session.id(), "radar-1");
        assert!(!session.is_started().await);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn nothing_happens_when_not_started() {
        let fake = Arc::new(FakeControlPlane::default());
        let control: Arc<dyn ControlPlane> = fake.clone();
        let mut manager = RadarManager::new(control, config());

        manager.poll().await;
        assert_eq!(fake.id_requests(), 0);
        assert!(!manager.is_running());
    }
}
