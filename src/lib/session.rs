use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::client::{Capabilities, ControlValue, RadarState};
use crate::radar::sweep::SweepBuffer;
use crate::radar::{ArpaTarget, Characteristics, RadarStatus};
use crate::receiver::{ReceiverStatistics, SpokeReceiver};

/// Who a radar is, as far as the capability manifest tells us.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RadarInfo {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub model: String,
}

impl RadarInfo {
    fn new(id: &str, capabilities: &Capabilities) -> Self {
        RadarInfo {
            id: id.to_owned(),
            name: capabilities.name(id),
            brand: capabilities.make.clone(),
            model: capabilities.model.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SessionState {
    status: RadarStatus,
    range_meters: u32,
    controls: HashMap<String, ControlValue>,
    targets: Vec<ArpaTarget>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub id: String,
    pub status: RadarStatus,
    pub range_meters: u32,
    pub characteristics: Characteristics,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub receiver: Option<ReceiverStatistics>,
}

///
/// Everything the client keeps for one radar: its sweep buffer, the
/// receiver filling it and the last known state from the control plane.
///
/// The buffer is shared with readers through `sweep()`. When the radar
/// changes its geometry a new buffer replaces the old one, so readers
/// should fetch it again rather than keep it forever.
///
pub struct RadarSession {
    id: String,
    spoke_url: String,
    reconnect_interval: Duration,
    info: RwLock<RadarInfo>,
    sweep: RwLock<Arc<SweepBuffer>>,
    state: RwLock<SessionState>,
    receiver: tokio::sync::Mutex<Option<SpokeReceiver>>,
}

impl RadarSession {
    pub fn new(
        id: &str,
        capabilities: &Capabilities,
        spoke_url: &str,
        reconnect_interval: Duration,
    ) -> Self {
        let characteristics = capabilities
            .characteristics
            .sanitized(Characteristics::default());
        log::debug!("{}: new session, sweep of {}", id, characteristics);

        RadarSession {
            id: id.to_owned(),
            spoke_url: spoke_url.to_owned(),
            reconnect_interval,
            info: RwLock::new(RadarInfo::new(id, capabilities)),
            sweep: RwLock::new(Arc::new(SweepBuffer::with_characteristics(characteristics))),
            state: RwLock::new(SessionState::default()),
            receiver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spoke_url(&self) -> &str {
        &self.spoke_url
    }

    pub fn info(&self) -> RadarInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sweep(&self) -> Arc<SweepBuffer> {
        self.sweep
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn characteristics(&self) -> Characteristics {
        self.sweep().characteristics()
    }

    fn new_receiver(&self, sweep: Arc<SweepBuffer>) -> SpokeReceiver {
        let mut receiver = SpokeReceiver::new(&self.id, &self.spoke_url, self.reconnect_interval);
        receiver.start(move |spoke| {
            sweep.write_spoke(spoke.angle, &spoke.samples, spoke.range_meters);
        });
        receiver
    }

    /// Start filling the sweep. Returns immediately; the connection is made
    /// in the background.
    pub async fn start(&self) {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            log::debug!("{}: already receiving", self.id);
            return;
        }
        log::info!("{}: start receiving spokes from {}", self.id, self.spoke_url);
        *receiver = Some(self.new_receiver(self.sweep()));
    }

    /// Stop and drop the receiver. The sweep keeps the last image.
    pub async fn stop(&self) {
        let receiver = self.receiver.lock().await.take();
        if let Some(mut receiver) = receiver {
            log::info!("{}: stop receiving spokes", self.id);
            receiver.stop().await;
        }
    }

    pub async fn is_started(&self) -> bool {
        self.receiver.lock().await.is_some()
    }

    pub async fn is_receiving(&self) -> bool {
        self.receiver
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| r.is_connected())
    }

    ///
    /// Take a new capability manifest. When the spoke count or the spoke
    /// length changed the sweep is replaced by a new, empty one, and a
    /// running receiver is restarted so it writes into the new sweep.
    /// Returns whether that happened.
    ///
    pub async fn update_capabilities(&self, capabilities: &Capabilities) -> bool {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) =
            RadarInfo::new(&self.id, capabilities);

        let current = self.characteristics();
        let wanted = capabilities.characteristics.sanitized(current);
        if wanted == current {
            return false;
        }

        log::info!(
            "{}: sweep changes from {} to {}",
            self.id,
            current,
            wanted
        );

        let mut receiver = self.receiver.lock().await;
        let was_running = match receiver.take() {
            Some(mut r) => {
                r.stop().await;
                true
            }
            None => false,
        };

        let sweep = Arc::new(SweepBuffer::with_characteristics(wanted));
        *self.sweep.write().unwrap_or_else(PoisonError::into_inner) = sweep.clone();

        if was_running {
            *receiver = Some(self.new_receiver(sweep));
        }
        true
    }

    pub fn update_state(&self, state: &RadarState) {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if s.status != state.status {
            log::info!("{}: status {} -> {}", self.id, s.status, state.status);
        }
        s.status = state.status;
        s.range_meters = state.range_meters;
        s.controls = state.controls.clone();
    }

    pub fn update_targets(&self, targets: Vec<ArpaTarget>) {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if s.targets.len() != targets.len() {
            log::debug!("{}: tracking {} targets", self.id, targets.len());
        }
        s.targets = targets;
    }

    pub fn status(&self) -> RadarStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn range_meters(&self) -> u32 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range_meters
    }

    pub fn control(&self, control: &str) -> Option<ControlValue> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .controls
            .get(control)
            .cloned()
    }

    pub fn targets(&self) -> Vec<ArpaTarget> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .clone()
    }

    pub async fn statistics(&self) -> SessionStatistics {
        let sweep = self.sweep();
        let receiver = self.receiver.lock().await.as_ref().map(|r| r.statistics());
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        SessionStatistics {
            id: self.id.clone(),
            status: state.status,
            range_meters: state.range_meters,
            characteristics: sweep.characteristics(),
            rows_written: sweep.rows_written(),
            rows_rejected: sweep.rejected(),
            receiver,
        }
    }
}

impl std::fmt::Debug for RadarSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RadarSession {{ id: {}, url: {}, status: {} }}",
            self.id,
            self.spoke_url,
            self.status()
        )
    }
}
