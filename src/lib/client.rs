use async_trait::async_trait;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::radar::{ArpaTarget, Characteristics, RadarError, RadarStatus};

pub const DEFAULT_PORT: u16 = 6502;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_PREFIX: &str = "/v2/api";

///
/// What the radar manager needs from the server. `ControlClient` is the
/// HTTP implementation; tests drive the manager with an in-memory one.
///
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn radar_ids(&self) -> Result<Vec<String>, RadarError>;
    async fn capabilities(&self, id: &str) -> Result<Capabilities, RadarError>;
    async fn state(&self, id: &str) -> Result<RadarState, RadarError>;
    async fn targets(&self, id: &str) -> Result<Vec<ArpaTarget>, RadarError>;
    fn spoke_stream_url(&self, id: &str) -> String;
    fn address(&self) -> String;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub make: String,
    pub model: String,
    pub characteristics: Characteristics,
}

impl Capabilities {
    /// Display name: the model when known, the radar id otherwise.
    pub fn name(&self, id: &str) -> String {
        if self.model.is_empty() {
            id.to_owned()
        } else {
            self.model.clone()
        }
    }
}

/// Value of a single control, in any of the shapes the server uses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Number(f64),
    Text(String),
    Mode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
    },
}

impl ControlValue {
    pub fn with_mode(value: i32, auto: bool) -> Self {
        ControlValue::Mode {
            mode: Some(if auto { "auto" } else { "manual" }.to_owned()),
            value: Some(value as f64),
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            ControlValue::Number(n) => Some(*n),
            ControlValue::Text(s) => s.parse().ok(),
            ControlValue::Mode { value, .. } => *value,
        }
    }

    pub fn mode(&self) -> Option<&str> {
        match self {
            ControlValue::Mode { mode, .. } => mode.as_deref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RadarState {
    pub status: RadarStatus,
    pub range_meters: u32,
    pub controls: HashMap<String, ControlValue>,
}

#[derive(Deserialize)]
struct StateReply {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    controls: HashMap<String, Value>,
}

impl From<StateReply> for RadarState {
    fn from(reply: StateReply) -> Self {
        let mut controls = HashMap::new();
        for (id, value) in reply.controls {
            match serde_json::from_value::<ControlValue>(value) {
                Ok(v) => {
                    controls.insert(id, v);
                }
                Err(e) => {
                    log::trace!("Ignoring control '{}': {}", id, e);
                }
            }
        }
        let range_meters = controls
            .get("range")
            .and_then(ControlValue::value)
            .filter(|r| *r > 0.)
            .map(|r| r.round() as u32)
            .unwrap_or(0);

        RadarState {
            status: RadarStatus::from_value(&reply.status),
            range_meters,
            controls,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetsReply {
    Wrapped { targets: Vec<ArpaTarget> },
    List(Vec<ArpaTarget>),
}

#[derive(Serialize)]
struct AcquireRequest {
    bearing: f64,
    distance: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireReply {
    target_id: i32,
}

///
/// REST client for the radar server's `/v2/api`.
///
#[derive(Clone, Debug)]
pub struct ControlClient {
    host: String,
    port: u16,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(host: &str, port: u16) -> Result<Self, RadarError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(ControlClient {
            host: host.to_owned(),
            port,
            http,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn api_url(&self, path: &str) -> String {
        format!("http://{}:{}{}{}", self.host, self.port, API_PREFIX, path)
    }

    fn stream_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}{}", self.host, self.port, API_PREFIX, path)
    }

    pub fn target_stream_url(&self, id: &str) -> String {
        self.stream_url(&format!("/radars/{}/targets/stream", id))
    }

    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, RadarError> {
        let url = self.api_url(path);
        log::trace!("{} {}", method, url);

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            log::debug!("{}: HTTP {}", url, status);
            return Err(RadarError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RadarError> {
        let response = self.request::<()>(Method::GET, path, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RadarError::ParseJson(format!("{}: {}", path, e)))
    }

    pub async fn set_control(
        &self,
        id: &str,
        control: &str,
        value: &ControlValue,
    ) -> Result<(), RadarError> {
        log::debug!("{}: set {} to {:?}", id, control, value);
        self.request(
            Method::PUT,
            &format!("/radars/{}/controls/{}", id, control),
            Some(value),
        )
        .await?;
        Ok(())
    }

    pub async fn set_power(&self, id: &str, status: RadarStatus) -> Result<(), RadarError> {
        self.set_control(id, "power", &ControlValue::Text(status.to_string()))
            .await
    }

    pub async fn set_range(&self, id: &str, meters: f64) -> Result<(), RadarError> {
        self.set_control(id, "range", &ControlValue::Number(meters))
            .await
    }

    pub async fn set_gain(&self, id: &str, value: i32, auto: bool) -> Result<(), RadarError> {
        self.set_control(id, "gain", &ControlValue::with_mode(value, auto))
            .await
    }

    pub async fn set_sea(&self, id: &str, value: i32, auto: bool) -> Result<(), RadarError> {
        self.set_control(id, "sea", &ControlValue::with_mode(value, auto))
            .await
    }

    pub async fn set_rain(&self, id: &str, value: i32) -> Result<(), RadarError> {
        self.set_control(id, "rain", &ControlValue::Number(value as f64))
            .await
    }

    /// Ask the server to start tracking whatever is at this position.
    pub async fn acquire_target(
        &self,
        id: &str,
        bearing: f64,
        distance: f64,
    ) -> Result<i32, RadarError> {
        let response = self
            .request(
                Method::POST,
                &format!("/radars/{}/targets", id),
                Some(&AcquireRequest { bearing, distance }),
            )
            .await?;
        let reply: AcquireReply = response
            .json()
            .await
            .map_err(|e| RadarError::ParseJson(e.to_string()))?;
        Ok(reply.target_id)
    }

    pub async fn cancel_target(&self, id: &str, target_id: i32) -> Result<(), RadarError> {
        self.request::<()>(
            Method::DELETE,
            &format!("/radars/{}/targets/{}", id, target_id),
            None,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ControlClient {
    async fn radar_ids(&self) -> Result<Vec<String>, RadarError> {
        let reply: Value = self.get("/radars").await?;
        let Value::Array(ids) = reply else {
            return Err(RadarError::ParseJson(format!(
                "radar list is not an array: {}",
                reply
            )));
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| match id {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn capabilities(&self, id: &str) -> Result<Capabilities, RadarError> {
        let mut capabilities: Capabilities =
            self.get(&format!("/radars/{}/capabilities", id)).await?;
        capabilities.characteristics = capabilities
            .characteristics
            .sanitized(Characteristics::default());
        Ok(capabilities)
    }

    async fn state(&self, id: &str) -> Result<RadarState, RadarError> {
        let reply: StateReply = self.get(&format!("/radars/{}/state", id)).await?;
        Ok(reply.into())
    }

    async fn targets(&self, id: &str) -> Result<Vec<ArpaTarget>, RadarError> {
        let reply: TargetsReply = self.get(&format!("/radars/{}/targets", id)).await?;
        Ok(match reply {
            TargetsReply::Wrapped { targets } => targets,
            TargetsReply::List(targets) => targets,
        })
    }

    fn spoke_stream_url(&self, id: &str) -> String {
        self.stream_url(&format!("/radars/{}/spokes", id))
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
