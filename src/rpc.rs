//! Shelly Gen2 JSON-RPC methods, shared by the UDP and WebSocket servers.

use crate::calculator::power_factor;
use crate::device::{DeviceIdentity, FIRMWARE_ID};
use crate::error::EmulatorError;
use crate::snapshot::{DeviceSnapshot, PhaseLabel, PhaseLayout};
use crate::snapshot_cache::{CachedSnapshot, SnapshotCache};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

pub const METHOD_NOT_FOUND: i32 = -32601;
pub const PARSE_ERROR: i32 = -32700;
pub const DEFAULT_DST: &str = "unknown";

const CT_TYPES: [&str; 2] = ["120A", "50A"];
const COMPONENT_KEYS: [&str; 2] = ["em:0", "emdata:0"];
const METHODS: [&str; 10] = [
    "Shelly.ListMethods",
    "Shelly.GetDeviceInfo",
    "Shelly.GetStatus",
    "Shelly.GetConfig",
    "Shelly.GetComponents",
    "EM.GetStatus",
    "EM.GetConfig",
    "EM.GetCTTypes",
    "EM1.GetStatus",
    "EMData.GetStatus",
];
/// Added to whole-number powers on UDP, whose clients reject integers.
const DECIMAL_ENFORCER: f64 = 0.001;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<RpcParams>,
    #[serde(default)]
    pub src: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcParams {
    #[serde(default)]
    pub id: Option<i64>,
    /// `Shelly.GetComponents` paging and filters.
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<&EmulatorError> for RpcError {
    fn from(error: &EmulatorError) -> Self {
        match error {
            EmulatorError::MethodNotFound(_) => Self {
                code: METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
            },
            EmulatorError::ProtocolParse(_) | EmulatorError::Json(_) => Self {
                code: PARSE_ERROR,
                message: "Parse error".to_string(),
            },
            other => Self {
                code: -32000,
                message: format!("Internal error: {other}"),
            },
        }
    }
}

/// Shelly-style envelope: the request id echoed back with `src`/`dst`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    pub src: String,
    pub dst: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    WebSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    EmGetStatus,
    Em1GetStatus,
    EmDataGetStatus,
    GetDeviceInfo,
    EmGetCtTypes,
    EmGetConfig,
    ShellyGetStatus,
    ShellyGetConfig,
    ShellyGetComponents,
    ShellyListMethods,
}

impl Method {
    fn parse(name: &str) -> Result<Self, EmulatorError> {
        match name {
            "EM.GetStatus" => Ok(Method::EmGetStatus),
            "EM1.GetStatus" => Ok(Method::Em1GetStatus),
            "EMData.GetStatus" => Ok(Method::EmDataGetStatus),
            "Shelly.GetDeviceInfo" => Ok(Method::GetDeviceInfo),
            "EM.GetCTTypes" => Ok(Method::EmGetCtTypes),
            "EM.GetConfig" => Ok(Method::EmGetConfig),
            "Shelly.GetStatus" => Ok(Method::ShellyGetStatus),
            "Shelly.GetConfig" => Ok(Method::ShellyGetConfig),
            "Shelly.GetComponents" => Ok(Method::ShellyGetComponents),
            "Shelly.ListMethods" => Ok(Method::ShellyListMethods),
            other => Err(EmulatorError::MethodNotFound(other.to_string())),
        }
    }
}

/// Answers RPC requests from the snapshot cache.
#[derive(Clone)]
pub struct RpcHandler {
    identity: Arc<DeviceIdentity>,
    cache: SnapshotCache,
    started: Instant,
}

impl RpcHandler {
    pub fn new(identity: Arc<DeviceIdentity>, cache: SnapshotCache) -> Self {
        Self {
            identity,
            cache,
            started: Instant::now(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Parses and answers a raw request. Never fails: malformed input yields
    /// a parse-error response with a null id.
    pub fn handle_text(&self, text: &str, transport: Transport, dst: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(text) {
            Ok(request) => self.handle(&request, transport, dst),
            Err(e) => self.parse_error(dst, &e),
        }
    }

    /// Response for a frame that did not deserialize as a request.
    pub fn parse_error(&self, dst: &str, error: &serde_json::Error) -> RpcResponse {
        let error = EmulatorError::ProtocolParse(error.to_string());
        self.error_response(Value::Null, dst, &error)
    }

    pub fn handle(&self, request: &RpcRequest, transport: Transport, dst: &str) -> RpcResponse {
        let params = request.params.clone().unwrap_or_default();
        let component = params.id.unwrap_or(0);
        let method = match Method::parse(&request.method) {
            Ok(method) => method,
            Err(e) => return self.error_response(request.id.clone(), dst, &e),
        };

        // One read per request keeps every field from the same poll cycle
        let cached = self.cache.current();
        let result = match method {
            Method::EmGetStatus => em_status(&cached, component, transport),
            Method::Em1GetStatus => em1_status(&cached, component, transport),
            Method::EmDataGetStatus => emdata_status(&cached, component),
            Method::GetDeviceInfo => self.identity.device_info(),
            Method::EmGetCtTypes => json!({ "types": CT_TYPES }),
            Method::EmGetConfig => em_config(component),
            Method::ShellyGetStatus => json!({
                "sys": self.sys_status(&cached),
                "wifi": { "status": "got ip", "ssid": "WiFi", "rssi": -55 },
                "em:0": em_status(&cached, 0, transport),
                "emdata:0": emdata_status(&cached, 0),
            }),
            Method::ShellyGetConfig => self.config(),
            Method::ShellyGetComponents => components(&params, || {
                (
                    json!({
                        "em:0": em_status(&cached, 0, transport),
                        "emdata:0": emdata_status(&cached, 0),
                    }),
                    json!({ "em:0": em_config(0), "emdata:0": { "id": 0 } }),
                )
            }),
            Method::ShellyListMethods => json!({ "methods": METHODS }),
        };

        RpcResponse {
            id: request.id.clone(),
            src: self.identity.device_id().to_string(),
            dst: dst.to_string(),
            result: Some(result),
            error: None,
        }
    }

    fn error_response(&self, id: Value, dst: &str, error: &EmulatorError) -> RpcResponse {
        RpcResponse {
            id,
            src: self.identity.device_id().to_string(),
            dst: dst.to_string(),
            result: None,
            error: Some(RpcError::from(error)),
        }
    }

    fn sys_status(&self, cached: &CachedSnapshot) -> Value {
        let now = chrono::Local::now();
        json!({
            "mac": self.identity.mac_hex(),
            "restart_required": false,
            "time": now.format("%H:%M").to_string(),
            "unixtime": now.timestamp(),
            "uptime": self.started.elapsed().as_secs(),
            "last_sync_ts": cached.snapshot.captured_at().timestamp(),
            "available_updates": {},
        })
    }

    fn config(&self) -> Value {
        json!({
            "sys": {
                "device": {
                    "name": self.identity.name(),
                    "mac": self.identity.mac_hex(),
                    "fw_id": FIRMWARE_ID,
                    "discoverable": true,
                }
            },
            "wifi": {
                "ap": { "enable": false },
                "sta": { "enable": true, "ssid": "WiFi" },
                "sta1": { "enable": false },
            },
            "em:0": em_config(0),
        })
    }

    /// `NotifyStatus` frame pushed to WebSocket clients after each publish.
    pub fn notify_status(&self, snapshot: Arc<DeviceSnapshot>, dst: &str) -> Value {
        let cached = CachedSnapshot {
            snapshot,
            stale: false,
        };
        let ts = cached.snapshot.captured_at().timestamp_millis() as f64 / 1000.0;
        json!({
            "src": self.identity.device_id(),
            "dst": dst,
            "method": "NotifyStatus",
            "params": {
                "ts": ts,
                "em:0": em_status(&cached, 0, Transport::WebSocket),
                "emdata:0": emdata_status(&cached, 0),
            }
        })
    }
}

pub fn em_config(component: i64) -> Value {
    json!({
        "id": component,
        "name": null,
        "blink_mode_selector": "active_energy",
        "phase_selector": "all",
        "monitor_phase_sequence": false,
        "ct_type": CT_TYPES[0],
        "reverse": {},
    })
}

/// Component listing with optional `status`/`config` per entry. `build`
/// only runs when `include` asks for either.
fn components<F>(params: &RpcParams, build: F) -> Value
where
    F: FnOnce() -> (Value, Value),
{
    let with_status = params.include.iter().any(|i| i == "status");
    let with_config = params.include.iter().any(|i| i == "config");
    let (statuses, configs) = if with_status || with_config {
        build()
    } else {
        (Value::Null, Value::Null)
    };

    let selected: Vec<&str> = COMPONENT_KEYS
        .iter()
        .copied()
        .filter(|key| match &params.keys {
            Some(keys) => keys.iter().any(|k| k == key),
            None => true,
        })
        .collect();
    let offset = params.offset.unwrap_or(0);
    let entries: Vec<Value> = selected
        .iter()
        .skip(offset)
        .map(|key| {
            let mut entry = Map::new();
            entry.insert("key".into(), json!(key));
            if with_status {
                entry.insert("status".into(), statuses[*key].clone());
            }
            if with_config {
                entry.insert("config".into(), configs[*key].clone());
            }
            Value::Object(entry)
        })
        .collect();

    json!({
        "components": entries,
        "cfg_rev": 0,
        "offset": offset,
        "total": selected.len(),
    })
}

fn errors(cached: &CachedSnapshot) -> Vec<&'static str> {
    if cached.stale {
        vec!["power_meter_failure"]
    } else {
        Vec::new()
    }
}

fn power(value: f64, transport: Transport) -> f64 {
    match transport {
        Transport::Udp => enforce_decimal(value),
        Transport::WebSocket => round(value, 1),
    }
}

/// Full three-phase status. Stale snapshots keep their last values and
/// report `power_meter_failure`.
pub fn em_status(cached: &CachedSnapshot, component: i64, transport: Transport) -> Value {
    let snapshot = &cached.snapshot;
    let mut status = Map::new();
    status.insert("id".into(), json!(component));

    for label in PhaseLabel::ALL {
        let phase = snapshot.phase_or_idle(label);
        let p = label.prefix();
        status.insert(format!("{p}_current"), json!(round(phase.current, 3)));
        status.insert(format!("{p}_voltage"), json!(round(phase.voltage, 1)));
        status.insert(format!("{p}_act_power"), json!(power(phase.active_power, transport)));
        status.insert(format!("{p}_aprt_power"), json!(round(phase.apparent_power, 1)));
        status.insert(format!("{p}_pf"), json!(round(phase.power_factor, 2)));
        status.insert(format!("{p}_freq"), json!(round(phase.frequency, 1)));
        status.insert(format!("{p}_errors"), json!([]));
    }

    status.insert("n_current".into(), Value::Null);
    status.insert("n_errors".into(), json!([]));
    status.insert("total_current".into(), json!(round(snapshot.total_current(), 3)));
    status.insert(
        "total_act_power".into(),
        json!(power(snapshot.total_active_power(), transport)),
    );
    status.insert(
        "total_aprt_power".into(),
        json!(round(snapshot.total_apparent_power(), 1)),
    );
    status.insert("user_calibrated_phase".into(), json!([]));
    status.insert("errors".into(), json!(errors(cached)));
    Value::Object(status)
}

/// Aggregate-only status in the single-channel EM1 shape.
pub fn em1_status(cached: &CachedSnapshot, component: i64, transport: Transport) -> Value {
    let snapshot = &cached.snapshot;
    let line = snapshot.phase_or_idle(PhaseLabel::A);
    let active = snapshot.total_active_power();
    let apparent = snapshot.total_apparent_power();
    json!({
        "id": component,
        "current": round(snapshot.total_current(), 3),
        "voltage": round(line.voltage, 1),
        "act_power": power(active, transport),
        "aprt_power": round(apparent, 1),
        "pf": round(power_factor(active, apparent), 2),
        "freq": round(line.frequency, 1),
        "calibration": "factory",
        "errors": errors(cached),
    })
}

/// Energy counters. Only single-phase meters attribute them to a phase.
pub fn emdata_status(cached: &CachedSnapshot, component: i64) -> Value {
    let snapshot = &cached.snapshot;
    let energy = snapshot.energy();
    let mut status = Map::new();
    status.insert("id".into(), json!(component));
    for label in PhaseLabel::ALL {
        let (act, ret) = match (snapshot.layout(), label) {
            (PhaseLayout::SinglePhase, PhaseLabel::A) => {
                (energy.consumption_total, energy.production_total)
            }
            _ => (0.0, 0.0),
        };
        let p = label.prefix();
        status.insert(format!("{p}_total_act_energy"), json!(round(act, 2)));
        status.insert(format!("{p}_total_act_ret_energy"), json!(round(ret, 2)));
    }
    status.insert("total_act".into(), json!(round(energy.consumption_total, 2)));
    status.insert("total_act_ret".into(), json!(round(energy.production_total, 2)));
    Value::Object(status)
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Rounds to 0.1 W and nudges whole numbers off the integer by 0.001 W in
/// the direction of their sign.
pub fn enforce_decimal(value: f64) -> f64 {
    if value.abs() < 0.1 {
        return if value >= 0.0 {
            DECIMAL_ENFORCER
        } else {
            -DECIMAL_ENFORCER
        };
    }
    let rounded = round(value, 1);
    if rounded == rounded.round() {
        if rounded >= 0.0 {
            rounded + DECIMAL_ENFORCER
        } else {
            rounded - DECIMAL_ENFORCER
        }
    } else {
        rounded
    }
}
