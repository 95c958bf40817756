//! Decoded system state and its JSON shapes.
//!
//! Two serializations exist: the structured form (plain serde) and the flat
//! legacy form consumed by the old frontend and the MQTT topic, which
//! differs in three ways — `all_mode` becomes an integer, a top-level epoch
//! `time` field is added, and zone damper positions become strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operating mode as shown on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    Heat,
    Cool,
    Auto,
    EHeat,
    Off,
}

impl SystemMode {
    /// Row 1.12 encoding.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SystemMode::Heat,
            1 => SystemMode::Cool,
            2 => SystemMode::Auto,
            3 => SystemMode::EHeat,
            _ => SystemMode::Off,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            SystemMode::Heat => 0,
            SystemMode::Cool => 1,
            SystemMode::Auto => 2,
            SystemMode::EHeat => 3,
            SystemMode::Off => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanMode {
    Auto,
    On,
}

impl FanMode {
    pub fn from_raw(raw: u8) -> Self {
        if raw == 1 {
            FanMode::On
        } else {
            FanMode::Auto
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            FanMode::Auto => 0,
            FanMode::On => 1,
        }
    }
}

/// Per-zone state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub zone_id: u8,
    pub temperature: i32,
    pub damper_position: u8,
    pub cool_setpoint: u8,
    pub heat_setpoint: u8,
    pub temporary: bool,
    pub hold: bool,
    pub out: bool,
}

/// The decoded snapshot assembled from one full read sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub system_time: String,
    pub system_mode: SystemMode,
    pub effective_mode: SystemMode,
    pub fan_mode: FanMode,
    pub fan_state: String,
    pub active_state: String,
    pub all_mode: bool,
    pub outside_temp: i32,
    pub air_handler_temp: i32,
    pub zone1_humidity: u8,
    #[serde(default)]
    pub compressor_stage_1: bool,
    #[serde(default)]
    pub compressor_stage_2: bool,
    #[serde(default)]
    pub aux_heat_stage_1: bool,
    #[serde(default)]
    pub aux_heat_stage_2: bool,
    #[serde(default)]
    pub humidify: bool,
    #[serde(default)]
    pub dehumidify: bool,
    #[serde(default)]
    pub reversing_valve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub zones: Vec<ZoneStatus>,
}

impl SystemStatus {
    /// Placeholder returned when no snapshot has ever been decoded.
    pub fn empty() -> Self {
        SystemStatus {
            system_time: "--:--".to_string(),
            system_mode: SystemMode::Off,
            effective_mode: SystemMode::Off,
            fan_mode: FanMode::Auto,
            fan_state: "Off".to_string(),
            active_state: "Idle".to_string(),
            all_mode: false,
            outside_temp: 0,
            air_handler_temp: 0,
            zone1_humidity: 0,
            compressor_stage_1: false,
            compressor_stage_2: false,
            aux_heat_stage_1: false,
            aux_heat_stage_2: false,
            humidify: false,
            dehumidify: false,
            reversing_valve: false,
            raw: None,
            zones: Vec::new(),
        }
    }

    /// Structured JSON payload. The raw blob is withheld unless asked for.
    pub fn to_payload(&self, include_raw: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if !include_raw {
            if let Value::Object(map) = &mut value {
                map.remove("raw");
            }
        }
        value
    }

    /// Flat legacy payload used by `?flat=1` and the MQTT topic.
    pub fn to_flat_payload(&self, include_raw: bool, epoch_now: u64) -> Value {
        let mut value = self.to_payload(include_raw);
        if let Value::Object(map) = &mut value {
            // all_mode goes out numeric; integers 1..8 would pass through,
            // but the decoded model only carries the boolean.
            let all_mode = map
                .get("all_mode")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            map.insert("all_mode".to_string(), Value::from(all_mode as u8));
            map.insert("time".to_string(), Value::from(epoch_now));
            if let Some(Value::Array(zones)) = map.get_mut("zones") {
                for zone in zones {
                    if let Value::Object(zone_map) = zone {
                        if let Some(damper) = zone_map.get("damper_position").cloned() {
                            zone_map.insert(
                                "damper_position".to_string(),
                                Value::String(damper.to_string()),
                            );
                        }
                    }
                }
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SystemStatus {
        let mut status = SystemStatus::empty();
        status.system_mode = SystemMode::EHeat;
        status.fan_mode = FanMode::On;
        status.all_mode = true;
        status.raw = Some("AAECAw==".to_string());
        status.zones = vec![ZoneStatus {
            zone_id: 1,
            temperature: 72,
            damper_position: 100,
            cool_setpoint: 74,
            heat_setpoint: 68,
            temporary: false,
            hold: true,
            out: false,
        }];
        status
    }

    #[test]
    fn modes_serialize_as_title_case() {
        assert_eq!(
            serde_json::to_value(SystemMode::EHeat).unwrap(),
            Value::String("EHeat".to_string())
        );
        assert_eq!(
            serde_json::to_value(FanMode::Auto).unwrap(),
            Value::String("Auto".to_string())
        );
    }

    #[test]
    fn payload_withholds_raw_by_default() {
        let status = sample();
        let payload = status.to_payload(false);
        assert!(payload.get("raw").is_none());
        let payload = status.to_payload(true);
        assert_eq!(payload["raw"], Value::String("AAECAw==".to_string()));
    }

    #[test]
    fn flat_payload_applies_legacy_shape() {
        let status = sample();
        let flat = status.to_flat_payload(false, 1_700_000_000);
        assert_eq!(flat["all_mode"], Value::from(1));
        assert_eq!(flat["time"], Value::from(1_700_000_000u64));
        assert_eq!(
            flat["zones"][0]["damper_position"],
            Value::String("100".to_string())
        );
        // Structured fields keep their shape.
        assert_eq!(flat["system_mode"], Value::String("EHeat".to_string()));
        assert_eq!(flat["fan_mode"], Value::String("On".to_string()));
    }

    #[test]
    fn empty_status_is_safe() {
        let status = SystemStatus::empty();
        assert_eq!(status.active_state, "Idle");
        assert!(status.zones.is_empty());
        assert!(status.raw.is_none());
    }
}
