//! Decoding the raw row set into a [`SystemStatus`].
//!
//! All offsets are relative to the full reply payload, which begins with the
//! 3-byte echoed row address. Rows come back from the panel padded, but a
//! short or missing row must never panic a decode: the indexer substitutes
//! zero and logs.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

use crate::model::{FanMode, SystemMode, SystemStatus, ZoneStatus};

/// Raw rows keyed by `(table, row)`; the BTreeMap keeps them in the
/// ascending order the raw blob requires.
pub type RowCache = BTreeMap<(u8, u8), Vec<u8>>;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Safe byte access: out-of-range reads decode as zero.
fn at(row: &[u8], index: usize) -> u8 {
    match row.get(index) {
        Some(&byte) => byte,
        None => {
            warn!(index, row_len = row.len(), "row index out of range, substituting 0");
            0
        }
    }
}

fn row<'a>(rows: &'a RowCache, table: u8, row_id: u8) -> &'a [u8] {
    match rows.get(&(table, row_id)) {
        Some(data) => data,
        None => {
            warn!(table, row = row_id, "row missing from read set");
            &[]
        }
    }
}

/// Signed outside-air temperature from row 9.3.
///
/// The sensor reports a 12-bit value in sixteenths of a degree; when the
/// high/low pair is all zero the panel instead mirrors the temperature in
/// byte 7.
fn decode_outside_temp(row_9_3: &[u8]) -> i32 {
    let high = at(row_9_3, 4);
    let low = at(row_9_3, 5);
    if high == 0 && low == 0 {
        return at(row_9_3, 7) as i32;
    }
    let mut temp = (((high as i32) << 8) | low as i32) / 16;
    if high > 0x80 {
        temp -= 4096;
    }
    temp
}

fn decode_system_time(row_1_18: &[u8]) -> String {
    let day = at(row_1_18, 3);
    let hour = at(row_1_18, 4);
    let minute = at(row_1_18, 5);
    let meridiem = if hour >= 12 { "pm" } else { "am" };
    let display_hour = match hour {
        0 => 12,
        h if h > 12 => h - 12,
        h => h,
    };
    let weekday = WEEKDAYS.get(day as usize).copied().unwrap_or("Unk");
    format!("{weekday} {display_hour:02}:{minute:02}{meridiem}")
}

/// Decode the full row set into a snapshot.
pub fn decode_status(rows: &RowCache, zone_count: u8, include_raw: bool) -> SystemStatus {
    let row_9_3 = row(rows, 9, 3);
    let row_9_4 = row(rows, 9, 4);
    let row_9_5 = row(rows, 9, 5);
    let row_1_9 = row(rows, 1, 9);
    let row_1_12 = row(rows, 1, 12);
    let row_1_16 = row(rows, 1, 16);
    let row_1_17 = row(rows, 1, 17);
    let row_1_18 = row(rows, 1, 18);
    let row_1_24 = row(rows, 1, 24);

    let system_mode = SystemMode::from_raw(at(row_1_12, 4));
    let effective_mode = SystemMode::from_raw(at(row_1_12, 6));
    let fan_mode = FanMode::from_raw((at(row_1_17, 3) >> 2) & 1);

    let panel = at(row_9_5, 3);
    let compressor_stage_1 = panel & 0x01 != 0;
    let compressor_stage_2 = panel & 0x02 != 0;
    let aux_heat_stage_1 = panel & 0x04 != 0;
    let aux_heat_stage_2 = panel & 0x08 != 0;
    let reversing_valve = panel & 0x10 != 0;
    let fan_on = panel & 0x20 != 0;
    let humidify = panel & 0x40 != 0;
    let dehumidify = panel & 0x80 != 0;

    let heating = matches!(effective_mode, SystemMode::Heat | SystemMode::EHeat);
    let compressor_on = compressor_stage_1 || compressor_stage_2;
    let mut active_state = match (heating, compressor_on) {
        (true, true) => "Heat On",
        (true, false) => "Heat Off",
        (false, true) => "Cool On",
        (false, false) => "Cool Off",
    }
    .to_string();
    if aux_heat_stage_1 || aux_heat_stage_2 {
        active_state.push_str(" [AUX]");
    }

    let mut zones = Vec::with_capacity(zone_count as usize);
    for i in 0..zone_count as usize {
        let bit = 1u8 << i;
        let damper_raw = at(row_9_4, i + 3);
        let damper_position = if damper_raw > 0 {
            ((damper_raw as f64) / 15.0 * 100.0).round() as u8
        } else {
            0
        };
        zones.push(ZoneStatus {
            zone_id: (i + 1) as u8,
            temperature: at(row_1_24, i + 3) as i32,
            damper_position,
            cool_setpoint: at(row_1_16, i + 3),
            heat_setpoint: at(row_1_16, i + 11),
            temporary: at(row_1_12, 9) & bit != 0,
            hold: at(row_1_12, 10) & bit != 0,
            out: at(row_1_12, 12) & bit != 0,
        });
    }

    // One zone can drive the whole house: byte 15 of row 1.12 names the
    // source zone, and its setpoints and flags apply everywhere.
    let all_source = at(row_1_12, 15);
    if (1..=zone_count).contains(&all_source) {
        let source = zones[(all_source - 1) as usize].clone();
        for zone in zones.iter_mut() {
            if zone.zone_id == source.zone_id {
                continue;
            }
            zone.cool_setpoint = source.cool_setpoint;
            zone.heat_setpoint = source.heat_setpoint;
            zone.temporary = source.temporary;
            zone.hold = source.hold;
            zone.out = source.out;
        }
    }

    let raw = if include_raw {
        let mut blob = Vec::new();
        for data in rows.values() {
            blob.push(data.len() as u8);
            blob.extend_from_slice(data);
        }
        Some(BASE64.encode(&blob))
    } else {
        None
    };

    SystemStatus {
        system_time: decode_system_time(row_1_18),
        system_mode,
        effective_mode,
        fan_mode,
        fan_state: if fan_on { "On" } else { "Off" }.to_string(),
        active_state,
        all_mode: all_source != 0,
        outside_temp: decode_outside_temp(row_9_3),
        air_handler_temp: at(row_9_3, 6) as i32,
        zone1_humidity: at(row_1_9, 4),
        compressor_stage_1,
        compressor_stage_2,
        aux_heat_stage_1,
        aux_heat_stage_2,
        humidify,
        dehumidify,
        reversing_valve,
        raw,
        zones,
    }
}
