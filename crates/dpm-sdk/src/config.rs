//! JSON configuration import and export.
//!
//! The on-disk format is an array of module-config objects in crate-index
//! order. Each object carries three sections: `metadata` (hardware revision
//! and slot), `module.input` (name → value or value-array), and
//! `channel.input` (name → per-channel value array). Import is tolerant:
//! missing objects are padded from a built-in default template, size
//! mismatches and unknown names are skipped with warnings, and `SlotID` /
//! `ModNum` are always overridden from the module's own identity. Parse
//! failures are fatal.

use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::error::{Error, Result};
use crate::module::{Module, NumberSlot, SyncDirection};
use crate::param::{self, channel_var_descriptors, module_var_descriptors, ModuleVar, Value};

/// The default template applied to modules the config file does not cover.
/// Values that must be unique per module (SlotID, ModNum) are overridden at
/// import time.
pub fn default_config() -> Json {
    json!({
        "metadata": { "hardware_revision": "DEFAULT", "slot": 99 },
        "module": {
            "input": {
                "CoincPattern": 0,
                "CoincWait": 0,
                "ControlTask": 0,
                "CrateID": 0,
                "FastFilterRange": 0,
                "FastTrigBackplaneEna": 0,
                "HostIO": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                "HostRunTimePreset": 1_092_616_192,
                "InSynch": 1,
                "MaxEvents": 0,
                "ModCSRA": 0,
                "ModCSRB": 0,
                "ModFormat": 0,
                "ModID": 0,
                "ModNum": 0,
                "Resume": 1,
                "RunTask": 0,
                "SlotID": 5,
                "SlowFilterRange": 3,
                "SynchWait": 0,
                "TrigConfig": [0, 0, 0, 0],
                "U00": [0, 0, 0, 0, 0, 0, 0],
                "UserIn": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
            }
        },
        "channel": {
            "input": {
                "BLcut": [3],
                "BaselinePercent": [10],
                "CFDDelay": [8],
                "CFDScale": [0],
                "CFDThresh": [120],
                "ChanCSRa": [4],
                "ChanCSRb": [0],
                "ChanTrigStretch": [0],
                "DigGain": [0],
                "EnergyLow": [0],
                "ExtTrigStretch": [150],
                "ExternDelayLen": [20],
                "FastGap": [10],
                "FastLength": [20],
                "FastThresh": [1000],
                "FastTrigBackLen": [10],
                "FtrigoutDelay": [0],
                "GainDAC": [0],
                "Integrator": [0],
                "Log2Bweight": [4_294_967_294u32],
                "Log2Ebin": [4_294_967_295u32],
                "MultiplicityMaskH": [0],
                "MultiplicityMaskL": [0],
                "OffsetDAC": [34952],
                "PAFlength": [119],
                "PSAlength": [0],
                "PSAoffset": [0],
                "PeakSample": [42],
                "PreampTau": [1_112_014_848u32],
                "QDCLen0": [30],
                "QDCLen1": [63],
                "QDCLen2": [88],
                "QDCLen3": [113],
                "QDCLen4": [138],
                "QDCLen5": [163],
                "QDCLen6": [188],
                "QDCLen7": [213],
                "ResetDelay": [0],
                "SlowGap": [19],
                "SlowLength": [25],
                "ThreshWidth": [0],
                "TraceLength": [124],
                "TrigOutLen": [0],
                "TriggerDelay": [88],
                "VetoStretch": [30],
                "Xavg": [0],
                "Xwait": [8]
            }
        }
    })
}

fn as_value(json: &Json, what: &str) -> Result<Value> {
    json.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::config_json(format!("{what}: not an unsigned 32-bit value")))
}

/// Import a configuration file into the modules.
///
/// # Errors
///
/// `FileOpen` when the file cannot be read, `ConfigJson` on parse or
/// structural failures.
pub fn import_json(path: &str, modules: &[Arc<Module>]) -> Result<Vec<NumberSlot>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::FileOpen {
        path: path.into(),
        reason: e.to_string(),
    })?;
    let config: Json = serde_json::from_str(&text)
        .map_err(|e| Error::config_json(format!("parse config: {e}")))?;
    import_value(config, modules)
}

/// Import an already-parsed configuration value.
pub fn import_value(config: Json, modules: &[Arc<Module>]) -> Result<Vec<NumberSlot>> {
    let Json::Array(mut configs) = config else {
        return Err(Error::config_json("top level is not an array"));
    };

    if configs.len() > modules.len() {
        tracing::warn!(
            "too many module configs ({}), crate only has {} modules",
            configs.len(),
            modules.len()
        );
    }
    if configs.len() < modules.len() {
        tracing::warn!(
            "too few module configs ({}), crate has {} modules; using default config for missing modules",
            configs.len(),
            modules.len()
        );
        while configs.len() < modules.len() {
            configs.push(default_config());
        }
    }

    let mut loaded = Vec::new();

    for (number, module) in modules.iter().enumerate() {
        if !module.online() {
            tracing::warn!("module {number} not online, skipping");
            continue;
        }
        let settings = &configs[number];

        let metadata = settings
            .get("metadata")
            .ok_or_else(|| Error::config_json("'metadata' not found"))?;
        let moddata = settings
            .get("module")
            .ok_or_else(|| Error::config_json("'module' not found"))?;
        let chandata = settings
            .get("channel")
            .ok_or_else(|| Error::config_json("'channel' not found"))?;
        let modinput = moddata
            .get("input")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::config_json("module 'input' not found"))?;
        let chaninput = chandata
            .get("input")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::config_json("channel 'input' not found"))?;

        let revision = metadata
            .get("hardware_revision")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config_json("config rev: not a string"))?;
        if revision.chars().next() != Some(module.revision_label()) {
            tracing::warn!(
                "config module {number} (rev {revision}) loading on to {}",
                module.revision_label()
            );
        }
        if let Some(slot) = metadata.get("slot").and_then(Json::as_u64) {
            if slot as usize != module.slot() {
                tracing::warn!(
                    "config module {number} (slot {slot}) has moved to slot {}",
                    module.slot()
                );
            }
        }

        import_module_vars(module, number, modinput)?;
        import_channel_vars(module, number, revision, chaninput)?;

        loaded.push(NumberSlot::new(module.number(), module.slot()));
    }

    Ok(loaded)
}

fn import_module_vars(
    module: &Arc<Module>,
    number: usize,
    input: &serde_json::Map<String, Json>,
) -> Result<()> {
    let descs = module_var_descriptors();
    for (key, value) in input {
        let Some(var) = param::lookup_module_var(key) else {
            // Parameters may appear next to variables; only truly unknown
            // names warrant a warning.
            if !param::is_module_param(key) {
                tracing::warn!(
                    "config module {number} (slot {}): invalid variable: {key}",
                    module.slot()
                );
            }
            continue;
        };
        let desc = &descs[var as usize];
        if !desc.writable() {
            continue;
        }
        if desc.size > 1 {
            let Some(values) = value.as_array() else {
                tracing::warn!("{}: size does not match: {key}", module.label());
                continue;
            };
            if values.len() != desc.size {
                tracing::warn!("{}: size does not match: {key}", module.label());
                continue;
            }
            for (offset, v) in values.iter().enumerate() {
                module.write_module_var(var, as_value(v, key)?, offset, false)?;
            }
        } else {
            let scalar = match value {
                Json::Array(values) if values.len() == 1 => &values[0],
                Json::Array(_) => {
                    tracing::warn!("{}: size does not match: {key}", module.label());
                    continue;
                }
                other => other,
            };
            // These two always track the module's own identity.
            let value = match var {
                ModuleVar::SlotId => module.slot() as Value,
                ModuleVar::ModNum => module.number().max(0) as Value,
                _ => as_value(scalar, key)?,
            };
            module.write_module_var(var, value, 0, false)?;
        }
    }
    Ok(())
}

fn import_channel_vars(
    module: &Arc<Module>,
    number: usize,
    revision: &str,
    input: &serde_json::Map<String, Json>,
) -> Result<()> {
    let descs = channel_var_descriptors();
    let num_channels = module.num_channels();
    for (key, value) in input {
        let Some(var) = param::lookup_channel_var(key) else {
            if !param::is_channel_param(key) {
                tracing::warn!(
                    "config module {number} (slot {}): invalid variable: {key}",
                    module.slot()
                );
            }
            continue;
        };
        if !descs[var as usize].writable() {
            continue;
        }
        let Some(values) = value.as_array() else {
            tracing::warn!("{}: size does not match config: {key}", module.label());
            continue;
        };
        if values.is_empty() {
            tracing::warn!("{}: size does not match config: {key}", module.label());
            continue;
        }

        let mut values = values.clone();
        if values.len() < num_channels {
            if revision != "DEFAULT" {
                tracing::warn!(
                    "{}: {key} config has too few elements: {} for {num_channels} channels",
                    module.label(),
                    values.len()
                );
            }
            tracing::debug!(
                "{}: extending {key} to {num_channels} elements using value at index 0",
                module.label()
            );
            let first = values[0].clone();
            values.resize(num_channels, first);
        }
        // Excess entries are truncated.
        for (channel, v) in values.iter().take(num_channels).enumerate() {
            module.write_channel_var(var, as_value(v, key)?, channel, false)?;
        }
    }
    Ok(())
}

/// Export the module configurations to a file, pretty-printed.
pub fn export_json(path: &str, modules: &[Arc<Module>]) -> Result<()> {
    let config = export_value(modules)?;
    let text = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::config_json(format!("render config: {e}")))?;
    std::fs::write(path, text + "\n").map_err(|e| Error::FileOpen {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Build the export value: metadata plus every non-read-only variable,
/// refreshed from the DSP for online modules.
pub fn export_value(modules: &[Arc<Module>]) -> Result<Json> {
    let mut configs = Vec::new();

    for module in modules {
        if module.online() {
            module.sync_vars(SyncDirection::FromDsp)?;
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("number".into(), json!(module.number()));
        metadata.insert("slot".into(), json!(module.slot()));
        metadata.insert("serial-num".into(), json!(module.serial()));
        metadata.insert(
            "hardware_revision".into(),
            json!(module.revision_label().to_string()),
        );
        metadata.insert("num-channels".into(), json!(module.num_channels()));
        metadata.insert(
            "fifo".into(),
            json!({
                "buffers": module.fifo_buffers(),
                "run-wait": module.fifo_run_wait_usecs(),
                "idle-wait": module.fifo_idle_wait_usecs(),
                "hold": module.fifo_hold_usecs(),
            }),
        );
        let channel_configs: Vec<Json> = module
            .channel_configs()
            .iter()
            .map(|c| {
                json!({
                    "adc_bits": c.adc_bits,
                    "adc_msps": c.adc_msps,
                    "adc_clk_div": c.adc_clk_div,
                    "fpga_clk_mhz": c.fpga_clk_mhz,
                })
            })
            .collect();
        metadata.insert("config".into(), Json::Array(channel_configs));

        let mut modinput = serde_json::Map::new();
        for desc in module_var_descriptors() {
            if !desc.writable() {
                continue;
            }
            if desc.size == 1 {
                modinput.insert(
                    desc.name.into(),
                    json!(module.read_module_var(desc.var, 0, false)?),
                );
            } else {
                let mut values = Vec::with_capacity(desc.size);
                for offset in 0..desc.size {
                    values.push(json!(module.read_module_var(desc.var, offset, false)?));
                }
                modinput.insert(desc.name.into(), Json::Array(values));
            }
        }

        let mut chaninput = serde_json::Map::new();
        for desc in channel_var_descriptors() {
            if !desc.writable() {
                continue;
            }
            let mut values = Vec::with_capacity(module.num_channels());
            for channel in 0..module.num_channels() {
                values.push(json!(module.read_channel_var(desc.var, channel, false)?));
            }
            chaninput.insert(desc.name.into(), Json::Array(values));
        }

        configs.push(json!({
            "metadata": Json::Object(metadata),
            "module": { "input": Json::Object(modinput) },
            "channel": { "input": Json::Object(chaninput) },
        }));
    }

    Ok(Json::Array(configs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_names_are_known() {
        let template = default_config();
        let modinput = template["module"]["input"].as_object().unwrap();
        for key in modinput.keys() {
            assert!(param::is_module_var(key), "unknown module var in template: {key}");
        }
        let chaninput = template["channel"]["input"].as_object().unwrap();
        for key in chaninput.keys() {
            assert!(param::is_channel_var(key), "unknown channel var in template: {key}");
        }
    }

    #[test]
    fn default_template_sizes_match_descriptors() {
        let template = default_config();
        let modinput = template["module"]["input"].as_object().unwrap();
        let descs = module_var_descriptors();
        for (key, value) in modinput {
            let var = param::lookup_module_var(key).unwrap();
            let desc = &descs[var as usize];
            if desc.size > 1 {
                assert_eq!(value.as_array().unwrap().len(), desc.size, "{key}");
            }
        }
    }

    #[test]
    fn top_level_must_be_array() {
        let err = import_value(json!({"module": {}}), &[]).unwrap_err();
        assert!(matches!(err, Error::ConfigJson { .. }));
    }

    #[test]
    fn out_of_range_values_are_fatal() {
        assert!(as_value(&json!(4_294_967_295u32), "x").is_ok());
        assert!(as_value(&json!(4_294_967_296u64), "x").is_err());
        assert!(as_value(&json!(-1), "x").is_err());
        assert!(as_value(&json!("ten"), "x").is_err());
    }

    #[test]
    fn defaults_offset_dac_matches_original_template() {
        // 34952 is the template's OffsetDAC: slightly above mid-rail.
        let template = default_config();
        assert_eq!(template["channel"]["input"]["OffsetDAC"][0], 34952);
    }

    #[test]
    fn channel_var_with_wrong_shape_is_skipped() {
        // Non-array channel values are a warning, not an error, and with no
        // modules nothing is loaded.
        let config = json!([{
            "metadata": { "hardware_revision": "H", "slot": 2 },
            "module": { "input": {} },
            "channel": { "input": { "OffsetDAC": 1 } }
        }]);
        let loaded = import_value(config, &[]).unwrap();
        assert!(loaded.is_empty());
    }
}
