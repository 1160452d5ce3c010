/*
 * PerigeeDSP - Compiled DSP Module Host
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Module Metadata - Parsing and validation of the compiled-module JSON document
//!
//! Every compiled module ships a UTF-8 JSON document describing its channel
//! counts, compile options and UI descriptor tree. The host derives the
//! numeric control slots from the tree once, by depth-first flattening, and
//! they stay stable for the lifetime of every instance built from the module.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// チャンネル数の上限（これを超えるドキュメントは不正とみなす）
pub const MAX_CHANNELS: usize = 64;

/// メタデータエラー型
#[derive(Debug, Clone)]
pub enum MetadataError {
    /// JSONの解析に失敗
    Parse { reason: String },
    /// 必須フィールドが欠落
    MissingField { field: String },
    /// フィールド値が不正
    Invalid { reason: String },
    /// コントロールアドレスの重複
    DuplicateAddress { address: String },
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Parse { reason } => {
                write!(f, "Failed to parse metadata JSON: {}", reason)
            }
            MetadataError::MissingField { field } => {
                write!(f, "Missing required metadata field: {}", field)
            }
            MetadataError::Invalid { reason } => {
                write!(f, "Invalid metadata: {}", reason)
            }
            MetadataError::DuplicateAddress { address } => {
                write!(f, "Duplicate control address: {}", address)
            }
        }
    }
}

impl std::error::Error for MetadataError {}

/// サンプル格納幅 - compileOptionsの精度フラグで選択される
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplePrecision {
    /// 4バイト (f32)
    Single,
    /// 8バイト (f64)
    Double,
}

impl SamplePrecision {
    /// 1サンプルあたりのバイト数
    pub fn width(&self) -> usize {
        match self {
            SamplePrecision::Single => 4,
            SamplePrecision::Double => 8,
        }
    }
}

/// コントロールの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Slider,
    NumEntry,
    Button,
    Checkbox,
}

/// MIDIバインディング（コントロール単位、メタデータの`midi`キーから）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiBinding {
    /// コントロールチェンジ番号
    Ctrl(u8),
}

/// UIディスクリプターツリーの生の1ノード
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUiItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub init: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub midi: Option<String>,
    #[serde(default)]
    pub items: Vec<RawUiItem>,
}

/// 解決済みコントロール記述子 - スロット番号はツリーの深さ優先順で確定
#[derive(Debug, Clone)]
pub struct ControlDescriptor {
    pub kind: ControlKind,
    pub label: String,
    pub address: String,
    pub slot: u32,
    pub init: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub midi: Option<MidiBinding>,
}

impl ControlDescriptor {
    /// 値の検証 - 範囲外は拒否する
    pub fn validate_value(&self, value: f64) -> Result<f64, MetadataError> {
        let clamped = value.clamp(self.min, self.max);
        if clamped != value {
            Err(MetadataError::Invalid {
                reason: format!(
                    "value {} for '{}' out of range [{}, {}]",
                    value, self.address, self.min, self.max
                ),
            })
        } else {
            Ok(clamped)
        }
    }

    /// MIDI CC値 (0-127) をコントロールのレンジに写像
    pub fn scale_midi(&self, value: f32) -> f64 {
        let normalized = (value as f64 / 127.0).clamp(0.0, 1.0);
        self.min + normalized * (self.max - self.min)
    }
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    name: Option<String>,
    #[serde(rename = "numInputs")]
    num_inputs: Option<usize>,
    #[serde(rename = "numOutputs")]
    num_outputs: Option<usize>,
    #[serde(rename = "compileOptions")]
    compile_options: Option<String>,
    #[serde(default)]
    ui: Vec<RawUiItem>,
}

/// コンパイル済みモジュールのメタデータドキュメント
///
/// 外部コンパイラーが生成した読み取り専用のドキュメント。パース時に
/// コントロールスロットを確定し、以降は不変。
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    name: String,
    num_inputs: usize,
    num_outputs: usize,
    compile_options: String,
    precision: SamplePrecision,
    controls: Vec<ControlDescriptor>,
    address_to_slot: HashMap<String, u32>,
    label_to_slot: HashMap<String, u32>,
    raw: String,
}

impl ModuleMetadata {
    /// JSONドキュメントを解析して検証する
    pub fn parse(json: &str) -> Result<Self, MetadataError> {
        let raw_meta: RawMetadata = serde_json::from_str(json).map_err(|e| {
            MetadataError::Parse {
                reason: e.to_string(),
            }
        })?;

        let name = raw_meta.name.ok_or_else(|| MetadataError::MissingField {
            field: "name".to_string(),
        })?;
        let num_inputs = raw_meta.num_inputs.ok_or_else(|| MetadataError::MissingField {
            field: "numInputs".to_string(),
        })?;
        let num_outputs = raw_meta.num_outputs.ok_or_else(|| MetadataError::MissingField {
            field: "numOutputs".to_string(),
        })?;
        let compile_options = raw_meta.compile_options.ok_or_else(|| {
            MetadataError::MissingField {
                field: "compileOptions".to_string(),
            }
        })?;

        if name.is_empty() {
            return Err(MetadataError::Invalid {
                reason: "module name cannot be empty".to_string(),
            });
        }
        if num_inputs > MAX_CHANNELS || num_outputs > MAX_CHANNELS {
            return Err(MetadataError::Invalid {
                reason: format!(
                    "channel counts {}/{} exceed limit of {}",
                    num_inputs, num_outputs, MAX_CHANNELS
                ),
            });
        }

        let precision = if compile_options.contains("-double") {
            SamplePrecision::Double
        } else {
            SamplePrecision::Single
        };

        let mut controls = Vec::new();
        for item in &raw_meta.ui {
            Self::flatten_item(item, &mut controls)?;
        }

        let mut address_to_slot = HashMap::new();
        let mut label_to_slot = HashMap::new();
        for control in &controls {
            if address_to_slot
                .insert(control.address.clone(), control.slot)
                .is_some()
            {
                return Err(MetadataError::DuplicateAddress {
                    address: control.address.clone(),
                });
            }
            // ラベルは重複し得る - 最初のものを優先
            label_to_slot
                .entry(control.label.clone())
                .or_insert(control.slot);
        }

        Ok(Self {
            name,
            num_inputs,
            num_outputs,
            compile_options,
            precision,
            controls,
            address_to_slot,
            label_to_slot,
            raw: json.to_string(),
        })
    }

    /// ツリーを深さ優先で平坦化してスロットを採番
    fn flatten_item(
        item: &RawUiItem,
        controls: &mut Vec<ControlDescriptor>,
    ) -> Result<(), MetadataError> {
        if item.item_type == "group" {
            for child in &item.items {
                Self::flatten_item(child, controls)?;
            }
            return Ok(());
        }

        let kind = match item.item_type.as_str() {
            "slider" | "hslider" | "vslider" => ControlKind::Slider,
            "numentry" | "nentry" => ControlKind::NumEntry,
            "button" => ControlKind::Button,
            "checkbox" => ControlKind::Checkbox,
            other => {
                return Err(MetadataError::Invalid {
                    reason: format!("unknown UI descriptor type '{}'", other),
                })
            }
        };

        let address = item.address.clone().ok_or_else(|| MetadataError::MissingField {
            field: format!("address (control '{}')", item.label),
        })?;

        let (init, min, max, step) = match kind {
            ControlKind::Button | ControlKind::Checkbox => (0.0, 0.0, 1.0, 1.0),
            _ => {
                let min = item.min.unwrap_or(0.0);
                let max = item.max.unwrap_or(1.0);
                let init = item.init.unwrap_or(min);
                let step = item.step.unwrap_or(0.0);
                if min > max {
                    return Err(MetadataError::Invalid {
                        reason: format!("control '{}': min {} > max {}", address, min, max),
                    });
                }
                if init < min || init > max {
                    return Err(MetadataError::Invalid {
                        reason: format!(
                            "control '{}': init {} outside [{}, {}]",
                            address, init, min, max
                        ),
                    });
                }
                (init, min, max, step)
            }
        };

        let midi = item.midi.as_deref().and_then(Self::parse_midi_binding);

        controls.push(ControlDescriptor {
            kind,
            label: item.label.clone(),
            address,
            slot: controls.len() as u32,
            init,
            min,
            max,
            step,
            midi,
        });

        Ok(())
    }

    /// `"ctrl 7"` 形式のバインディングを解析（未知の形式は無視）
    fn parse_midi_binding(spec: &str) -> Option<MidiBinding> {
        let mut parts = spec.split_whitespace();
        match parts.next()? {
            "ctrl" => parts.next()?.parse::<u8>().ok().map(MidiBinding::Ctrl),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn compile_options(&self) -> &str {
        &self.compile_options
    }

    pub fn precision(&self) -> SamplePrecision {
        self.precision
    }

    pub fn controls(&self) -> &[ControlDescriptor] {
        &self.controls
    }

    /// 元のJSONドキュメント（UIレンダラーなどの外部コラボレーター用）
    pub fn raw_json(&self) -> &str {
        &self.raw
    }

    /// アドレスパス（完全一致）またはラベルでスロットを解決
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.address_to_slot
            .get(name)
            .or_else(|| self.label_to_slot.get(name))
            .copied()
    }

    pub fn control_at(&self, slot: u32) -> Option<&ControlDescriptor> {
        self.controls.get(slot as usize)
    }

    /// アドレスの末尾セグメントで検索（ポリ音源のfreq/gate/gain解決用）
    pub fn resolve_by_suffix(&self, suffix: &str) -> Option<u32> {
        self.controls
            .iter()
            .find(|c| {
                c.address
                    .rsplit('/')
                    .next()
                    .map(|last| last == suffix)
                    .unwrap_or(false)
            })
            .map(|c| c.slot)
    }

    /// MIDI CC番号にバインドされた全コントロールのスロット
    pub fn controls_for_cc(&self, cc: u8) -> Vec<u32> {
        self.controls
            .iter()
            .filter(|c| matches!(c.midi, Some(MidiBinding::Ctrl(n)) if n == cc))
            .map(|c| c.slot)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "name": "osc",
            "numInputs": 0,
            "numOutputs": 1,
            "compileOptions": "-vec -lv 0",
            "ui": [{
                "type": "group",
                "label": "osc",
                "items": [
                    {"type": "slider", "label": "freq", "address": "/osc/freq",
                     "init": 440.0, "min": 20.0, "max": 20000.0, "step": 1.0,
                     "midi": "ctrl 16"},
                    {"type": "slider", "label": "gain", "address": "/osc/gain",
                     "init": 0.5, "min": 0.0, "max": 1.0, "step": 0.01},
                    {"type": "button", "label": "gate", "address": "/osc/gate"}
                ]
            }]
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_and_slot_order() {
        let meta = ModuleMetadata::parse(&sample_json()).unwrap();
        assert_eq!(meta.name(), "osc");
        assert_eq!(meta.num_inputs(), 0);
        assert_eq!(meta.num_outputs(), 1);
        assert_eq!(meta.precision(), SamplePrecision::Single);

        // 深さ優先順のスロット採番
        assert_eq!(meta.resolve("/osc/freq"), Some(0));
        assert_eq!(meta.resolve("/osc/gain"), Some(1));
        assert_eq!(meta.resolve("/osc/gate"), Some(2));

        // ラベルでのフォールバック解決
        assert_eq!(meta.resolve("gain"), Some(1));
        assert_eq!(meta.resolve("nonexistent"), None);
    }

    #[test]
    fn test_precision_flag() {
        let json = sample_json().replace("-vec -lv 0", "-double -vec");
        let meta = ModuleMetadata::parse(&json).unwrap();
        assert_eq!(meta.precision(), SamplePrecision::Double);
        assert_eq!(meta.precision().width(), 8);
    }

    #[test]
    fn test_missing_required_field() {
        let json = r#"{"name": "x", "numInputs": 1, "compileOptions": ""}"#;
        match ModuleMetadata::parse(json) {
            Err(MetadataError::MissingField { field }) => assert_eq!(field, "numOutputs"),
            other => panic!("Expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_init_range() {
        let json = sample_json().replace("\"init\": 440.0", "\"init\": 5.0");
        assert!(matches!(
            ModuleMetadata::parse(&json),
            Err(MetadataError::Invalid { .. })
        ));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let json = sample_json().replace("/osc/gain", "/osc/freq");
        assert!(matches!(
            ModuleMetadata::parse(&json),
            Err(MetadataError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_suffix_resolution() {
        let meta = ModuleMetadata::parse(&sample_json()).unwrap();
        assert_eq!(meta.resolve_by_suffix("gate"), Some(2));
        assert_eq!(meta.resolve_by_suffix("freq"), Some(0));
    }

    #[test]
    fn test_midi_binding_and_scaling() {
        let meta = ModuleMetadata::parse(&sample_json()).unwrap();
        assert_eq!(meta.controls_for_cc(16), vec![0]);
        assert!(meta.controls_for_cc(7).is_empty());

        let control = meta.control_at(1).unwrap();
        assert_eq!(control.scale_midi(0.0), 0.0);
        assert_eq!(control.scale_midi(127.0), 1.0);
    }

    #[test]
    fn test_validate_value() {
        let meta = ModuleMetadata::parse(&sample_json()).unwrap();
        let control = meta.control_at(1).unwrap();
        assert!(control.validate_value(0.7).is_ok());
        assert!(control.validate_value(1.5).is_err());
    }
}
