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

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// ボイスプールのポリシー設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoicePoolConfig {
    /// リリース完了とみなすまでの連続無音ブロック数
    pub release_silence_blocks: u32,
    /// 無音判定のピークレベルしきい値
    pub silence_threshold: f32,
}

impl Default for VoicePoolConfig {
    fn default() -> Self {
        Self {
            release_silence_blocks: 6,
            silence_threshold: 1e-4,
        }
    }
}

/// エンジン設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// サンプリングレート (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f32,
    /// ワークレットコンテキストのクォンタム長（フレーム）
    #[serde(default = "default_quantum")]
    pub quantum: usize,
    /// コンテキスト出力バスのチャンネル数
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    /// ブロック同期経路が受け付ける最大ブロック長（フレーム）
    #[serde(default = "default_block_capacity")]
    pub block_capacity: usize,
    /// ボイスプールのポリシー
    #[serde(default)]
    pub voices: VoicePoolConfig,
}

fn default_sample_rate() -> f32 {
    44100.0
}

fn default_quantum() -> usize {
    512
}

fn default_output_channels() -> usize {
    2
}

fn default_block_capacity() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            quantum: default_quantum(),
            output_channels: default_output_channels(),
            block_capacity: default_block_capacity(),
            voices: VoicePoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// TOMLファイルから設定をロードする
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::FileIo {
            operation: "read config".to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| EngineError::ConfigParsing {
            file: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// 設定をTOMLファイルへ書き出す
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| EngineError::ConfigParsing {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;

        std::fs::write(path, content).map_err(|e| EngineError::FileIo {
            operation: "write config".to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 44100.0);
        assert_eq!(config.quantum, 512);
        assert_eq!(config.voices.release_silence_blocks, 6);
    }

    #[test]
    fn test_toml_round_trip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.toml");

        let mut config = EngineConfig::default();
        config.sample_rate = 96000.0;
        config.voices.release_silence_blocks = 12;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.sample_rate, 96000.0);
        assert_eq!(loaded.voices.release_silence_blocks, 12);
        assert_eq!(loaded.quantum, 512);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "sample_rate = 48000.0\n").unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.sample_rate, 48000.0);
        assert_eq!(loaded.output_channels, 2);
    }

    #[test]
    fn test_invalid_toml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "sample_rate = \"fast\"\n").unwrap();

        assert!(matches!(
            EngineConfig::load_from_file(&path),
            Err(EngineError::ConfigParsing { .. })
        ));
    }
}
