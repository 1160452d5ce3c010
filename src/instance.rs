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

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::metadata::ModuleMetadata;
use crate::module::DspKernel;

/// 実行時インスタンス - インスタンス化されたモジュール1個分の所有者
///
/// カーネル（リニアメモリと束縛済み関数群）とメタデータを束ね、
/// アドレスパスによるコントロールアクセスとブロック単位のcomputeを
/// 提供する。チャンネル数はインスタンス化時に確定し変化しない。
pub struct RuntimeInstance {
    id: Uuid,
    kernel: Box<dyn DspKernel>,
    metadata: Arc<ModuleMetadata>,
    sample_rate: f32,
}

impl RuntimeInstance {
    pub(crate) fn new(
        kernel: Box<dyn DspKernel>,
        metadata: Arc<ModuleMetadata>,
        sample_rate: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kernel,
            metadata,
            sample_rate,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metadata(&self) -> &Arc<ModuleMetadata> {
        &self.metadata
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn num_inputs(&self) -> usize {
        self.metadata.num_inputs()
    }

    pub fn num_outputs(&self) -> usize {
        self.metadata.num_outputs()
    }

    /// 内部DSP状態をリセットし、全コントロールを初期値に戻す
    pub fn init(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.kernel.init(sample_rate);
        for control in self.metadata.controls() {
            self.kernel.set_control(control.slot, control.init);
        }
    }

    /// ちょうど`frames`フレーム分処理を進める
    ///
    /// 連続する呼び出しの間でフレームの欠落も重複も起きない。
    pub fn compute(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> EngineResult<()> {
        if inputs.len() != self.num_inputs() || outputs.len() != self.num_outputs() {
            return Err(EngineError::internal(&format!(
                "channel mismatch: got {}/{}, instance has {}/{}",
                inputs.len(),
                outputs.len(),
                self.num_inputs(),
                self.num_outputs()
            )));
        }
        if inputs.iter().any(|c| c.len() < frames) || outputs.iter().any(|c| c.len() < frames) {
            return Err(EngineError::internal("buffer shorter than block length"));
        }

        self.kernel
            .compute(frames, inputs, outputs)
            .map_err(|e| EngineError::runtime_fault(Some(self.id), e.to_string()))
    }

    /// アドレスパス（またはラベル）でコントロールを読む
    pub fn get_param(&self, name: &str) -> EngineResult<f64> {
        let slot = self.metadata.resolve(name).ok_or_else(|| {
            EngineError::parameter(name, "no such control address")
        })?;
        Ok(self.kernel.get_control(slot))
    }

    /// アドレスパス（またはラベル）でコントロールを書く
    ///
    /// 範囲外の値はメタデータの記述子に従って拒否される。
    pub fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        let slot = self.metadata.resolve(name).ok_or_else(|| {
            EngineError::parameter(name, "no such control address")
        })?;
        let control = self
            .metadata
            .control_at(slot)
            .ok_or_else(|| EngineError::parameter(name, "control descriptor missing"))?;
        let validated = control
            .validate_value(value)
            .map_err(|e| EngineError::parameter(name, e.to_string()))?;
        self.kernel.set_control(slot, validated);
        Ok(())
    }

    /// スロット直接アクセス（検証なし、ボイスプール等の内部経路用）
    pub(crate) fn set_slot(&mut self, slot: u32, value: f64) {
        self.kernel.set_control(slot, value);
    }

    pub(crate) fn get_slot(&self, slot: u32) -> f64 {
        self.kernel.get_control(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiate::ModuleInstantiator;
    use crate::module::sdk;

    fn sine_instance() -> RuntimeInstance {
        let module = sdk::sine_voice_module().unwrap();
        ModuleInstantiator::new(44100.0).instantiate(&module).unwrap()
    }

    #[test]
    fn test_channel_counts_match_metadata() {
        let instance = sine_instance();
        assert_eq!(instance.num_inputs(), 0);
        assert_eq!(instance.num_outputs(), 1);
    }

    #[test]
    fn test_param_access_by_path_and_label() {
        let mut instance = sine_instance();

        assert_eq!(instance.get_param("/sine_voice/freq").unwrap(), 440.0);
        instance.set_param("/sine_voice/freq", 880.0).unwrap();
        assert_eq!(instance.get_param("freq").unwrap(), 880.0);

        assert!(instance.set_param("/sine_voice/freq", -3.0).is_err());
        assert!(instance.get_param("/no/such/address").is_err());
    }

    #[test]
    fn test_compute_channel_mismatch() {
        let mut instance = sine_instance();
        let inputs = vec![vec![0.0f32; 64]];
        let mut outputs = vec![vec![0.0f32; 64]];

        // 0入力のモジュールに1チャンネル渡すとエラー
        let result = instance.compute(64, &inputs, &mut outputs);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_continuity() {
        // ブロック長Lをk回 == 長さk·Lを1回、出力ストリームは一致する
        let mut split = sine_instance();
        let mut joint = sine_instance();
        split.set_param("/sine_voice/gate", 1.0).unwrap();
        joint.set_param("/sine_voice/gate", 1.0).unwrap();

        let mut split_out = vec![vec![0.0f32; 128]];
        let mut stream = Vec::new();
        for _ in 0..4 {
            split.compute(128, &[], &mut split_out).unwrap();
            stream.extend_from_slice(&split_out[0]);
        }

        let mut joint_out = vec![vec![0.0f32; 512]];
        joint.compute(512, &[], &mut joint_out).unwrap();

        assert_eq!(stream, joint_out[0]);
    }

    #[test]
    fn test_init_resets_state_and_controls() {
        let mut instance = sine_instance();
        instance.set_param("/sine_voice/freq", 880.0).unwrap();
        instance.set_param("/sine_voice/gate", 1.0).unwrap();

        let mut out = vec![vec![0.0f32; 64]];
        instance.compute(64, &[], &mut out).unwrap();

        instance.init(44100.0);
        assert_eq!(instance.get_param("/sine_voice/freq").unwrap(), 440.0);

        // リセット後は再びゲートまで無音
        instance.compute(64, &[], &mut out).unwrap();
        assert!(out[0].iter().all(|s| *s == 0.0));
    }
}
