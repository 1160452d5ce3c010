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

//! Module SDK - First-party modules implemented directly in Rust
//!
//! Not every module has to come out of the external compiler: the SDK builds
//! a `CompiledModule` around plain Rust kernels, behind the same factory
//! seam the shared-library path uses. The reference kernels below double as
//! the material the test suite instantiates.

use std::sync::Arc;

use crate::module::api::{DspKernel, KernelFactory, MixVoice, MixerKernel};
use crate::module::{CompiledModule, ModuleError, ModuleResult};

/// DSPカーネルのコンストラクタ
pub type KernelCtor = dyn Fn() -> Box<dyn DspKernel> + Send + Sync;

/// ミキサーカーネルのコンストラクタ
pub type MixerCtor = dyn Fn() -> Box<dyn MixerKernel> + Send + Sync;

/// ネイティブモジュールのカーネルファクトリー
pub struct NativeFactory {
    name: String,
    kernel_ctor: Option<Box<KernelCtor>>,
    mixer_ctor: Option<Box<MixerCtor>>,
}

impl NativeFactory {
    /// DSPカーネルを生成するファクトリーを作る
    pub fn with_kernel(
        name: &str,
        ctor: impl Fn() -> Box<dyn DspKernel> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            kernel_ctor: Some(Box::new(ctor)),
            mixer_ctor: None,
        }
    }

    /// ミキサーカーネルを生成するファクトリーを作る
    pub fn with_mixer(
        name: &str,
        ctor: impl Fn() -> Box<dyn MixerKernel> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            kernel_ctor: None,
            mixer_ctor: Some(Box::new(ctor)),
        }
    }
}

impl KernelFactory for NativeFactory {
    fn create_kernel(&self) -> ModuleResult<Box<dyn DspKernel>> {
        match &self.kernel_ctor {
            Some(ctor) => Ok(ctor()),
            None => Err(ModuleError::ValidationFailed {
                module: self.name.clone(),
                reason: "native module does not provide a DSP kernel".to_string(),
            }),
        }
    }

    fn create_mixer(&self) -> ModuleResult<Box<dyn MixerKernel>> {
        match &self.mixer_ctor {
            Some(ctor) => Ok(ctor()),
            None => Err(ModuleError::NotAMixer {
                module: self.name.clone(),
            }),
        }
    }
}

/// リリース時の1フレームあたりの減衰係数
const RELEASE_DECAY: f64 = 0.95;

/// 基本正弦波ボイスカーネル
///
/// コントロール: 0=freq, 1=gain, 2=gate。gateが落ちるとエンベロープが
/// フレームごとに減衰して無音へ向かう。状態はフレーム単位で進むので、
/// ブロックの切り方によらず出力ストリームは一致する。
pub struct SineKernel {
    controls: [f64; 3],
    phase: f64,
    envelope: f64,
    sample_rate: f64,
}

impl SineKernel {
    pub fn new() -> Self {
        Self {
            controls: [440.0, 0.5, 0.0],
            phase: 0.0,
            envelope: 0.0,
            sample_rate: 44100.0,
        }
    }
}

impl Default for SineKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl DspKernel for SineKernel {
    fn init(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate as f64;
        self.phase = 0.0;
        self.envelope = 0.0;
    }

    fn compute(
        &mut self,
        frames: usize,
        _inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> ModuleResult<()> {
        let freq = self.controls[0];
        let gain = self.controls[1];
        let gate = self.controls[2];
        let step = std::f64::consts::TAU * freq / self.sample_rate;

        for i in 0..frames {
            if gate > 0.5 {
                self.envelope = 1.0;
            } else {
                self.envelope *= RELEASE_DECAY;
            }

            let sample = (self.phase.sin() * gain * self.envelope) as f32;
            for channel in outputs.iter_mut() {
                channel[i] = sample;
            }

            self.phase += step;
            if self.phase >= std::f64::consts::TAU {
                self.phase -= std::f64::consts::TAU;
            }
        }

        Ok(())
    }

    fn get_control(&self, slot: u32) -> f64 {
        self.controls.get(slot as usize).copied().unwrap_or(0.0)
    }

    fn set_control(&mut self, slot: u32, value: f64) {
        if let Some(control) = self.controls.get_mut(slot as usize) {
            *control = value;
        }
    }
}

/// Nチャンネルのゲイン付きパススルーカーネル
///
/// コントロール: 0=level
pub struct GainKernel {
    level: f64,
}

impl GainKernel {
    pub fn new() -> Self {
        Self { level: 1.0 }
    }
}

impl Default for GainKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl DspKernel for GainKernel {
    fn init(&mut self, _sample_rate: f32) {}

    fn compute(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> ModuleResult<()> {
        let level = self.level as f32;
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            for i in 0..frames {
                output[i] = input[i] * level;
            }
        }
        Ok(())
    }

    fn get_control(&self, slot: u32) -> f64 {
        if slot == 0 {
            self.level
        } else {
            0.0
        }
    }

    fn set_control(&mut self, slot: u32, value: f64) {
        if slot == 0 {
            self.level = value;
        }
    }
}

/// フェードインランプの長さ（フレーム）
const FADE_FRAMES: u64 = 64;

/// 加算ミキサーカーネル
///
/// 取得タイムスタンプからの経過フレームで重み付けした短いフェードインを
/// 掛けつつ全ボイスを加算し、ボイスごとのピークレベルを報告する。
pub struct FadeMixer;

impl FadeMixer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FadeMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl MixerKernel for FadeMixer {
    fn init(&mut self, _sample_rate: f32) {}

    fn mix(
        &mut self,
        frames: usize,
        voices: &[MixVoice<'_>],
        output: &mut [Vec<f32>],
        levels: &mut [f32],
    ) -> ModuleResult<()> {
        for (v, voice) in voices.iter().enumerate() {
            let mut peak = 0.0f32;

            for (buffer, out_channel) in voice.buffers.iter().zip(output.iter_mut()) {
                for i in 0..frames {
                    let age = voice.age_frames + i as u64;
                    let weight = if age >= FADE_FRAMES {
                        1.0
                    } else {
                        age as f32 / FADE_FRAMES as f32
                    };
                    let sample = buffer[i] * weight;
                    out_channel[i] += sample;
                    peak = peak.max(sample.abs());
                }
            }

            levels[v] = peak;
        }

        Ok(())
    }
}

/// 正弦波ボイスモジュール（freq/gain/gateコントロール付き、0入力1出力）
pub fn sine_voice_module() -> ModuleResult<CompiledModule> {
    let json = r#"{
        "name": "sine_voice",
        "numInputs": 0,
        "numOutputs": 1,
        "compileOptions": "",
        "ui": [{
            "type": "group",
            "label": "sine_voice",
            "items": [
                {"type": "slider", "label": "freq", "address": "/sine_voice/freq",
                 "init": 440.0, "min": 20.0, "max": 20000.0, "step": 0.01},
                {"type": "slider", "label": "gain", "address": "/sine_voice/gain",
                 "init": 0.5, "min": 0.0, "max": 1.0, "step": 0.001,
                 "midi": "ctrl 7"},
                {"type": "button", "label": "gate", "address": "/sine_voice/gate"}
            ]
        }]
    }"#;

    let factory = Arc::new(NativeFactory::with_kernel("sine_voice", || {
        Box::new(SineKernel::new())
    }));
    CompiledModule::new(factory, json, b"native:sine_voice")
}

/// Nチャンネルゲインモジュール（levelコントロール付き）
pub fn gain_module(channels: usize) -> ModuleResult<CompiledModule> {
    let json = format!(
        r#"{{
            "name": "gain",
            "numInputs": {channels},
            "numOutputs": {channels},
            "compileOptions": "",
            "ui": [{{
                "type": "group",
                "label": "gain",
                "items": [
                    {{"type": "slider", "label": "level", "address": "/gain/level",
                     "init": 1.0, "min": 0.0, "max": 2.0, "step": 0.001,
                     "midi": "ctrl 7"}}
                ]
            }}]
        }}"#
    );

    let factory = Arc::new(NativeFactory::with_kernel("gain", || {
        Box::new(GainKernel::new())
    }));
    CompiledModule::new(factory, &json, b"native:gain")
}

/// フェードイン付き加算ミキサーモジュール
pub fn fade_mixer_module() -> ModuleResult<CompiledModule> {
    let json = r#"{
        "name": "fade_mixer",
        "numInputs": 1,
        "numOutputs": 1,
        "compileOptions": "",
        "ui": []
    }"#;

    let factory = Arc::new(NativeFactory::with_mixer("fade_mixer", || {
        Box::new(FadeMixer::new())
    }));
    CompiledModule::new(factory, json, b"native:fade_mixer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_kernel_silent_until_gated() {
        let mut kernel = SineKernel::new();
        kernel.init(44100.0);

        let mut outputs = vec![vec![0.0f32; 64]];
        kernel.compute(64, &[], &mut outputs).unwrap();
        assert!(outputs[0].iter().all(|s| *s == 0.0));

        kernel.set_control(2, 1.0);
        kernel.compute(64, &[], &mut outputs).unwrap();
        assert!(outputs[0].iter().any(|s| s.abs() > 0.0));
        assert!(outputs[0].iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_sine_kernel_release_decays_to_silence() {
        let mut kernel = SineKernel::new();
        kernel.init(44100.0);
        kernel.set_control(2, 1.0);

        let mut outputs = vec![vec![0.0f32; 128]];
        kernel.compute(128, &[], &mut outputs).unwrap();

        kernel.set_control(2, 0.0);
        for _ in 0..4 {
            kernel.compute(128, &[], &mut outputs).unwrap();
        }
        assert!(outputs[0].iter().all(|s| s.abs() < 1e-4));
    }

    #[test]
    fn test_gain_kernel_passthrough() {
        let mut kernel = GainKernel::new();
        kernel.init(44100.0);
        kernel.set_control(0, 0.5);

        let inputs = vec![vec![1.0f32; 16]];
        let mut outputs = vec![vec![0.0f32; 16]];
        kernel.compute(16, &inputs, &mut outputs).unwrap();
        assert!(outputs[0].iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_fade_mixer_ramp_and_levels() {
        let mut mixer = FadeMixer::new();
        mixer.init(44100.0);

        let buffers = vec![vec![1.0f32; 128]];
        let voices = vec![MixVoice {
            buffers: &buffers,
            age_frames: 0,
        }];
        let mut output = vec![vec![0.0f32; 128]];
        let mut levels = [0.0f32; 1];

        mixer.mix(128, &voices, &mut output, &mut levels).unwrap();

        // フレーム0は無音から始まり、フェード後は全レベル
        assert_eq!(output[0][0], 0.0);
        assert_eq!(output[0][127], 1.0);
        assert_eq!(levels[0], 1.0);
    }

    #[test]
    fn test_fade_mixer_aged_voice_is_unattenuated() {
        let mut mixer = FadeMixer::new();
        let buffers = vec![vec![0.25f32; 32]];
        let voices = vec![MixVoice {
            buffers: &buffers,
            age_frames: 10_000,
        }];
        let mut output = vec![vec![0.0f32; 32]];
        let mut levels = [0.0f32; 1];

        mixer.mix(32, &voices, &mut output, &mut levels).unwrap();
        assert!(output[0].iter().all(|s| (*s - 0.25).abs() < 1e-6));
        assert!((levels[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_native_factory_kind_mismatch() {
        let module = sine_voice_module().unwrap();
        assert!(matches!(
            module.factory().create_mixer(),
            Err(ModuleError::NotAMixer { .. })
        ));

        let mixer = fade_mixer_module().unwrap();
        assert!(matches!(
            mixer.factory().create_kernel(),
            Err(ModuleError::ValidationFailed { .. })
        ));
    }
}
