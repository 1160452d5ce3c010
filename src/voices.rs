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

//! Voice Pool - Polyphonic voice allocation and mixing
//!
//! Owns N runtime instances, assigns them on note events, and drives the
//! mixing module over the per-voice output buffers. All bookkeeping runs on
//! logical clocks (event counter, processed-frame counter), so a fixed
//! sequence of note events and block lengths renders bit-identically.

use std::sync::Arc;

use crate::config::VoicePoolConfig;
use crate::errors::{EngineError, EngineResult};
use crate::instance::RuntimeInstance;
use crate::instantiate::PolyParts;
use crate::metadata::ModuleMetadata;
use crate::module::{MixVoice, MixerKernel};

/// プールが保持できるボイス数の上限
pub const MAX_VOICES: usize = 64;

/// MIDIノート番号を周波数へ（A440基準）
pub fn midi_to_hz(note: u8) -> f64 {
    440.0 * 2f64.powf((note as f64 - 69.0) / 12.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// 待機中 - 割り当て可能
    #[default]
    Idle,
    /// 発音中
    Playing,
    /// リリース中 - 無音が続けばIdleへ戻る
    Releasing,
}

/// 1ボイス分の再生状態
struct Voice {
    instance: RuntimeInstance,
    buffers: Vec<Vec<f32>>,
    state: VoiceState,
    note: u8,
    gain: f32,
    /// 取得順序を決める論理イベント刻印
    date: u64,
    /// 取得時点の処理済みフレーム数（フェード年齢の基準）
    start_frame: u64,
    silent_blocks: u32,
}

/// ボイスモジュールの慣習的コントロールの解決結果
struct VoiceAddresses {
    freq: Option<u32>,
    gain: Option<u32>,
    gate: u32,
}

/// ポリフォニックボイスプール
pub struct VoicePool {
    voices: Vec<Voice>,
    mixer: Box<dyn MixerKernel>,
    effect: Option<RuntimeInstance>,
    metadata: Arc<ModuleMetadata>,
    addresses: VoiceAddresses,
    config: VoicePoolConfig,
    event_clock: u64,
    frames_processed: u64,
    bend_ratio: f64,
    mix_bus: Vec<Vec<f32>>,
    levels: Vec<f32>,
    block_capacity: usize,
}

impl VoicePool {
    /// インスタンス化済みのポリ一式からプールを組む
    pub fn new(
        parts: PolyParts,
        config: VoicePoolConfig,
        block_capacity: usize,
    ) -> EngineResult<Self> {
        let PolyParts {
            voices,
            mixer,
            effect,
            voice_metadata,
        } = parts;

        let gate = voice_metadata
            .resolve_by_suffix("gate")
            .ok_or_else(|| EngineError::instantiation(voice_metadata.name(), "no gate control"))?;
        let addresses = VoiceAddresses {
            freq: voice_metadata.resolve_by_suffix("freq"),
            gain: voice_metadata.resolve_by_suffix("gain"),
            gate,
        };

        let channels = voice_metadata.num_outputs();
        let num_voices = voices.len();
        let voices = voices
            .into_iter()
            .map(|instance| Voice {
                instance,
                buffers: vec![vec![0.0f32; block_capacity]; channels],
                state: VoiceState::Idle,
                note: 0,
                gain: 0.0,
                date: 0,
                start_frame: 0,
                silent_blocks: 0,
            })
            .collect();

        Ok(Self {
            voices,
            mixer,
            effect,
            metadata: voice_metadata,
            addresses,
            config,
            event_clock: 0,
            frames_processed: 0,
            bend_ratio: 1.0,
            mix_bus: vec![vec![0.0f32; block_capacity]; channels],
            levels: vec![0.0f32; num_voices],
            block_capacity,
        })
    }

    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.metadata.num_inputs()
    }

    /// プール出力のチャンネル数（エフェクトがあればその出力数）
    pub fn num_outputs(&self) -> usize {
        self.effect
            .as_ref()
            .map(|e| e.num_outputs())
            .unwrap_or_else(|| self.metadata.num_outputs())
    }

    pub fn voice_metadata(&self) -> &Arc<ModuleMetadata> {
        &self.metadata
    }

    /// 非Idleボイスの数（プール占有率）
    pub fn active_voices(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.state != VoiceState::Idle)
            .count()
    }

    pub fn voice_state(&self, index: usize) -> Option<VoiceState> {
        self.voices.get(index).map(|v| v.state)
    }

    pub fn voice_note(&self, index: usize) -> Option<u8> {
        self.voices.get(index).map(|v| v.note)
    }

    /// このノートを発音中のボイスがあるか
    pub fn holds_note(&self, note: u8) -> bool {
        self.voices
            .iter()
            .any(|v| v.state == VoiceState::Playing && v.note == note)
    }

    /// ノートオン - ボイスを割り当てて発音を開始する
    ///
    /// スチール順序: Idle → 最古のReleasing → 最古のPlaying。同順位は
    /// 挿入順（低いインデックス）で決まる。返り値は割り当てたスロット。
    pub fn note_on(&mut self, note: u8, gain: f32) -> usize {
        let target = self.find_target();
        self.event_clock += 1;
        let date = self.event_clock;
        let start_frame = self.frames_processed;
        let bend = self.bend_ratio;

        let voice = &mut self.voices[target];
        voice.note = note;
        voice.gain = gain;
        voice.state = VoiceState::Playing;
        voice.date = date;
        voice.start_frame = start_frame;
        voice.silent_blocks = 0;

        if let Some(freq) = self.addresses.freq {
            voice.instance.set_slot(freq, midi_to_hz(note) * bend);
        }
        if let Some(gain_slot) = self.addresses.gain {
            voice.instance.set_slot(gain_slot, gain as f64);
        }
        voice.instance.set_slot(self.addresses.gate, 1.0);

        target
    }

    /// ノートオフ - ノートを保持する最新のボイスをリリースへ移す
    pub fn note_off(&mut self, note: u8) {
        let target = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state == VoiceState::Playing && v.note == note)
            .max_by_key(|(_, v)| v.date)
            .map(|(i, _)| i);

        if let Some(index) = target {
            self.release_voice(index);
        }
    }

    /// 全ボイスを強制的にリリースへ移す
    pub fn all_notes_off(&mut self) {
        for index in 0..self.voices.len() {
            if self.voices[index].state == VoiceState::Playing {
                self.release_voice(index);
            }
        }
    }

    /// MIDI CCを対応付けられた全コントロールへ反映する
    pub fn ctrl_change(&mut self, cc: u8, value: f32) {
        for slot in self.metadata.controls_for_cc(cc) {
            if let Some(control) = self.metadata.control_at(slot) {
                let scaled = control.scale_midi(value);
                for voice in &mut self.voices {
                    voice.instance.set_slot(slot, scaled);
                }
            }
        }
    }

    /// ピッチホイール - 発音中の全ボイスを再チューニングする
    ///
    /// `wheel`は-1.0..1.0、レンジは±2半音。
    pub fn pitch_wheel(&mut self, wheel: f32) {
        let wheel = wheel.clamp(-1.0, 1.0) as f64;
        self.bend_ratio = 2f64.powf(wheel * 2.0 / 12.0);

        if let Some(freq) = self.addresses.freq {
            for voice in &mut self.voices {
                if voice.state != VoiceState::Idle {
                    voice
                        .instance
                        .set_slot(freq, midi_to_hz(voice.note) * self.bend_ratio);
                }
            }
        }
    }

    /// ブロック1個分処理する
    ///
    /// 非Idleの各ボイスを自分のバッファへcomputeし、ミキサーで`output`へ
    /// 合算する。リリース中のボイスは設定回数の無音ブロックの後にIdleへ
    /// 戻り、再利用可能になる。
    pub fn process(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> EngineResult<()> {
        if frames > self.block_capacity {
            return Err(EngineError::internal(&format!(
                "block of {} frames exceeds pool capacity {}",
                frames, self.block_capacity
            )));
        }
        if output.len() != self.num_outputs() {
            return Err(EngineError::internal("pool output channel mismatch"));
        }

        for channel in output.iter_mut() {
            channel[..frames].fill(0.0);
        }

        let mut active = Vec::new();
        for (index, voice) in self.voices.iter_mut().enumerate() {
            if voice.state == VoiceState::Idle {
                continue;
            }
            voice.instance.compute(frames, inputs, &mut voice.buffers)?;
            active.push(index);
        }

        let frames_processed = self.frames_processed;
        {
            let Self {
                voices,
                mixer,
                effect,
                mix_bus,
                levels,
                ..
            } = self;

            let views: Vec<MixVoice<'_>> = active
                .iter()
                .map(|&index| {
                    let voice = &voices[index];
                    MixVoice {
                        buffers: &voice.buffers,
                        age_frames: frames_processed - voice.start_frame,
                    }
                })
                .collect();

            match effect {
                Some(effect_instance) => {
                    for channel in mix_bus.iter_mut() {
                        channel[..frames].fill(0.0);
                    }
                    mixer
                        .mix(frames, &views, mix_bus, levels)
                        .map_err(|e| EngineError::runtime_fault(None, e.to_string()))?;
                    effect_instance.compute(frames, mix_bus, output)?;
                }
                None => {
                    mixer
                        .mix(frames, &views, output, levels)
                        .map_err(|e| EngineError::runtime_fault(None, e.to_string()))?;
                }
            }
        }

        // リリース済み判定 - 無音ブロックの連続数で決める
        for (k, &index) in active.iter().enumerate() {
            let level = self.levels[k];
            let voice = &mut self.voices[index];
            if voice.state != VoiceState::Releasing {
                continue;
            }
            if level < self.config.silence_threshold {
                voice.silent_blocks += 1;
                if voice.silent_blocks >= self.config.release_silence_blocks {
                    voice.state = VoiceState::Idle;
                }
            } else {
                voice.silent_blocks = 0;
            }
        }

        self.frames_processed += frames as u64;
        Ok(())
    }

    /// 全ボイスへ同じコントロール値を書く（ノードのパラメーター面用）
    pub fn set_broadcast_slot(&mut self, slot: u32, value: f64) {
        for voice in &mut self.voices {
            voice.instance.set_slot(slot, value);
        }
    }

    /// 代表値（ボイス0）のコントロール値を読む
    pub fn get_broadcast_slot(&self, slot: u32) -> f64 {
        self.voices
            .first()
            .map(|v| v.instance.get_slot(slot))
            .unwrap_or(0.0)
    }

    fn release_voice(&mut self, index: usize) {
        let voice = &mut self.voices[index];
        voice.instance.set_slot(self.addresses.gate, 0.0);
        voice.state = VoiceState::Releasing;
        voice.silent_blocks = 0;
    }

    /// スチール対象の選択
    fn find_target(&self) -> usize {
        if let Some(index) = self
            .voices
            .iter()
            .position(|v| v.state == VoiceState::Idle)
        {
            return index;
        }

        let oldest_in = |state: VoiceState| {
            self.voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.state == state)
                .min_by_key(|(_, v)| v.date)
                .map(|(i, _)| i)
        };

        oldest_in(VoiceState::Releasing)
            .or_else(|| oldest_in(VoiceState::Playing))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoicePoolConfig;
    use crate::instantiate::{ModuleInstantiator, PolyModuleSet};
    use crate::module::sdk;

    fn make_pool(num_voices: usize, config: VoicePoolConfig) -> VoicePool {
        let set = PolyModuleSet {
            voice: sdk::sine_voice_module().unwrap(),
            mixer: sdk::fade_mixer_module().unwrap(),
            effect: None,
        };
        let parts = ModuleInstantiator::new(44100.0)
            .instantiate_poly(&set, num_voices)
            .unwrap();
        VoicePool::new(parts, config, 512).unwrap()
    }

    #[test]
    fn test_midi_to_hz() {
        assert!((midi_to_hz(69) - 440.0).abs() < 1e-9);
        assert!((midi_to_hz(81) - 880.0).abs() < 1e-9);
    }

    #[test]
    fn test_lifecycle_without_compute() {
        let mut pool = make_pool(2, VoicePoolConfig::default());
        assert_eq!(pool.voice_state(0), Some(VoiceState::Idle));

        let slot = pool.note_on(60, 0.0);
        assert_eq!(pool.voice_state(slot), Some(VoiceState::Playing));

        pool.note_off(60);
        assert_eq!(pool.voice_state(slot), Some(VoiceState::Releasing));

        // ゲイン0なので1ブロック目から完全な無音のまま
        let mut output = vec![vec![0.0f32; 128]];
        pool.process(128, &[], &mut output).unwrap();
        assert!(output[0].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_voice_stealing_oldest() {
        let mut pool = make_pool(4, VoicePoolConfig::default());

        for note in [60, 62, 64, 65, 67] {
            pool.note_on(note, 0.8);
        }

        // 5発目で最古（最初のノート）のボイスが奪われる
        assert_eq!(pool.active_voices(), 4);
        assert!(!pool.holds_note(60));
        assert!(pool.holds_note(67));
    }

    #[test]
    fn test_steal_prefers_releasing_over_playing() {
        let mut pool = make_pool(2, VoicePoolConfig::default());
        let first = pool.note_on(60, 0.8);
        let second = pool.note_on(62, 0.8);
        pool.note_off(62);

        // Idleが無く、Releasing(62)がPlaying(60)より先に奪われる
        let stolen = pool.note_on(64, 0.8);
        assert_eq!(stolen, second);
        assert!(pool.holds_note(60));
        assert_eq!(pool.voice_state(first), Some(VoiceState::Playing));
    }

    #[test]
    fn test_note_off_most_recent_duplicate() {
        let mut pool = make_pool(3, VoicePoolConfig::default());
        let first = pool.note_on(60, 0.8);
        let second = pool.note_on(60, 0.8);

        pool.note_off(60);
        assert_eq!(pool.voice_state(second), Some(VoiceState::Releasing));
        assert_eq!(pool.voice_state(first), Some(VoiceState::Playing));
    }

    #[test]
    fn test_all_notes_off() {
        let mut pool = make_pool(4, VoicePoolConfig::default());
        pool.note_on(60, 0.8);
        pool.note_on(64, 0.8);

        pool.all_notes_off();
        assert!(!pool.holds_note(60));
        assert!(!pool.holds_note(64));
        assert_eq!(pool.active_voices(), 2); // リリース中はまだ占有
    }

    #[test]
    fn test_release_returns_to_idle_after_silence() {
        let config = VoicePoolConfig {
            release_silence_blocks: 2,
            silence_threshold: 1e-3,
        };
        let mut pool = make_pool(1, config);
        let slot = pool.note_on(69, 0.8);

        let mut output = vec![vec![0.0f32; 512]];
        pool.process(512, &[], &mut output).unwrap();

        pool.note_off(69);
        for _ in 0..8 {
            pool.process(512, &[], &mut output).unwrap();
        }

        assert_eq!(pool.voice_state(slot), Some(VoiceState::Idle));
        assert_eq!(pool.active_voices(), 0);
    }

    #[test]
    fn test_deterministic_rendering() {
        let render = || {
            let mut pool = make_pool(4, VoicePoolConfig::default());
            let mut collected = Vec::new();
            let mut output = vec![vec![0.0f32; 256]];

            pool.note_on(60, 0.7);
            pool.process(256, &[], &mut output).unwrap();
            collected.extend_from_slice(&output[0]);

            pool.note_on(64, 0.5);
            pool.process(256, &[], &mut output).unwrap();
            collected.extend_from_slice(&output[0]);

            pool.note_off(60);
            pool.process(256, &[], &mut output).unwrap();
            collected.extend_from_slice(&output[0]);

            collected
        };

        assert_eq!(render(), render());
    }

    #[test]
    fn test_fresh_note_fades_in_from_silence() {
        let mut pool = make_pool(2, VoicePoolConfig::default());
        pool.note_on(69, 1.0);

        let mut output = vec![vec![0.0f32; 256]];
        pool.process(256, &[], &mut output).unwrap();

        // 取得直後のフレームはデクリックフェードで無音
        assert_eq!(output[0][0], 0.0);
        assert!(output[0].iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn test_ctrl_change_scales_into_range() {
        let mut pool = make_pool(1, VoicePoolConfig::default());
        pool.note_on(60, 0.8);

        // sine_voiceのgainは"ctrl 7"にバインドされている
        pool.ctrl_change(7, 127.0);
        // gainスロットは1（深さ優先順）
        assert_eq!(pool.voices[0].instance.get_slot(1), 1.0);

        pool.ctrl_change(7, 0.0);
        assert_eq!(pool.voices[0].instance.get_slot(1), 0.0);
    }

    #[test]
    fn test_pitch_wheel_retunes_sounding_voices() {
        let mut pool = make_pool(2, VoicePoolConfig::default());
        pool.note_on(69, 0.8);

        pool.pitch_wheel(1.0);
        let bent = pool.voices[0].instance.get_slot(0);
        assert!((bent - midi_to_hz(71)).abs() < 1e-6);

        pool.pitch_wheel(0.0);
        let straight = pool.voices[0].instance.get_slot(0);
        assert!((straight - 440.0).abs() < 1e-9);
    }
}
