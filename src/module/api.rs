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

//! Module API - Core interfaces every compiled module meets the engine at
//!
//! Shared-library modules and native SDK modules both end up behind these
//! traits; everything above this seam (instantiator, voice pool, backends)
//! is agnostic of where the kernel came from.

use crate::module::ModuleResult;

/// ホストとモジュールの間のABIバージョン - 両者で一致する必要がある
pub const MODULE_ABI_VERSION: u32 = 1;

/// インスタンスメモリ要求の上限（バイト）
pub const MAX_MODULE_MEMORY: usize = 256 * 1024 * 1024;

/// 1回のcomputeで処理できるフレーム数の上限
pub const MAX_BLOCK_FRAMES: usize = 4096;

/// DSPカーネル - インスタンス化されたモジュールプログラム1個分
///
/// `compute`は連続呼び出しでフレームの欠落も重複もなく状態を進める。
/// コントロールはメタデータツリーの深さ優先順で採番されたスロットで
/// アクセスする。
pub trait DspKernel: Send {
    /// 内部DSP状態をリセットする
    fn init(&mut self, sample_rate: f32);

    /// ちょうど`frames`フレーム分処理を進める
    ///
    /// バッファは`frames`以上の長さを持つプレーナーチャンネル群。
    fn compute(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> ModuleResult<()>;

    /// コントロール値をスロットで読む
    fn get_control(&self, slot: u32) -> f64;

    /// コントロール値をスロットで書く
    fn set_control(&mut self, slot: u32, value: f64);
}

/// ミキサーに渡す1ボイス分のビュー
#[derive(Debug)]
pub struct MixVoice<'a> {
    /// ボイスのプライベート出力バッファ（プレーナー）
    pub buffers: &'a [Vec<f32>],
    /// 取得タイムスタンプからの経過フレーム数（論理クロック）
    pub age_frames: u64,
}

/// ボイスミキシングカーネル
///
/// ポリフォニックノードの全ボイス出力を1つの出力へ合算する。フェードは
/// `age_frames`から決定論的に計算されるため、同じイベント列と同じ
/// ブロック長に対して出力はビット単位で一致する。
pub trait MixerKernel: Send {
    /// 内部状態をリセットする
    fn init(&mut self, sample_rate: f32);

    /// 全ボイスを`output`へ加算ミックスする
    ///
    /// `output`は呼び出し側がクリア済み。`levels`にはボイスごとの
    /// ピークレベルを書き込む（`levels.len() >= voices.len()`）。
    fn mix(
        &mut self,
        frames: usize,
        voices: &[MixVoice<'_>],
        output: &mut [Vec<f32>],
        levels: &mut [f32],
    ) -> ModuleResult<()>;
}

/// カーネルファクトリー - CompiledModuleごとに1つ
///
/// 共有ライブラリ版はエクスポートシンボルを束縛して生成し、ネイティブ版は
/// SDKのクロージャを呼ぶ。どちらも失敗時はインスタンスを一切残さない。
pub trait KernelFactory: Send + Sync {
    /// 新しいDSPカーネルを生成する
    fn create_kernel(&self) -> ModuleResult<Box<dyn DspKernel>>;

    /// 新しいミキサーカーネルを生成する
    ///
    /// ミキサーエントリポイントを持たないモジュールでは
    /// `ModuleError::NotAMixer`を返す。
    fn create_mixer(&self) -> ModuleResult<Box<dyn MixerKernel>>;
}
