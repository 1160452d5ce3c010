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

//! Offline Processor - Synchronous block-by-block rendering
//!
//! Drives a runtime instance over pre-supplied buffers with no real-time
//! constraint. The final block is truncated when the frame total is not a
//! multiple of the block length; an instance fault aborts the render.

use crate::errors::{EngineError, EngineResult};
use crate::instance::RuntimeInstance;

/// プロバイダー／コンシューマー駆動のオフラインレンダリング
///
/// `provide`は各ブロックの入力ステージングを埋め、`consume`は書き上がった
/// 出力ステージングを受け取る。どちらもオフセットと実フレーム数付き。
pub fn render_with<I, O>(
    instance: &mut RuntimeInstance,
    total_frames: usize,
    block_length: usize,
    mut provide: I,
    mut consume: O,
) -> EngineResult<usize>
where
    I: FnMut(usize, usize, &mut [Vec<f32>]),
    O: FnMut(usize, usize, &[Vec<f32>]),
{
    if block_length == 0 {
        return Err(EngineError::internal("block length must be non-zero"));
    }

    let mut in_stage = vec![vec![0.0f32; block_length]; instance.num_inputs()];
    let mut out_stage = vec![vec![0.0f32; block_length]; instance.num_outputs()];

    let mut done = 0usize;
    while done < total_frames {
        let frames = block_length.min(total_frames - done);

        provide(done, frames, &mut in_stage);
        instance.compute(frames, &in_stage, &mut out_stage)?;
        consume(done, frames, &out_stage);

        done += frames;
    }

    Ok(done)
}

/// 事前供給バッファに対するオフラインレンダリング
///
/// `inputs`と`outputs`は`total_frames`以上の長さを持つプレーナー
/// チャンネル群。正確に`total_frames`サンプルが書き込まれる。
pub fn render(
    instance: &mut RuntimeInstance,
    total_frames: usize,
    block_length: usize,
    inputs: &[Vec<f32>],
    outputs: &mut [Vec<f32>],
) -> EngineResult<usize> {
    if inputs.len() != instance.num_inputs() || outputs.len() != instance.num_outputs() {
        return Err(EngineError::internal("offline buffer channel mismatch"));
    }
    if inputs.iter().any(|c| c.len() < total_frames)
        || outputs.iter().any(|c| c.len() < total_frames)
    {
        return Err(EngineError::internal("offline buffer shorter than total frames"));
    }

    render_with(
        instance,
        total_frames,
        block_length,
        |offset, frames, stage| {
            for (channel, stage_channel) in inputs.iter().zip(stage.iter_mut()) {
                stage_channel[..frames].copy_from_slice(&channel[offset..offset + frames]);
            }
        },
        |offset, frames, stage| {
            for (stage_channel, channel) in stage.iter().zip(outputs.iter_mut()) {
                channel[offset..offset + frames].copy_from_slice(&stage_channel[..frames]);
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiate::ModuleInstantiator;
    use crate::module::sdk;

    fn gain_instance() -> RuntimeInstance {
        let module = sdk::gain_module(1).unwrap();
        ModuleInstantiator::new(44100.0).instantiate(&module).unwrap()
    }

    fn sine_instance() -> RuntimeInstance {
        let module = sdk::sine_voice_module().unwrap();
        let mut instance = ModuleInstantiator::new(44100.0).instantiate(&module).unwrap();
        instance.set_param("/sine_voice/gate", 1.0).unwrap();
        instance
    }

    #[test]
    fn test_render_exact_multiple() {
        let mut instance = gain_instance();
        let inputs = vec![vec![0.5f32; 512]];
        let mut outputs = vec![vec![0.0f32; 512]];

        let rendered = render(&mut instance, 512, 128, &inputs, &mut outputs).unwrap();
        assert_eq!(rendered, 512);
        assert!(outputs[0].iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_render_truncated_final_block() {
        // 300は128の倍数ではない - 最終ブロックは44フレームに切り詰め
        let mut instance = gain_instance();
        let inputs = vec![vec![1.0f32; 300]];
        let mut outputs = vec![vec![0.0f32; 300]];

        let rendered = render(&mut instance, 300, 128, &inputs, &mut outputs).unwrap();
        assert_eq!(rendered, 300);
        assert!(outputs[0].iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_render_with_block_accounting() {
        let mut instance = gain_instance();
        let mut blocks = Vec::new();

        let rendered = render_with(
            &mut instance,
            300,
            128,
            |_, _, stage| {
                for channel in stage.iter_mut() {
                    channel.fill(1.0);
                }
            },
            |offset, frames, _| blocks.push((offset, frames)),
        )
        .unwrap();

        assert_eq!(rendered, 300);
        assert_eq!(blocks, vec![(0, 128), (128, 128), (256, 44)]);
    }

    #[test]
    fn test_render_matches_single_pass() {
        // オフラインのブロック駆動は1回の等長computeと同じストリームを生む
        let mut blocked = sine_instance();
        let mut outputs = vec![vec![0.0f32; 384]];
        render(&mut blocked, 384, 128, &[], &mut outputs).unwrap();

        let mut joint = sine_instance();
        let mut reference = vec![vec![0.0f32; 384]];
        joint.compute(384, &[], &mut reference).unwrap();

        assert_eq!(outputs[0], reference[0]);
    }

    #[test]
    fn test_render_rejects_zero_block() {
        let mut instance = gain_instance();
        let inputs = vec![vec![0.0f32; 64]];
        let mut outputs = vec![vec![0.0f32; 64]];
        assert!(render(&mut instance, 64, 0, &inputs, &mut outputs).is_err());
    }

    #[test]
    fn test_render_rejects_short_buffers() {
        let mut instance = gain_instance();
        let inputs = vec![vec![0.0f32; 32]];
        let mut outputs = vec![vec![0.0f32; 64]];
        assert!(render(&mut instance, 64, 16, &inputs, &mut outputs).is_err());
    }
}
