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

//! Node Generator - From compiled modules to schedulable nodes
//!
//! `compile` is a pass-through to the external compiler collaborator;
//! `build_mono`/`build_poly` instantiate against the chosen backend. For the
//! worklet backend the generator registers processor code with the hosting
//! context exactly once per module fingerprint before constructing the
//! node; a cache hit skips registration entirely.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::instantiate::{ModuleInstantiator, PolyModuleSet};
use crate::metadata::ModuleMetadata;
use crate::module::CompiledModule;
use crate::node::{BlockSyncNode, BlockSyncPolyNode, DspNode, NodeInfo, PolyDspNode};
use crate::voices::VoicePool;
use crate::worklet::{WorkletContext, WorkletNode, WorkletPolyNode};

use std::sync::Arc;

/// 外部コンパイラーコラボレーター
///
/// ソースからCompiledModuleを生成する。失敗はコラボレーター側の理由
/// 文字列で返り、ジェネレーターがCompileFailureとして表面化する。
pub trait DspCompiler {
    fn compile(&self, name: &str, source: &str, options: &str)
        -> Result<CompiledModule, String>;
}

/// 実行バックエンドの選択
pub enum Backend<'a> {
    /// 呼び出し側が自分のスケジュールでブロックを引き出す
    BlockSync,
    /// 分離されたリアルタイム実行コンテキストに載せる
    Worklet(&'a WorkletContext),
}

/// 構築済みモノノード
pub enum BuiltNode {
    BlockSync(BlockSyncNode),
    Worklet(WorkletNode),
}

impl BuiltNode {
    /// ブロック同期アダプターへのアクセス（そのバックエンドで構築時のみ）
    pub fn block_sync_mut(&mut self) -> Option<&mut BlockSyncNode> {
        match self {
            BuiltNode::BlockSync(node) => Some(node),
            BuiltNode::Worklet(_) => None,
        }
    }
}

impl DspNode for BuiltNode {
    fn node_info(&self) -> &NodeInfo {
        match self {
            BuiltNode::BlockSync(node) => node.node_info(),
            BuiltNode::Worklet(node) => node.node_info(),
        }
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        match self {
            BuiltNode::BlockSync(node) => node.metadata(),
            BuiltNode::Worklet(node) => node.metadata(),
        }
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        match self {
            BuiltNode::BlockSync(node) => node.get_param(name),
            BuiltNode::Worklet(node) => node.get_param(name),
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        match self {
            BuiltNode::BlockSync(node) => node.set_param(name, value),
            BuiltNode::Worklet(node) => node.set_param(name, value),
        }
    }

    fn destroy(&mut self) {
        match self {
            BuiltNode::BlockSync(node) => node.destroy(),
            BuiltNode::Worklet(node) => node.destroy(),
        }
    }
}

/// 構築済みポリノード
pub enum BuiltPolyNode {
    BlockSync(BlockSyncPolyNode),
    Worklet(WorkletPolyNode),
}

impl BuiltPolyNode {
    pub fn block_sync_mut(&mut self) -> Option<&mut BlockSyncPolyNode> {
        match self {
            BuiltPolyNode::BlockSync(node) => Some(node),
            BuiltPolyNode::Worklet(_) => None,
        }
    }
}

impl DspNode for BuiltPolyNode {
    fn node_info(&self) -> &NodeInfo {
        match self {
            BuiltPolyNode::BlockSync(node) => node.node_info(),
            BuiltPolyNode::Worklet(node) => node.node_info(),
        }
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        match self {
            BuiltPolyNode::BlockSync(node) => node.metadata(),
            BuiltPolyNode::Worklet(node) => node.metadata(),
        }
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        match self {
            BuiltPolyNode::BlockSync(node) => node.get_param(name),
            BuiltPolyNode::Worklet(node) => node.get_param(name),
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        match self {
            BuiltPolyNode::BlockSync(node) => node.set_param(name, value),
            BuiltPolyNode::Worklet(node) => node.set_param(name, value),
        }
    }

    fn destroy(&mut self) {
        match self {
            BuiltPolyNode::BlockSync(node) => node.destroy(),
            BuiltPolyNode::Worklet(node) => node.destroy(),
        }
    }
}

impl PolyDspNode for BuiltPolyNode {
    fn key_on(&mut self, note: u8, gain: f32) -> EngineResult<()> {
        match self {
            BuiltPolyNode::BlockSync(node) => node.key_on(note, gain),
            BuiltPolyNode::Worklet(node) => node.key_on(note, gain),
        }
    }

    fn key_off(&mut self, note: u8) -> EngineResult<()> {
        match self {
            BuiltPolyNode::BlockSync(node) => node.key_off(note),
            BuiltPolyNode::Worklet(node) => node.key_off(note),
        }
    }

    fn all_notes_off(&mut self) {
        match self {
            BuiltPolyNode::BlockSync(node) => node.all_notes_off(),
            BuiltPolyNode::Worklet(node) => node.all_notes_off(),
        }
    }

    fn ctrl_change(&mut self, cc: u8, value: f32) {
        match self {
            BuiltPolyNode::BlockSync(node) => node.ctrl_change(cc, value),
            BuiltPolyNode::Worklet(node) => node.ctrl_change(cc, value),
        }
    }

    fn pitch_wheel(&mut self, wheel: f32) {
        match self {
            BuiltPolyNode::BlockSync(node) => node.pitch_wheel(wheel),
            BuiltPolyNode::Worklet(node) => node.pitch_wheel(wheel),
        }
    }
}

/// ノードジェネレーター
pub struct NodeGenerator {
    config: EngineConfig,
}

impl NodeGenerator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 外部コンパイラーへのパススルー
    ///
    /// 失敗時はファクトリーを一切作らずCompileFailureを返す。
    pub fn compile(
        &self,
        compiler: &dyn DspCompiler,
        name: &str,
        source: &str,
        options: &str,
    ) -> EngineResult<CompiledModule> {
        compiler
            .compile(name, source, options)
            .map_err(|reason| EngineError::compile(name, reason))
    }

    /// モノモジュールからノードを構築する
    pub fn build_mono(
        &self,
        module: &CompiledModule,
        backend: Backend<'_>,
    ) -> EngineResult<BuiltNode> {
        let instantiator = ModuleInstantiator::new(self.config.sample_rate);

        match backend {
            Backend::BlockSync => {
                let instance = instantiator.instantiate(module)?;
                Ok(BuiltNode::BlockSync(BlockSyncNode::new(instance)))
            }
            Backend::Worklet(context) => {
                context.register(module)?;
                let instance = instantiator.instantiate(module)?;
                Ok(BuiltNode::Worklet(context.spawn_mono(module, instance)?))
            }
        }
    }

    /// ボイス＋ミキサー＋（任意の）エフェクトからポリノードを構築する
    pub fn build_poly(
        &self,
        set: &PolyModuleSet,
        num_voices: usize,
        backend: Backend<'_>,
    ) -> EngineResult<BuiltPolyNode> {
        let instantiator = ModuleInstantiator::new(self.config.sample_rate);

        match backend {
            Backend::BlockSync => {
                let parts = instantiator.instantiate_poly(set, num_voices)?;
                let pool = VoicePool::new(parts, self.config.voices, self.config.block_capacity)?;
                Ok(BuiltPolyNode::BlockSync(BlockSyncPolyNode::new(pool)))
            }
            Backend::Worklet(context) => {
                context.register(&set.voice)?;
                context.register(&set.mixer)?;
                if let Some(effect) = &set.effect {
                    context.register(effect)?;
                }

                let parts = instantiator.instantiate_poly(set, num_voices)?;
                let pool = VoicePool::new(parts, self.config.voices, context.quantum())?;
                Ok(BuiltPolyNode::Worklet(context.spawn_poly(&set.voice, pool)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::sdk;
    use crate::worklet::WorkletContext;

    struct FakeCompiler {
        fail: bool,
    }

    impl DspCompiler for FakeCompiler {
        fn compile(
            &self,
            _name: &str,
            _source: &str,
            _options: &str,
        ) -> Result<CompiledModule, String> {
            if self.fail {
                Err("syntax error at line 3".to_string())
            } else {
                sdk::sine_voice_module().map_err(|e| e.to_string())
            }
        }
    }

    #[test]
    fn test_compile_passthrough() {
        let generator = NodeGenerator::with_defaults();

        let ok = generator.compile(&FakeCompiler { fail: false }, "osc", "...", "");
        assert!(ok.is_ok());

        let err = generator.compile(&FakeCompiler { fail: true }, "osc", "...", "");
        assert!(matches!(err, Err(EngineError::Compile { .. })));
    }

    #[test]
    fn test_built_node_channel_counts_match_metadata() {
        let generator = NodeGenerator::with_defaults();
        let module = sdk::gain_module(2).unwrap();

        let node = generator.build_mono(&module, Backend::BlockSync).unwrap();
        assert_eq!(node.num_inputs(), module.metadata().num_inputs());
        assert_eq!(node.num_outputs(), module.metadata().num_outputs());

        let ctx = WorkletContext::detached(44100.0, 128, 2);
        let node = generator.build_mono(&module, Backend::Worklet(&ctx)).unwrap();
        assert_eq!(node.num_inputs(), 2);
        assert_eq!(node.num_outputs(), 2);
    }

    #[test]
    fn test_worklet_build_registers_exactly_once() {
        let generator = NodeGenerator::with_defaults();
        let ctx = WorkletContext::detached(44100.0, 128, 2);

        // ビット同一のモジュールを2回ビルドしても登録は1回
        let first = sdk::sine_voice_module().unwrap();
        let second = sdk::sine_voice_module().unwrap();

        let _a = generator.build_mono(&first, Backend::Worklet(&ctx)).unwrap();
        assert_eq!(ctx.registration_count(), 1);

        let _b = generator.build_mono(&second, Backend::Worklet(&ctx)).unwrap();
        assert_eq!(ctx.registration_count(), 1);
    }

    #[test]
    fn test_block_sync_mono_scenario() {
        // 1入力1出力・blockLength=128で256フレームの無音→256フレームの有限出力
        let generator = NodeGenerator::with_defaults();
        let module = sdk::gain_module(1).unwrap();
        let mut node = generator.build_mono(&module, Backend::BlockSync).unwrap();
        let adapter = node.block_sync_mut().unwrap();

        let inputs = vec![vec![0.0f32; 128]];
        let mut outputs = vec![vec![0.0f32; 128]];
        let mut produced = 0usize;
        for _ in 0..2 {
            adapter.process(128, &inputs, &mut outputs).unwrap();
            assert!(outputs[0].iter().all(|s| s.is_finite()));
            produced += 128;
        }
        assert_eq!(produced, 256);
    }

    #[test]
    fn test_build_poly_block_sync() {
        let generator = NodeGenerator::with_defaults();
        let set = PolyModuleSet {
            voice: sdk::sine_voice_module().unwrap(),
            mixer: sdk::fade_mixer_module().unwrap(),
            effect: None,
        };

        let mut node = generator.build_poly(&set, 4, Backend::BlockSync).unwrap();
        node.key_on(60, 0.8).unwrap();
        node.key_on(64, 0.8).unwrap();

        let adapter = node.block_sync_mut().unwrap();
        let mut outputs = vec![vec![0.0f32; 256]];
        adapter.process(256, &[], &mut outputs).unwrap();
        assert!(outputs[0].iter().any(|s| s.abs() > 0.0));
        assert_eq!(adapter.pool().unwrap().active_voices(), 2);
    }

    #[test]
    fn test_build_poly_worklet() {
        let generator = NodeGenerator::with_defaults();
        let ctx = WorkletContext::detached(44100.0, 128, 1);
        let set = PolyModuleSet {
            voice: sdk::sine_voice_module().unwrap(),
            mixer: sdk::fade_mixer_module().unwrap(),
            effect: None,
        };

        let mut node = generator.build_poly(&set, 4, Backend::Worklet(&ctx)).unwrap();
        node.key_on(69, 1.0).unwrap();

        let mut bus = vec![0.0f32; 128];
        ctx.render_quantum(&mut bus);
        // デクリックフェード越しでも最初のクォンタム内に信号が現れる
        assert!(bus.iter().any(|s| s.abs() > 0.0));
        assert!(bus.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_registration_failure_surfaces_as_build_failure() {
        let generator = NodeGenerator::with_defaults();
        let mut ctx = WorkletContext::detached(44100.0, 128, 2);
        ctx.close();

        let module = sdk::sine_voice_module().unwrap();
        let result = generator.build_mono(&module, Backend::Worklet(&ctx));
        assert!(matches!(result, Err(EngineError::Registration { .. })));
    }
}
