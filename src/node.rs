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
use crate::instance::RuntimeInstance;
use crate::metadata::ModuleMetadata;
use crate::voices::VoicePool;

/// ノード情報
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: Uuid,
    pub name: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
}

/// 構築済みノードの共通コントロールサーフェス
///
/// バックエンドによらず、チャンネル数・名前付きパラメーターアクセス・
/// メタデータドキュメント・リソース解放フックを公開する。
pub trait DspNode: Send {
    fn node_info(&self) -> &NodeInfo;

    /// メタデータドキュメント（UIレンダラー等の読み取り専用コラボレーター用）
    fn metadata(&self) -> Arc<ModuleMetadata>;

    fn num_inputs(&self) -> usize {
        self.node_info().num_inputs
    }

    fn num_outputs(&self) -> usize {
        self.node_info().num_outputs
    }

    fn get_param(&self, name: &str) -> EngineResult<f64>;

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()>;

    /// 下層リソースを解放する。以降の処理呼び出しはエラーになる。
    fn destroy(&mut self);
}

/// ポリフォニックノードの追加サーフェス
pub trait PolyDspNode: DspNode {
    fn key_on(&mut self, note: u8, gain: f32) -> EngineResult<()>;
    fn key_off(&mut self, note: u8) -> EngineResult<()>;
    fn all_notes_off(&mut self);
    fn ctrl_change(&mut self, cc: u8, value: f32);
    fn pitch_wheel(&mut self, wheel: f32);
}

/// ブロック同期バックエンドのモノノード
///
/// 呼び出し側が自分のスケジュールでブロックを引き出す。パラメーター
/// アクセスはcomputeと同じコンテキストで行うこと（ブロックの合間のみ）。
pub struct BlockSyncNode {
    info: NodeInfo,
    metadata: Arc<ModuleMetadata>,
    instance: Option<RuntimeInstance>,
}

impl BlockSyncNode {
    pub(crate) fn new(instance: RuntimeInstance) -> Self {
        let metadata = Arc::clone(instance.metadata());
        let info = NodeInfo {
            id: instance.id(),
            name: metadata.name().to_string(),
            num_inputs: metadata.num_inputs(),
            num_outputs: metadata.num_outputs(),
        };
        Self {
            info,
            metadata,
            instance: Some(instance),
        }
    }

    /// ブロック1個分のコールバック
    pub fn process(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> EngineResult<()> {
        match self.instance.as_mut() {
            Some(instance) => instance.compute(frames, inputs, outputs),
            None => Err(EngineError::NodeNotFound { id: self.info.id }),
        }
    }

    /// 所有インスタンスへの参照（オフラインレンダリング用）
    pub fn instance_mut(&mut self) -> Option<&mut RuntimeInstance> {
        self.instance.as_mut()
    }
}

impl DspNode for BlockSyncNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        Arc::clone(&self.metadata)
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        match self.instance.as_ref() {
            Some(instance) => instance.get_param(name),
            None => Err(EngineError::NodeNotFound { id: self.info.id }),
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        match self.instance.as_mut() {
            Some(instance) => instance.set_param(name, value),
            None => Err(EngineError::NodeNotFound { id: self.info.id }),
        }
    }

    fn destroy(&mut self) {
        self.instance = None;
    }
}

/// ブロック同期バックエンドのポリノード
pub struct BlockSyncPolyNode {
    info: NodeInfo,
    metadata: Arc<ModuleMetadata>,
    pool: Option<VoicePool>,
}

impl BlockSyncPolyNode {
    pub(crate) fn new(pool: VoicePool) -> Self {
        let metadata = Arc::clone(pool.voice_metadata());
        let info = NodeInfo {
            id: Uuid::new_v4(),
            name: metadata.name().to_string(),
            num_inputs: pool.num_inputs(),
            num_outputs: pool.num_outputs(),
        };
        Self {
            info,
            metadata,
            pool: Some(pool),
        }
    }

    pub fn process(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> EngineResult<()> {
        match self.pool.as_mut() {
            Some(pool) => pool.process(frames, inputs, outputs),
            None => Err(EngineError::NodeNotFound { id: self.info.id }),
        }
    }

    pub fn pool(&self) -> Option<&VoicePool> {
        self.pool.as_ref()
    }

    pub fn pool_mut(&mut self) -> Option<&mut VoicePool> {
        self.pool.as_mut()
    }
}

impl DspNode for BlockSyncPolyNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        Arc::clone(&self.metadata)
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        let pool = self
            .pool
            .as_ref()
            .ok_or(EngineError::NodeNotFound { id: self.info.id })?;
        let slot = self
            .metadata
            .resolve(name)
            .ok_or_else(|| EngineError::parameter(name, "no such control address"))?;
        // ボイス0が代表値を持つ
        Ok(pool.get_broadcast_slot(slot))
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        let metadata = Arc::clone(&self.metadata);
        let pool = self
            .pool
            .as_mut()
            .ok_or(EngineError::NodeNotFound { id: self.info.id })?;
        let slot = metadata
            .resolve(name)
            .ok_or_else(|| EngineError::parameter(name, "no such control address"))?;
        let control = metadata
            .control_at(slot)
            .ok_or_else(|| EngineError::parameter(name, "control descriptor missing"))?;
        let validated = control
            .validate_value(value)
            .map_err(|e| EngineError::parameter(name, e.to_string()))?;
        pool.set_broadcast_slot(slot, validated);
        Ok(())
    }

    fn destroy(&mut self) {
        self.pool = None;
    }
}

impl PolyDspNode for BlockSyncPolyNode {
    fn key_on(&mut self, note: u8, gain: f32) -> EngineResult<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or(EngineError::NodeNotFound { id: self.info.id })?;
        pool.note_on(note, gain);
        Ok(())
    }

    fn key_off(&mut self, note: u8) -> EngineResult<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or(EngineError::NodeNotFound { id: self.info.id })?;
        pool.note_off(note);
        Ok(())
    }

    fn all_notes_off(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.all_notes_off();
        }
    }

    fn ctrl_change(&mut self, cc: u8, value: f32) {
        if let Some(pool) = self.pool.as_mut() {
            pool.ctrl_change(cc, value);
        }
    }

    fn pitch_wheel(&mut self, wheel: f32) {
        if let Some(pool) = self.pool.as_mut() {
            pool.pitch_wheel(wheel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiate::ModuleInstantiator;
    use crate::module::sdk;

    fn gain_node() -> BlockSyncNode {
        let module = sdk::gain_module(1).unwrap();
        let instance = ModuleInstantiator::new(44100.0).instantiate(&module).unwrap();
        BlockSyncNode::new(instance)
    }

    #[test]
    fn test_node_channel_counts() {
        let node = gain_node();
        assert_eq!(node.num_inputs(), 1);
        assert_eq!(node.num_outputs(), 1);
        assert_eq!(node.metadata().name(), "gain");
    }

    #[test]
    fn test_node_param_surface() {
        let mut node = gain_node();
        assert_eq!(node.get_param("/gain/level").unwrap(), 1.0);
        node.set_param("/gain/level", 0.25).unwrap();
        assert_eq!(node.get_param("level").unwrap(), 0.25);
    }

    #[test]
    fn test_process_silent_input_stays_finite() {
        // 1入力1出力・ブロック長128で256フレームの無音を与える
        let mut node = gain_node();
        let inputs = vec![vec![0.0f32; 128]];
        let mut outputs = vec![vec![0.0f32; 128]];
        let mut rendered = 0;

        for _ in 0..2 {
            node.process(128, &inputs, &mut outputs).unwrap();
            assert!(outputs[0].iter().all(|s| s.is_finite()));
            rendered += outputs[0].len();
        }
        assert_eq!(rendered, 256);
    }

    #[test]
    fn test_destroy_releases_instance() {
        let mut node = gain_node();
        node.destroy();

        let inputs = vec![vec![0.0f32; 64]];
        let mut outputs = vec![vec![0.0f32; 64]];
        assert!(node.process(64, &inputs, &mut outputs).is_err());
        assert!(node.get_param("/gain/level").is_err());
    }
}
