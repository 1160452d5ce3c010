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

//! Worklet Backend - Isolated real-time execution context
//!
//! The context owns a processing core the control side never touches
//! directly: node handles talk to it through a fire-and-forget command
//! channel, drained once per quantum. Processor code is registered at most
//! once per module fingerprint; only data (factory handle + metadata)
//! crosses the isolation boundary. A context either drives itself from a
//! cpal output stream or is pumped by its owner - the node generator never
//! schedules it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::instance::RuntimeInstance;
use crate::metadata::ModuleMetadata;
use crate::module::{CompiledModule, KernelFactory};
use crate::node::{DspNode, NodeInfo, PolyDspNode};
use crate::voices::VoicePool;

/// ワークレット層のエラー
#[derive(Debug, thiserror::Error)]
pub enum WorkletError {
    #[error("execution context is closed")]
    ContextClosed,
    #[error("no output device available")]
    NoDevice,
    #[error("audio stream error: {0}")]
    Stream(String),
}

impl From<WorkletError> for EngineError {
    fn from(error: WorkletError) -> Self {
        EngineError::Internal {
            message: error.to_string(),
        }
    }
}

/// 登録済みプロセッサーのレシピ
///
/// 分離境界を渡るのはデータのみ: ファクトリーハンドルとメタデータ。
/// 実行ルーチン自体はこのクレートに同梱されたコードで、コンテキストごとに
/// 合成されることはない。
#[derive(Clone)]
pub struct ProcessorRecipe {
    pub factory: Arc<dyn KernelFactory>,
    pub metadata: Arc<ModuleMetadata>,
}

/// フィンガープリントをキーにした登録キャッシュ
///
/// コンテキスト所有の明示的な状態。同じフィンガープリントは実行コンテキスト
/// ごとに最大1回しか登録されず、再登録要求はノーオペのキャッシュヒット。
pub struct RegistrationCache {
    entries: DashMap<String, ProcessorRecipe>,
    registrations: AtomicUsize,
}

impl RegistrationCache {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            registrations: AtomicUsize::new(0),
        }
    }

    /// 新規登録ならtrue、キャッシュヒットならfalse
    fn register(&self, fingerprint: &str, recipe: ProcessorRecipe) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(recipe);
                self.registrations.fetch_add(1, Ordering::SeqCst);
                true
            }
        }
    }

    fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// これまでに実行された登録の回数（テストで観測可能）
    fn count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

/// コントロール側からコアへの非同期コマンド
enum WorkletCommand {
    Add {
        id: Uuid,
        processor: Box<WorkletProcessor>,
    },
    Remove {
        id: Uuid,
    },
    SetControl {
        id: Uuid,
        slot: u32,
        value: f64,
    },
    KeyOn {
        id: Uuid,
        note: u8,
        gain: f32,
    },
    KeyOff {
        id: Uuid,
        note: u8,
    },
    AllNotesOff {
        id: Uuid,
    },
    CtrlChange {
        id: Uuid,
        cc: u8,
        value: f32,
    },
    PitchWheel {
        id: Uuid,
        wheel: f32,
    },
}

enum ProcessorKind {
    Mono(RuntimeInstance),
    Poly(VoicePool),
}

/// コア内で駆動される1ノード分のプロセッサー
struct WorkletProcessor {
    kind: ProcessorKind,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
    faulted: bool,
}

impl WorkletProcessor {
    fn mono(instance: RuntimeInstance, quantum: usize) -> Self {
        let inputs = vec![vec![0.0f32; quantum]; instance.num_inputs()];
        let outputs = vec![vec![0.0f32; quantum]; instance.num_outputs()];
        Self {
            kind: ProcessorKind::Mono(instance),
            inputs,
            outputs,
            faulted: false,
        }
    }

    fn poly(pool: VoicePool, quantum: usize) -> Self {
        let inputs = vec![vec![0.0f32; quantum]; pool.num_inputs()];
        let outputs = vec![vec![0.0f32; quantum]; pool.num_outputs()];
        Self {
            kind: ProcessorKind::Poly(pool),
            inputs,
            outputs,
            faulted: false,
        }
    }

    fn process(&mut self, frames: usize) {
        if self.faulted {
            return;
        }
        let result = match &mut self.kind {
            ProcessorKind::Mono(instance) => {
                instance.compute(frames, &self.inputs, &mut self.outputs)
            }
            ProcessorKind::Poly(pool) => pool.process(frames, &self.inputs, &mut self.outputs),
        };
        if let Err(e) = result {
            // フォールトしたプロセッサーは静かに切り離す - ホストの
            // オーディオ処理へは伝播させない
            eprintln!("Worklet processor fault, disconnecting: {}", e);
            self.faulted = true;
            for channel in self.outputs.iter_mut() {
                channel.fill(0.0);
            }
        }
    }

    fn set_control(&mut self, slot: u32, value: f64) {
        match &mut self.kind {
            ProcessorKind::Mono(instance) => instance.set_slot(slot, value),
            ProcessorKind::Poly(pool) => pool.set_broadcast_slot(slot, value),
        }
    }
}

/// 実行コンテキストの処理コア
struct WorkletCore {
    processors: HashMap<Uuid, WorkletProcessor>,
    rx: Receiver<WorkletCommand>,
    quantum: usize,
    channels: usize,
    closed: bool,
}

impl WorkletCore {
    /// クォンタム境界でコマンドキューを処理する
    fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                WorkletCommand::Add { id, processor } => {
                    self.processors.insert(id, *processor);
                }
                WorkletCommand::Remove { id } => {
                    self.processors.remove(&id);
                }
                WorkletCommand::SetControl { id, slot, value } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        p.set_control(slot, value);
                    }
                }
                WorkletCommand::KeyOn { id, note, gain } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        if let ProcessorKind::Poly(pool) = &mut p.kind {
                            pool.note_on(note, gain);
                        }
                    }
                }
                WorkletCommand::KeyOff { id, note } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        if let ProcessorKind::Poly(pool) = &mut p.kind {
                            pool.note_off(note);
                        }
                    }
                }
                WorkletCommand::AllNotesOff { id } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        if let ProcessorKind::Poly(pool) = &mut p.kind {
                            pool.all_notes_off();
                        }
                    }
                }
                WorkletCommand::CtrlChange { id, cc, value } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        if let ProcessorKind::Poly(pool) = &mut p.kind {
                            pool.ctrl_change(cc, value);
                        }
                    }
                }
                WorkletCommand::PitchWheel { id, wheel } => {
                    if let Some(p) = self.processors.get_mut(&id) {
                        if let ProcessorKind::Poly(pool) = &mut p.kind {
                            pool.pitch_wheel(wheel);
                        }
                    }
                }
            }
        }
    }

    /// クォンタム1個分をインターリーブ済み出力バスへレンダリングする
    fn render_quantum(&mut self, interleaved: &mut [f32]) {
        for sample in interleaved.iter_mut() {
            *sample = 0.0;
        }

        self.drain_commands();
        if self.closed {
            return;
        }

        let frames = (interleaved.len() / self.channels).min(self.quantum);

        for processor in self.processors.values_mut() {
            processor.process(frames);
            if processor.faulted {
                continue;
            }
            for (ch, buffer) in processor.outputs.iter().enumerate() {
                let bus_channel = ch % self.channels;
                for i in 0..frames {
                    interleaved[i * self.channels + bus_channel] += buffer[i];
                }
            }
        }
    }
}

/// 分離されたワークレット実行コンテキスト
///
/// cpalの出力ストリームに接続されるとホストのオーディオグラフが
/// スケジュールし、デタッチ状態ではコンテキストの所有者がポンプする。
/// どちらでもノードジェネレーターがスケジュールを握ることはない。
pub struct WorkletContext {
    cache: RegistrationCache,
    core: Arc<Mutex<WorkletCore>>,
    tx: Sender<WorkletCommand>,
    sample_rate: f32,
    quantum: usize,
    channels: usize,
    stream: Option<cpal::Stream>,
}

impl WorkletContext {
    /// ストリームを持たないコンテキストを作る（ヘッドレス／テスト用）
    pub fn detached(sample_rate: f32, quantum: usize, channels: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        let core = WorkletCore {
            processors: HashMap::new(),
            rx,
            quantum,
            channels,
            closed: false,
        };

        Self {
            cache: RegistrationCache::new(),
            core: Arc::new(Mutex::new(core)),
            tx,
            sample_rate,
            quantum,
            channels,
            stream: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::detached(config.sample_rate, config.quantum, config.output_channels)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// デフォルト出力デバイスのストリームでコンテキストを駆動する
    pub fn attach_default_output(&mut self) -> EngineResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(WorkletError::NoDevice)?;

        let config = cpal::StreamConfig {
            channels: self.channels as cpal::ChannelCount,
            sample_rate: cpal::SampleRate(self.sample_rate as u32),
            buffer_size: cpal::BufferSize::Fixed(self.quantum as u32),
        };

        let core = Arc::clone(&self.core);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // ロックを取れないクォンタムはスキップする
                    if let Ok(mut core) = core.lock() {
                        core.render_quantum(data);
                    }
                },
                |err| {
                    eprintln!("Worklet stream error: {}", err);
                },
                None,
            )
            .map_err(|e| WorkletError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| WorkletError::Stream(e.to_string()))?;

        println!("Worklet context attached:");
        println!("  Sample Rate: {} Hz", self.sample_rate);
        println!("  Quantum: {} frames", self.quantum);
        self.stream = Some(stream);
        Ok(())
    }

    /// ストリームを切り離す（コンテキスト自体は生きたまま）
    pub fn detach(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
    }

    /// プロセッサーコードをフィンガープリントで最大1回登録する
    ///
    /// 返り値は新規登録ならtrue、キャッシュヒットならfalse。閉じた
    /// コンテキストは登録を拒否し、それはビルド失敗として表面化する。
    pub fn register(&self, module: &CompiledModule) -> EngineResult<bool> {
        if self.is_closed() {
            return Err(EngineError::registration(
                module.fingerprint(),
                WorkletError::ContextClosed.to_string(),
            ));
        }

        if self.cache.contains(module.fingerprint()) {
            return Ok(false);
        }

        let recipe = ProcessorRecipe {
            factory: Arc::clone(module.factory()),
            metadata: Arc::clone(module.metadata()),
        };
        Ok(self.cache.register(module.fingerprint(), recipe))
    }

    /// これまでに実行された登録の回数
    pub fn registration_count(&self) -> usize {
        self.cache.count()
    }

    pub fn is_registered(&self, fingerprint: &str) -> bool {
        self.cache.contains(fingerprint)
    }

    /// クォンタム1個分を手動でポンプする（デタッチ運用時）
    pub fn render_quantum(&self, interleaved: &mut [f32]) {
        if let Ok(mut core) = self.core.lock() {
            core.render_quantum(interleaved);
        }
    }

    /// コンテキストを閉じる - 次のクォンタムから計算は止まる
    pub fn close(&mut self) {
        self.detach();
        if let Ok(mut core) = self.core.lock() {
            core.closed = true;
            core.processors.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.core.lock().map(|core| core.closed).unwrap_or(true)
    }

    pub(crate) fn spawn_mono(
        &self,
        module: &CompiledModule,
        instance: RuntimeInstance,
    ) -> EngineResult<WorkletNode> {
        self.ensure_registered(module)?;

        let metadata = Arc::clone(instance.metadata());
        let info = NodeInfo {
            id: instance.id(),
            name: metadata.name().to_string(),
            num_inputs: metadata.num_inputs(),
            num_outputs: metadata.num_outputs(),
        };

        let processor = Box::new(WorkletProcessor::mono(instance, self.quantum));
        self.tx
            .send(WorkletCommand::Add {
                id: info.id,
                processor,
            })
            .map_err(|_| EngineError::from(WorkletError::ContextClosed))?;

        Ok(WorkletNode {
            shadow: seed_shadow(&metadata),
            info,
            metadata,
            tx: self.tx.clone(),
            alive: true,
        })
    }

    pub(crate) fn spawn_poly(
        &self,
        voice_module: &CompiledModule,
        pool: VoicePool,
    ) -> EngineResult<WorkletPolyNode> {
        self.ensure_registered(voice_module)?;

        let metadata = Arc::clone(pool.voice_metadata());
        let info = NodeInfo {
            id: Uuid::new_v4(),
            name: metadata.name().to_string(),
            num_inputs: pool.num_inputs(),
            num_outputs: pool.num_outputs(),
        };

        let processor = Box::new(WorkletProcessor::poly(pool, self.quantum));
        self.tx
            .send(WorkletCommand::Add {
                id: info.id,
                processor,
            })
            .map_err(|_| EngineError::from(WorkletError::ContextClosed))?;

        Ok(WorkletPolyNode {
            shadow: seed_shadow(&metadata),
            info,
            metadata,
            tx: self.tx.clone(),
            alive: true,
        })
    }

    fn ensure_registered(&self, module: &CompiledModule) -> EngineResult<()> {
        if !self.cache.contains(module.fingerprint()) {
            return Err(EngineError::registration(
                module.fingerprint(),
                "module is not registered with this context",
            ));
        }
        Ok(())
    }
}

impl Drop for WorkletContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// メタデータの初期値からコントロールシャドウを種付けする
fn seed_shadow(metadata: &ModuleMetadata) -> HashMap<u32, f64> {
    metadata
        .controls()
        .iter()
        .map(|c| (c.slot, c.init))
        .collect()
}

/// ワークレットバックエンドのモノノードハンドル
///
/// パラメーター書き込みはシャドウを更新してからコマンドを投げる
/// （応答なし、アドレス単位でlast-writer-wins）。読み出しはシャドウから
/// 答え、リアルタイムコンテキストを横断しない。
pub struct WorkletNode {
    info: NodeInfo,
    metadata: Arc<ModuleMetadata>,
    tx: Sender<WorkletCommand>,
    shadow: HashMap<u32, f64>,
    alive: bool,
}

impl DspNode for WorkletNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        Arc::clone(&self.metadata)
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        worklet_get_param(&self.metadata, &self.shadow, name)
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        if !self.alive {
            return Err(EngineError::NodeNotFound { id: self.info.id });
        }
        let slot = worklet_set_shadow(&self.metadata, &mut self.shadow, name, value)?;
        let _ = self.tx.send(WorkletCommand::SetControl {
            id: self.info.id,
            slot,
            value,
        });
        Ok(())
    }

    fn destroy(&mut self) {
        if self.alive {
            self.alive = false;
            let _ = self.tx.send(WorkletCommand::Remove { id: self.info.id });
        }
    }
}

impl Drop for WorkletNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// ワークレットバックエンドのポリノードハンドル
pub struct WorkletPolyNode {
    info: NodeInfo,
    metadata: Arc<ModuleMetadata>,
    tx: Sender<WorkletCommand>,
    shadow: HashMap<u32, f64>,
    alive: bool,
}

impl DspNode for WorkletPolyNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn metadata(&self) -> Arc<ModuleMetadata> {
        Arc::clone(&self.metadata)
    }

    fn get_param(&self, name: &str) -> EngineResult<f64> {
        worklet_get_param(&self.metadata, &self.shadow, name)
    }

    fn set_param(&mut self, name: &str, value: f64) -> EngineResult<()> {
        if !self.alive {
            return Err(EngineError::NodeNotFound { id: self.info.id });
        }
        let slot = worklet_set_shadow(&self.metadata, &mut self.shadow, name, value)?;
        let _ = self.tx.send(WorkletCommand::SetControl {
            id: self.info.id,
            slot,
            value,
        });
        Ok(())
    }

    fn destroy(&mut self) {
        if self.alive {
            self.alive = false;
            let _ = self.tx.send(WorkletCommand::Remove { id: self.info.id });
        }
    }
}

impl PolyDspNode for WorkletPolyNode {
    fn key_on(&mut self, note: u8, gain: f32) -> EngineResult<()> {
        if !self.alive {
            return Err(EngineError::NodeNotFound { id: self.info.id });
        }
        let _ = self.tx.send(WorkletCommand::KeyOn {
            id: self.info.id,
            note,
            gain,
        });
        Ok(())
    }

    fn key_off(&mut self, note: u8) -> EngineResult<()> {
        if !self.alive {
            return Err(EngineError::NodeNotFound { id: self.info.id });
        }
        let _ = self.tx.send(WorkletCommand::KeyOff {
            id: self.info.id,
            note,
        });
        Ok(())
    }

    fn all_notes_off(&mut self) {
        if self.alive {
            let _ = self.tx.send(WorkletCommand::AllNotesOff { id: self.info.id });
        }
    }

    fn ctrl_change(&mut self, cc: u8, value: f32) {
        if self.alive {
            let _ = self.tx.send(WorkletCommand::CtrlChange {
                id: self.info.id,
                cc,
                value,
            });
        }
    }

    fn pitch_wheel(&mut self, wheel: f32) {
        if self.alive {
            let _ = self.tx.send(WorkletCommand::PitchWheel {
                id: self.info.id,
                wheel,
            });
        }
    }
}

impl Drop for WorkletPolyNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worklet_get_param(
    metadata: &ModuleMetadata,
    shadow: &HashMap<u32, f64>,
    name: &str,
) -> EngineResult<f64> {
    let slot = metadata
        .resolve(name)
        .ok_or_else(|| EngineError::parameter(name, "no such control address"))?;
    Ok(shadow.get(&slot).copied().unwrap_or(0.0))
}

fn worklet_set_shadow(
    metadata: &ModuleMetadata,
    shadow: &mut HashMap<u32, f64>,
    name: &str,
    value: f64,
) -> EngineResult<u32> {
    let slot = metadata
        .resolve(name)
        .ok_or_else(|| EngineError::parameter(name, "no such control address"))?;
    let control = metadata
        .control_at(slot)
        .ok_or_else(|| EngineError::parameter(name, "control descriptor missing"))?;
    let validated = control
        .validate_value(value)
        .map_err(|e| EngineError::parameter(name, e.to_string()))?;
    shadow.insert(slot, validated);
    Ok(slot)
}
