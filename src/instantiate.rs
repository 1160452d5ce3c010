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

//! Module Instantiator - From compiled modules to runtime instances
//!
//! Mono instantiation produces one bound `RuntimeInstance`; poly
//! instantiation produces N voice instances, a mixer kernel and optionally
//! an effect instance. Every failure leaves nothing behind: a partially
//! built voice set is dropped wholesale.

use std::sync::Arc;

use crate::errors::{EngineError, EngineResult};
use crate::instance::RuntimeInstance;
use crate::metadata::ModuleMetadata;
use crate::module::{CompiledModule, MixerKernel};
use crate::voices::MAX_VOICES;

/// ポリフォニックノードを構成するモジュールの組
#[derive(Clone)]
pub struct PolyModuleSet {
    /// ボイスごとにインスタンス化されるモジュール
    pub voice: CompiledModule,
    /// 全ボイスを合算するミキサーモジュール
    pub mixer: CompiledModule,
    /// ミックス後に通すエフェクトモジュール（任意）
    pub effect: Option<CompiledModule>,
}

/// インスタンス化されたポリフォニック一式
pub struct PolyParts {
    pub voices: Vec<RuntimeInstance>,
    pub mixer: Box<dyn MixerKernel>,
    pub effect: Option<RuntimeInstance>,
    pub voice_metadata: Arc<ModuleMetadata>,
}

/// モジュールインスタンシエーター
pub struct ModuleInstantiator {
    sample_rate: f32,
}

impl ModuleInstantiator {
    pub fn new(sample_rate: f32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// モノモジュールを1インスタンスに束縛する
    pub fn instantiate(&self, module: &CompiledModule) -> EngineResult<RuntimeInstance> {
        let kernel = module.factory().create_kernel()?;
        let mut instance =
            RuntimeInstance::new(kernel, Arc::clone(module.metadata()), self.sample_rate);
        instance.init(self.sample_rate);
        Ok(instance)
    }

    /// ボイス＋ミキサー＋（任意の）エフェクトをポリ一式に束縛する
    pub fn instantiate_poly(
        &self,
        set: &PolyModuleSet,
        num_voices: usize,
    ) -> EngineResult<PolyParts> {
        if num_voices == 0 || num_voices > MAX_VOICES {
            return Err(EngineError::instantiation(
                set.voice.name(),
                format!("voice count {} outside 1..={}", num_voices, MAX_VOICES),
            ));
        }

        let voice_metadata = Arc::clone(set.voice.metadata());
        if voice_metadata.num_outputs() == 0 {
            return Err(EngineError::instantiation(
                set.voice.name(),
                "voice module declares no outputs",
            ));
        }
        if voice_metadata.resolve_by_suffix("gate").is_none() {
            return Err(EngineError::instantiation(
                set.voice.name(),
                "voice module has no 'gate' control",
            ));
        }

        let mut voices = Vec::with_capacity(num_voices);
        for _ in 0..num_voices {
            voices.push(self.instantiate(&set.voice)?);
        }

        let mut mixer = set.mixer.factory().create_mixer()?;
        mixer.init(self.sample_rate);

        let effect = match &set.effect {
            Some(module) => {
                let instance = self.instantiate(module)?;
                if instance.num_inputs() != voice_metadata.num_outputs() {
                    return Err(EngineError::instantiation(
                        module.name(),
                        format!(
                            "effect inputs {} do not match voice outputs {}",
                            instance.num_inputs(),
                            voice_metadata.num_outputs()
                        ),
                    ));
                }
                Some(instance)
            }
            None => None,
        };

        Ok(PolyParts {
            voices,
            mixer,
            effect,
            voice_metadata,
        })
    }
}
