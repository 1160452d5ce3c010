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

//! PerigeeDSP Compiled Module System
//!
//! A compiled module is an opaque DSP program plus its JSON metadata
//! document, produced by an external compiler. This subsystem turns such a
//! module into kernels the engine can schedule:
//!
//! - **Dynamic Loading**: shared-library modules bound over a C ABI
//! - **Native Modules**: first-party modules implemented in Rust via the SDK
//! - **Fingerprinting**: stable SHA-256 identity over binary + metadata
//! - **Validation**: ABI version, exports and memory requirements are
//!   checked before any instance exists

pub mod abi;
pub mod api;
pub mod loader;
pub mod sdk;

pub use abi::{HostImports, SharedLibFactory};
pub use api::{DspKernel, KernelFactory, MixVoice, MixerKernel, MODULE_ABI_VERSION};
pub use loader::ModuleLoader;
pub use sdk::NativeFactory;

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::metadata::{MetadataError, ModuleMetadata};

/// モジュールシステムのエラー型
#[derive(Debug, Clone)]
pub enum ModuleError {
    /// モジュールバイナリの検証に失敗
    ValidationFailed { module: String, reason: String },
    /// ライブラリのロードに失敗
    LoadError { module: String, reason: String },
    /// ABIバージョンの不一致
    AbiVersionMismatch { module: String, required: u32, found: u32 },
    /// 必須エクスポートシンボルの欠落
    MissingExport { module: String, symbol: String },
    /// 宣言サイズのメモリを確保できない
    MemoryAllocation { module: String, requested: usize },
    /// 必須インポートが未解決のままインスタンス化された
    ImportUnsatisfied { module: String, code: i32 },
    /// compute中のフォールト（そのカーネルは致命的）
    ComputeFault { module: String, code: i32 },
    /// ミキサーエントリポイントを持たないモジュール
    NotAMixer { module: String },
    /// 内部エラー
    Internal { message: String },
}

impl ModuleError {
    /// 診断用のモジュール名
    pub fn module_name(&self) -> &str {
        match self {
            ModuleError::ValidationFailed { module, .. }
            | ModuleError::LoadError { module, .. }
            | ModuleError::AbiVersionMismatch { module, .. }
            | ModuleError::MissingExport { module, .. }
            | ModuleError::MemoryAllocation { module, .. }
            | ModuleError::ImportUnsatisfied { module, .. }
            | ModuleError::ComputeFault { module, .. }
            | ModuleError::NotAMixer { module } => module,
            ModuleError::Internal { .. } => "unknown",
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::ValidationFailed { module, reason } => {
                write!(f, "Module '{}' failed validation: {}", module, reason)
            }
            ModuleError::LoadError { module, reason } => {
                write!(f, "Failed to load module '{}': {}", module, reason)
            }
            ModuleError::AbiVersionMismatch { module, required, found } => {
                write!(
                    f,
                    "Module '{}' ABI version mismatch: required {}, found {}",
                    module, required, found
                )
            }
            ModuleError::MissingExport { module, symbol } => {
                write!(f, "Module '{}' is missing export: {}", module, symbol)
            }
            ModuleError::MemoryAllocation { module, requested } => {
                write!(
                    f,
                    "Cannot allocate {} bytes of instance memory for module '{}'",
                    requested, module
                )
            }
            ModuleError::ImportUnsatisfied { module, code } => {
                write!(
                    f,
                    "Module '{}' rejected instantiation (unsatisfied import, code {})",
                    module, code
                )
            }
            ModuleError::ComputeFault { module, code } => {
                write!(f, "Module '{}' compute fault (code {})", module, code)
            }
            ModuleError::NotAMixer { module } => {
                write!(f, "Module '{}' does not export a mix entry point", module)
            }
            ModuleError::Internal { message } => {
                write!(f, "Internal module error: {}", message)
            }
        }
    }
}

impl std::error::Error for ModuleError {}

/// モジュールシステムの結果型
pub type ModuleResult<T> = Result<T, ModuleError>;

/// バイナリ＋メタデータの同一性からコンテンツフィンガープリントを計算
///
/// 同一のモジュールは常に同一のフィンガープリントを持ち、ワークレット
/// バックエンドの登録キャッシュのキーになる。
pub fn fingerprint_of(identity: &[u8], metadata_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity);
    hasher.update(metadata_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// コンパイル済みモジュール
///
/// 外部コンパイラー／ローダーが一度だけ生成する読み取り専用の値。多数の
/// インスタンス化で再利用でき、クローンはファクトリーを共有する。
#[derive(Clone)]
pub struct CompiledModule {
    metadata: Arc<ModuleMetadata>,
    factory: Arc<dyn KernelFactory>,
    fingerprint: String,
}

impl CompiledModule {
    /// ファクトリーとメタデータJSONからモジュールを構築
    ///
    /// `identity`はフィンガープリント計算に使うバイナリ同一性
    /// （共有ライブラリならファイルのバイト列、ネイティブならモジュール名）。
    pub fn new(
        factory: Arc<dyn KernelFactory>,
        metadata_json: &str,
        identity: &[u8],
    ) -> ModuleResult<Self> {
        let metadata = ModuleMetadata::parse(metadata_json).map_err(|e: MetadataError| {
            ModuleError::ValidationFailed {
                module: "unknown".to_string(),
                reason: e.to_string(),
            }
        })?;

        let fingerprint = fingerprint_of(identity, metadata_json);

        Ok(Self {
            metadata: Arc::new(metadata),
            factory,
            fingerprint,
        })
    }

    pub fn metadata(&self) -> &Arc<ModuleMetadata> {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn factory(&self) -> &Arc<dyn KernelFactory> {
        &self.factory
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.metadata.name())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stability() {
        let a = fingerprint_of(b"binary", "{}");
        let b = fingerprint_of(b"binary", "{}");
        let c = fingerprint_of(b"binary2", "{}");
        let d = fingerprint_of(b"binary", "{\"x\":1}");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_compiled_module_identity() {
        let module = sdk::sine_voice_module().unwrap();
        let again = sdk::sine_voice_module().unwrap();

        assert_eq!(module.fingerprint(), again.fingerprint());
        assert_eq!(module.name(), "sine_voice");
        assert_eq!(module.metadata().num_outputs(), 1);
    }

    #[test]
    fn test_module_error_display() {
        let error = ModuleError::MissingExport {
            module: "verb".to_string(),
            symbol: "module_compute".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Module 'verb' is missing export: module_compute"
        );
        assert_eq!(error.module_name(), "verb");
    }
}
