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

//! Module C ABI - Symbol binding for shared-library modules
//!
//! A shared-library module exports a fixed set of C symbols; the host binds
//! them once at load time and hands the module a table of imported math
//! helpers at instantiation. A missing symbol, an ABI version mismatch or a
//! rejected instantiation surfaces before any kernel exists.

use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::metadata::SamplePrecision;
use crate::module::api::{
    DspKernel, KernelFactory, MixVoice, MixerKernel, MAX_BLOCK_FRAMES, MAX_MODULE_MEMORY,
    MODULE_ABI_VERSION,
};
use crate::module::{ModuleError, ModuleResult};

/// `module_abi_version`シンボルのシグネチャ
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// `module_memory_size` / `module_static_memory_size`のシグネチャ
pub type MemorySizeFn = unsafe extern "C" fn() -> usize;

/// `module_instantiate`のシグネチャ - 非0はインポート未解決
pub type InstantiateFn = unsafe extern "C" fn(*mut u8, usize, *const HostImports) -> i32;

/// `module_init`のシグネチャ
pub type InitFn = unsafe extern "C" fn(*mut u8, f32);

/// `module_compute`のシグネチャ
///
/// バッファは精度フラグに従ってf32またはf64のプレーナーチャンネル群。
pub type ComputeFn =
    unsafe extern "C" fn(*mut u8, u32, *const *const c_void, *mut *mut c_void) -> i32;

/// `module_get_control`のシグネチャ
pub type GetControlFn = unsafe extern "C" fn(*const u8, u32) -> f64;

/// `module_set_control`のシグネチャ
pub type SetControlFn = unsafe extern "C" fn(*mut u8, u32, f64);

/// `module_mix`のシグネチャ（ミキサーモジュールのみ）
///
/// ミキシングはホストのf32バス上で行う。`voice_buffers`は
/// `[voice][channel]`で平坦化されたポインタ列、`dates`はボイスごとの
/// 取得からの経過フレーム数、`levels`にはボイスごとのピークを書き込む。
pub type MixFn = unsafe extern "C" fn(
    *mut u8,
    u32,
    u32,
    *const *const f32,
    *const f64,
    *mut *mut f32,
    *mut f32,
) -> i32;

/// ホスト側サイン表のエントリ数
pub const SINE_TABLE_SIZE: usize = 4096;

lazy_static::lazy_static! {
    /// モジュールへ貸し出すテーブル化された正弦波（1周期）
    static ref SINE_TABLE: Vec<f64> = (0..SINE_TABLE_SIZE)
        .map(|i| (i as f64 / SINE_TABLE_SIZE as f64 * std::f64::consts::TAU).sin())
        .collect();
}

extern "C" fn host_sin(x: f64) -> f64 {
    x.sin()
}
extern "C" fn host_cos(x: f64) -> f64 {
    x.cos()
}
extern "C" fn host_tan(x: f64) -> f64 {
    x.tan()
}
extern "C" fn host_exp(x: f64) -> f64 {
    x.exp()
}
extern "C" fn host_log(x: f64) -> f64 {
    x.ln()
}
extern "C" fn host_log10(x: f64) -> f64 {
    x.log10()
}
extern "C" fn host_sqrt(x: f64) -> f64 {
    x.sqrt()
}
extern "C" fn host_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}
extern "C" fn host_fmod(x: f64, y: f64) -> f64 {
    x % y
}
extern "C" fn host_remainder(x: f64, y: f64) -> f64 {
    x - y * (x / y).round()
}
extern "C" fn host_atan2(x: f64, y: f64) -> f64 {
    x.atan2(y)
}

/// モジュールが要求するホストインポートの表
///
/// インスタンス化前に全エントリが束縛されるので、モジュール側は欠落を
/// 検出したら非0を返してインスタンス化を拒否できる。
#[repr(C)]
pub struct HostImports {
    pub abi_version: u32,
    pub sin: extern "C" fn(f64) -> f64,
    pub cos: extern "C" fn(f64) -> f64,
    pub tan: extern "C" fn(f64) -> f64,
    pub exp: extern "C" fn(f64) -> f64,
    pub log: extern "C" fn(f64) -> f64,
    pub log10: extern "C" fn(f64) -> f64,
    pub sqrt: extern "C" fn(f64) -> f64,
    pub pow: extern "C" fn(f64, f64) -> f64,
    pub fmod: extern "C" fn(f64, f64) -> f64,
    pub remainder: extern "C" fn(f64, f64) -> f64,
    pub atan2: extern "C" fn(f64, f64) -> f64,
    pub sine_table: *const f64,
    pub sine_table_len: usize,
}

impl HostImports {
    /// 完全に束縛されたインポート表を作る
    pub fn bound() -> Self {
        Self {
            abi_version: MODULE_ABI_VERSION,
            sin: host_sin,
            cos: host_cos,
            tan: host_tan,
            exp: host_exp,
            log: host_log,
            log10: host_log10,
            sqrt: host_sqrt,
            pow: host_pow,
            fmod: host_fmod,
            remainder: host_remainder,
            atan2: host_atan2,
            sine_table: SINE_TABLE.as_ptr(),
            sine_table_len: SINE_TABLE.len(),
        }
    }
}

/// 解決済みエクスポートシンボルの表
///
/// `Symbol`から取り出した生の関数ポインタ。所有する`Library`が生きて
/// いる間だけ有効なので、カーネルは常に`Arc<Library>`を握り続ける。
#[derive(Clone, Copy)]
struct SymbolTable {
    memory_size: MemorySizeFn,
    static_memory_size: MemorySizeFn,
    instantiate: InstantiateFn,
    init: InitFn,
    compute: ComputeFn,
    get_control: GetControlFn,
    set_control: SetControlFn,
    mix: Option<MixFn>,
}

/// 共有ライブラリモジュールのカーネルファクトリー
pub struct SharedLibFactory {
    name: String,
    precision: SamplePrecision,
    num_inputs: usize,
    num_outputs: usize,
    library: Arc<Library>,
    symbols: SymbolTable,
}

impl SharedLibFactory {
    /// ライブラリをロードして全シンボルを検証する
    pub fn load<P: AsRef<Path>>(
        path: P,
        name: &str,
        precision: SamplePrecision,
        num_inputs: usize,
        num_outputs: usize,
    ) -> ModuleResult<Self> {
        let library = unsafe {
            Library::new(path.as_ref()).map_err(|e| ModuleError::LoadError {
                module: name.to_string(),
                reason: format!("Failed to load library: {}", e),
            })?
        };

        let symbols = Self::resolve_symbols(&library, name)?;

        // ABIバージョンと宣言メモリ量はロード時点で検証する
        let abi_version: Symbol<AbiVersionFn> = unsafe {
            library.get(b"module_abi_version").map_err(|e| ModuleError::MissingExport {
                module: name.to_string(),
                symbol: format!("module_abi_version ({})", e),
            })?
        };
        let found = unsafe { abi_version() };
        if found != MODULE_ABI_VERSION {
            return Err(ModuleError::AbiVersionMismatch {
                module: name.to_string(),
                required: MODULE_ABI_VERSION,
                found,
            });
        }

        let declared = unsafe { (symbols.memory_size)() };
        if declared == 0 || declared > MAX_MODULE_MEMORY {
            return Err(ModuleError::ValidationFailed {
                module: name.to_string(),
                reason: format!("declared memory size {} is out of bounds", declared),
            });
        }

        Ok(Self {
            name: name.to_string(),
            precision,
            num_inputs,
            num_outputs,
            library: Arc::new(library),
            symbols,
        })
    }

    fn resolve_symbols(library: &Library, name: &str) -> ModuleResult<SymbolTable> {
        unsafe fn require<T: Copy>(
            library: &Library,
            module: &str,
            symbol: &[u8],
        ) -> ModuleResult<T> {
            let resolved: Symbol<T> = unsafe {
                library.get(symbol).map_err(|_| ModuleError::MissingExport {
                    module: module.to_string(),
                    symbol: String::from_utf8_lossy(symbol).to_string(),
                })?
            };
            Ok(*resolved)
        }

        unsafe {
            let mix = library
                .get::<MixFn>(b"module_mix")
                .ok()
                .map(|symbol| *symbol);

            Ok(SymbolTable {
                memory_size: require(library, name, b"module_memory_size")?,
                static_memory_size: require(library, name, b"module_static_memory_size")?,
                instantiate: require(library, name, b"module_instantiate")?,
                init: require(library, name, b"module_init")?,
                compute: require(library, name, b"module_compute")?,
                get_control: require(library, name, b"module_get_control")?,
                set_control: require(library, name, b"module_set_control")?,
                mix,
            })
        }
    }

    /// 宣言サイズのリニアメモリを確保してインスタンス化する
    fn instantiate_memory(&self) -> ModuleResult<Vec<u8>> {
        let size = unsafe { (self.symbols.memory_size)() };
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| ModuleError::MemoryAllocation {
                module: self.name.clone(),
                requested: size,
            })?;
        memory.resize(size, 0);

        let imports = HostImports::bound();
        let code = unsafe { (self.symbols.instantiate)(memory.as_mut_ptr(), size, &imports) };
        if code != 0 {
            return Err(ModuleError::ImportUnsatisfied {
                module: self.name.clone(),
                code,
            });
        }

        Ok(memory)
    }

    /// 静的データ領域のサイズ（診断用）
    pub fn static_memory_size(&self) -> usize {
        unsafe { (self.symbols.static_memory_size)() }
    }
}

impl KernelFactory for SharedLibFactory {
    fn create_kernel(&self) -> ModuleResult<Box<dyn DspKernel>> {
        let memory = self.instantiate_memory()?;

        let (in_stage, out_stage) = match self.precision {
            SamplePrecision::Single => (Vec::new(), Vec::new()),
            SamplePrecision::Double => (
                vec![vec![0.0f64; MAX_BLOCK_FRAMES]; self.num_inputs],
                vec![vec![0.0f64; MAX_BLOCK_FRAMES]; self.num_outputs],
            ),
        };

        Ok(Box::new(SharedLibKernel {
            module: self.name.clone(),
            _library: Arc::clone(&self.library),
            symbols: self.symbols,
            memory,
            precision: self.precision,
            in_ptrs: Vec::with_capacity(self.num_inputs),
            out_ptrs: Vec::with_capacity(self.num_outputs),
            in_stage,
            out_stage,
        }))
    }

    fn create_mixer(&self) -> ModuleResult<Box<dyn MixerKernel>> {
        let mix = self.symbols.mix.ok_or_else(|| ModuleError::NotAMixer {
            module: self.name.clone(),
        })?;

        let memory = self.instantiate_memory()?;

        Ok(Box::new(SharedLibMixer {
            module: self.name.clone(),
            _library: Arc::clone(&self.library),
            init: self.symbols.init,
            mix,
            memory,
            voice_ptrs: Vec::new(),
            out_ptrs: Vec::with_capacity(self.num_outputs),
            dates: Vec::new(),
        }))
    }
}

/// 共有ライブラリモジュールのDSPカーネル
///
/// リニアメモリとシンボル表を所有する。ポインタスクラッチは自身の
/// バッファしか指さず、呼び出しごとに作り直される。
struct SharedLibKernel {
    module: String,
    _library: Arc<Library>,
    symbols: SymbolTable,
    memory: Vec<u8>,
    precision: SamplePrecision,
    in_ptrs: Vec<*const c_void>,
    out_ptrs: Vec<*mut c_void>,
    in_stage: Vec<Vec<f64>>,
    out_stage: Vec<Vec<f64>>,
}

// メモリとステージングはカーネルが所有し、生ポインタはcompute呼び出しの
// 間しか生存しない。
unsafe impl Send for SharedLibKernel {}

impl DspKernel for SharedLibKernel {
    fn init(&mut self, sample_rate: f32) {
        unsafe { (self.symbols.init)(self.memory.as_mut_ptr(), sample_rate) }
    }

    fn compute(
        &mut self,
        frames: usize,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
    ) -> ModuleResult<()> {
        if frames > MAX_BLOCK_FRAMES {
            return Err(ModuleError::Internal {
                message: format!("block of {} frames exceeds {}", frames, MAX_BLOCK_FRAMES),
            });
        }

        self.in_ptrs.clear();
        self.out_ptrs.clear();

        match self.precision {
            SamplePrecision::Single => {
                for channel in inputs {
                    self.in_ptrs.push(channel.as_ptr() as *const c_void);
                }
                for channel in outputs.iter_mut() {
                    self.out_ptrs.push(channel.as_mut_ptr() as *mut c_void);
                }
            }
            SamplePrecision::Double => {
                for (channel, stage) in inputs.iter().zip(self.in_stage.iter_mut()) {
                    for i in 0..frames {
                        stage[i] = channel[i] as f64;
                    }
                    self.in_ptrs.push(stage.as_ptr() as *const c_void);
                }
                for stage in self.out_stage.iter_mut() {
                    self.out_ptrs.push(stage.as_mut_ptr() as *mut c_void);
                }
            }
        }

        let code = unsafe {
            (self.symbols.compute)(
                self.memory.as_mut_ptr(),
                frames as u32,
                self.in_ptrs.as_ptr(),
                self.out_ptrs.as_mut_ptr(),
            )
        };
        if code != 0 {
            return Err(ModuleError::ComputeFault {
                module: self.module.clone(),
                code,
            });
        }

        if self.precision == SamplePrecision::Double {
            for (stage, channel) in self.out_stage.iter().zip(outputs.iter_mut()) {
                for i in 0..frames {
                    channel[i] = stage[i] as f32;
                }
            }
        }

        Ok(())
    }

    fn get_control(&self, slot: u32) -> f64 {
        unsafe { (self.symbols.get_control)(self.memory.as_ptr(), slot) }
    }

    fn set_control(&mut self, slot: u32, value: f64) {
        unsafe { (self.symbols.set_control)(self.memory.as_mut_ptr(), slot, value) }
    }
}

/// 共有ライブラリモジュールのミキサーカーネル
struct SharedLibMixer {
    module: String,
    _library: Arc<Library>,
    init: InitFn,
    mix: MixFn,
    memory: Vec<u8>,
    voice_ptrs: Vec<*const f32>,
    out_ptrs: Vec<*mut f32>,
    dates: Vec<f64>,
}

// SharedLibKernelと同じ所有権の不変条件
unsafe impl Send for SharedLibMixer {}

impl MixerKernel for SharedLibMixer {
    fn init(&mut self, sample_rate: f32) {
        unsafe { (self.init)(self.memory.as_mut_ptr(), sample_rate) }
    }

    fn mix(
        &mut self,
        frames: usize,
        voices: &[MixVoice<'_>],
        output: &mut [Vec<f32>],
        levels: &mut [f32],
    ) -> ModuleResult<()> {
        self.voice_ptrs.clear();
        self.dates.clear();
        for voice in voices {
            for channel in voice.buffers {
                self.voice_ptrs.push(channel.as_ptr());
            }
            self.dates.push(voice.age_frames as f64);
        }

        self.out_ptrs.clear();
        for channel in output.iter_mut() {
            self.out_ptrs.push(channel.as_mut_ptr());
        }

        let code = unsafe {
            (self.mix)(
                self.memory.as_mut_ptr(),
                voices.len() as u32,
                frames as u32,
                self.voice_ptrs.as_ptr(),
                self.dates.as_ptr(),
                self.out_ptrs.as_mut_ptr(),
                levels.as_mut_ptr(),
            )
        };
        if code != 0 {
            return Err(ModuleError::ComputeFault {
                module: self.module.clone(),
                code,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_table() {
        assert_eq!(SINE_TABLE.len(), SINE_TABLE_SIZE);
        assert!((SINE_TABLE[0]).abs() < 1e-12);
        assert!((SINE_TABLE[SINE_TABLE_SIZE / 4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_host_imports_bound() {
        let imports = HostImports::bound();
        assert_eq!(imports.abi_version, MODULE_ABI_VERSION);
        assert_eq!((imports.pow)(2.0, 10.0), 1024.0);
        assert!(((imports.fmod)(7.5, 2.0) - 1.5).abs() < 1e-12);
        assert!(!imports.sine_table.is_null());
        assert_eq!(imports.sine_table_len, SINE_TABLE_SIZE);
    }

    #[test]
    fn test_load_missing_library() {
        let result = SharedLibFactory::load(
            "/nonexistent/module.so",
            "ghost",
            SamplePrecision::Single,
            1,
            1,
        );
        assert!(matches!(result, Err(ModuleError::LoadError { .. })));
    }
}
