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

//! Module Loader - Locating and loading compiled modules from disk
//!
//! A compiled module on disk is a shared library next to a `.json` metadata
//! sidecar with the same stem. The loader scans its search directories,
//! validates the pair and produces a `CompiledModule`; identical files load
//! to the same fingerprint and are served from the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::metadata::ModuleMetadata;
use crate::module::abi::SharedLibFactory;
use crate::module::{fingerprint_of, CompiledModule, ModuleError, ModuleResult};

/// プラットフォームごとの共有ライブラリ拡張子
fn library_extension() -> &'static str {
    if cfg!(windows) {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// ディスク上のモジュールローダー
pub struct ModuleLoader {
    search_directories: Vec<PathBuf>,
    loaded: RwLock<HashMap<String, CompiledModule>>,
}

impl ModuleLoader {
    /// デフォルトの検索ディレクトリを持つローダーを作る
    pub fn new() -> Self {
        let mut search_directories = Vec::new();

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                search_directories.push(exe_dir.join("modules"));
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            search_directories.push(home_dir.join(".perigee-dsp").join("modules"));
        }

        #[cfg(unix)]
        search_directories.push(PathBuf::from("/usr/local/share/perigee-dsp/modules"));

        #[cfg(windows)]
        if let Ok(program_files) = std::env::var("PROGRAMFILES") {
            search_directories.push(
                PathBuf::from(program_files)
                    .join("PerigeeDSP")
                    .join("modules"),
            );
        }

        Self {
            search_directories,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// 検索ディレクトリを追加する
    pub fn add_directory<P: AsRef<Path>>(&mut self, path: P) {
        self.search_directories.push(path.as_ref().to_path_buf());
    }

    pub fn search_directories(&self) -> &[PathBuf] {
        &self.search_directories
    }

    /// 全検索ディレクトリからロード可能なモジュールのライブラリパスを集める
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();

        for dir in &self.search_directories {
            if dir.exists() && dir.is_dir() {
                match self.scan_directory(dir) {
                    Ok(mut paths) => found.append(&mut paths),
                    Err(e) => {
                        eprintln!("Warning: Failed to scan module directory {}: {}", dir.display(), e);
                    }
                }
            }
        }

        found
    }

    fn scan_directory(&self, dir: &Path) -> ModuleResult<Vec<PathBuf>> {
        let mut found = Vec::new();

        let entries = std::fs::read_dir(dir).map_err(|e| ModuleError::LoadError {
            module: "unknown".to_string(),
            reason: format!("Failed to read directory {}: {}", dir.display(), e),
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| ModuleError::LoadError {
                module: "unknown".to_string(),
                reason: format!("Failed to read directory entry: {}", e),
            })?;
            let path = entry.path();

            if path.is_dir() {
                if let Ok(mut nested) = self.scan_directory(&path) {
                    found.append(&mut nested);
                }
                continue;
            }

            let is_library = path
                .extension()
                .map(|ext| ext == library_extension())
                .unwrap_or(false);
            if is_library && path.with_extension("json").exists() {
                found.push(path);
            }
        }

        Ok(found)
    }

    /// ライブラリと同名の`.json`サイドカーからモジュールをロードする
    pub fn load<P: AsRef<Path>>(&self, library_path: P) -> ModuleResult<CompiledModule> {
        let library_path = library_path.as_ref();
        let metadata_path = library_path.with_extension("json");
        self.load_with_metadata(library_path, &metadata_path)
    }

    /// 明示的なメタデータパスでモジュールをロードする
    pub fn load_with_metadata(
        &self,
        library_path: &Path,
        metadata_path: &Path,
    ) -> ModuleResult<CompiledModule> {
        let module_name = library_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let metadata_json =
            std::fs::read_to_string(metadata_path).map_err(|e| ModuleError::LoadError {
                module: module_name.clone(),
                reason: format!(
                    "Failed to read metadata sidecar {}: {}",
                    metadata_path.display(),
                    e
                ),
            })?;

        let library_bytes = std::fs::read(library_path).map_err(|e| ModuleError::LoadError {
            module: module_name.clone(),
            reason: format!("Failed to read library {}: {}", library_path.display(), e),
        })?;

        // 同一バイナリ＋同一メタデータはキャッシュから返す
        let fingerprint = fingerprint_of(&library_bytes, &metadata_json);
        {
            let loaded = self.loaded.read().unwrap();
            if let Some(module) = loaded.get(&fingerprint) {
                return Ok(module.clone());
            }
        }

        let metadata = ModuleMetadata::parse(&metadata_json).map_err(|e| {
            ModuleError::ValidationFailed {
                module: module_name.clone(),
                reason: e.to_string(),
            }
        })?;

        let factory = SharedLibFactory::load(
            library_path,
            metadata.name(),
            metadata.precision(),
            metadata.num_inputs(),
            metadata.num_outputs(),
        )?;

        let module = CompiledModule::new(Arc::new(factory), &metadata_json, &library_bytes)?;

        let mut loaded = self.loaded.write().unwrap();
        loaded.insert(fingerprint, module.clone());

        println!("Loaded module: {} ({})", module.name(), library_path.display());
        Ok(module)
    }

    /// キャッシュ済みモジュールの数
    pub fn loaded_count(&self) -> usize {
        self.loaded.read().unwrap().len()
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_loader_creation() {
        let loader = ModuleLoader::new();
        assert!(!loader.search_directories().is_empty());
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        loader.add_directory(temp_dir.path());

        let found = loader.scan_directory(temp_dir.path()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_scan_ignores_library_without_sidecar() {
        let temp_dir = tempdir().unwrap();
        let lib_path = temp_dir.path().join(format!("verb.{}", library_extension()));
        std::fs::write(&lib_path, b"not a real library").unwrap();

        let loader = ModuleLoader::new();
        let found = loader.scan_directory(temp_dir.path()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_load_missing_sidecar() {
        let temp_dir = tempdir().unwrap();
        let lib_path = temp_dir.path().join(format!("verb.{}", library_extension()));
        std::fs::write(&lib_path, b"not a real library").unwrap();

        let loader = ModuleLoader::new();
        let result = loader.load(&lib_path);
        assert!(matches!(result, Err(ModuleError::LoadError { .. })));
    }

    #[test]
    fn test_load_invalid_binary() {
        let temp_dir = tempdir().unwrap();
        let lib_path = temp_dir.path().join(format!("verb.{}", library_extension()));
        std::fs::write(&lib_path, b"not a real library").unwrap();
        std::fs::write(
            temp_dir.path().join("verb.json"),
            r#"{"name": "verb", "numInputs": 2, "numOutputs": 2,
                "compileOptions": "", "ui": []}"#,
        )
        .unwrap();

        let loader = ModuleLoader::new();
        // メタデータは妥当だがバイナリのロードで失敗する
        let result = loader.load(&lib_path);
        assert!(matches!(result, Err(ModuleError::LoadError { .. })));
        assert_eq!(loader.loaded_count(), 0);
    }
}
