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

use std::fmt;
use uuid::Uuid;

use crate::metadata::MetadataError;
use crate::module::ModuleError;

/// PerigeeDSP全体のエラー型
#[derive(Debug, Clone)]
pub enum EngineError {
    /// 外部コンパイラーがソースを拒否した
    Compile {
        name: String,
        reason: String,
    },

    /// モジュールのインスタンス化に失敗
    Instantiation {
        module: String,
        reason: String,
    },

    /// 実行コンテキストがプロセッサーコードを拒否した
    Registration {
        fingerprint: String,
        reason: String,
    },

    /// compute中の内部フォールト（そのインスタンスは致命的）
    RuntimeFault {
        node_id: Option<Uuid>,
        reason: String,
    },

    /// パラメーターエラー
    Parameter {
        address: String,
        reason: String,
    },

    /// メタデータドキュメントのエラー
    Metadata {
        reason: String,
    },

    /// ノードが見つからない
    NodeNotFound {
        id: Uuid,
    },

    /// ファイルI/Oエラー
    FileIo {
        operation: String,
        path: String,
        reason: String,
    },

    /// 設定の解析エラー
    ConfigParsing {
        file: String,
        reason: String,
    },

    /// 内部エラー（予期しない状況）
    Internal {
        message: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Compile { name, reason } => {
                write!(f, "Compilation of '{}' failed: {}", name, reason)
            }
            EngineError::Instantiation { module, reason } => {
                write!(f, "Failed to instantiate module '{}': {}", module, reason)
            }
            EngineError::Registration { fingerprint, reason } => {
                write!(f, "Registration rejected for fingerprint {}: {}", fingerprint, reason)
            }
            EngineError::RuntimeFault { node_id, reason } => {
                if let Some(id) = node_id {
                    write!(f, "Runtime fault in node {}: {}", id, reason)
                } else {
                    write!(f, "Runtime fault: {}", reason)
                }
            }
            EngineError::Parameter { address, reason } => {
                write!(f, "Parameter error at '{}': {}", address, reason)
            }
            EngineError::Metadata { reason } => {
                write!(f, "Metadata error: {}", reason)
            }
            EngineError::NodeNotFound { id } => {
                write!(f, "Node not found: {}", id)
            }
            EngineError::FileIo { operation, path, reason } => {
                write!(f, "File I/O error during {}: {} - {}", operation, path, reason)
            }
            EngineError::ConfigParsing { file, reason } => {
                write!(f, "Config parsing error in {}: {}", file, reason)
            }
            EngineError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ModuleError> for EngineError {
    fn from(error: ModuleError) -> Self {
        EngineError::Instantiation {
            module: error.module_name().to_string(),
            reason: error.to_string(),
        }
    }
}

impl From<MetadataError> for EngineError {
    fn from(error: MetadataError) -> Self {
        EngineError::Metadata {
            reason: error.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::FileIo {
            operation: "unknown".to_string(),
            path: "unknown".to_string(),
            reason: error.to_string(),
        }
    }
}

/// 結果型のエイリアス
pub type EngineResult<T> = Result<T, EngineError>;

/// エラーログのレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// ロギングトレイト
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// シンプルなコンソールロガー
pub struct ConsoleLogger {
    min_level: LogLevel,
}

impl ConsoleLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if level >= self.min_level {
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();

            println!(
                "[{:.3}] [{}] {}",
                timestamp.as_secs_f64(),
                level,
                message
            );
        }
    }
}

/// エラーハンドリングのヘルパーマクロ
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $error:expr) => {
        $logger.error(&format!("Error: {}", $error));
    };
    ($logger:expr, $error:expr, $context:expr) => {
        $logger.error(&format!("Error in {}: {}", $context, $error));
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $message:expr) => {
        $logger.info($message);
    };
    ($logger:expr, $format:expr, $($args:expr),*) => {
        $logger.info(&format!($format, $($args),*));
    };
}

/// カスタムエラー作成のヘルパー
impl EngineError {
    pub fn compile(name: &str, reason: impl Into<String>) -> Self {
        EngineError::Compile {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn instantiation(module: &str, reason: impl Into<String>) -> Self {
        EngineError::Instantiation {
            module: module.to_string(),
            reason: reason.into(),
        }
    }

    pub fn registration(fingerprint: &str, reason: impl Into<String>) -> Self {
        EngineError::Registration {
            fingerprint: fingerprint.to_string(),
            reason: reason.into(),
        }
    }

    pub fn runtime_fault(node_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        EngineError::RuntimeFault {
            node_id,
            reason: reason.into(),
        }
    }

    pub fn parameter(address: &str, reason: impl Into<String>) -> Self {
        EngineError::Parameter {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: &str) -> Self {
        EngineError::Internal {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let error = EngineError::runtime_fault(Some(id), "stack overrun");
        assert!(error.to_string().contains(&id.to_string()));
        assert!(error.to_string().contains("stack overrun"));
    }

    #[test]
    fn test_metadata_error_conversion() {
        let meta_error = MetadataError::MissingField {
            field: "numInputs".to_string(),
        };
        let engine_error: EngineError = meta_error.into();

        match engine_error {
            EngineError::Metadata { .. } => (),
            _ => panic!("Expected Metadata error variant"),
        }
    }

    #[test]
    fn test_logger() {
        let logger = ConsoleLogger::new(LogLevel::Warn);

        // These should not output (below min level)
        logger.debug("debug message");
        logger.info("info message");

        // These should output
        logger.warn("warn message");
        logger.error("error message");
    }
}
