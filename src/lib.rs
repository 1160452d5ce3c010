pub mod config;
pub mod errors;
pub mod generator;
pub mod instance;
pub mod instantiate;
pub mod metadata;
pub mod module;
pub mod node;
pub mod offline;
pub mod voices;
pub mod worklet;

pub use config::{EngineConfig, VoicePoolConfig};
pub use errors::{ConsoleLogger, EngineError, EngineResult, LogLevel, Logger};
pub use generator::{Backend, BuiltNode, BuiltPolyNode, DspCompiler, NodeGenerator};
pub use instance::RuntimeInstance;
pub use instantiate::{ModuleInstantiator, PolyModuleSet, PolyParts};
pub use metadata::{ControlDescriptor, ModuleMetadata, SamplePrecision};
pub use module::{CompiledModule, ModuleError, ModuleLoader, ModuleResult};
pub use node::{BlockSyncNode, BlockSyncPolyNode, DspNode, NodeInfo, PolyDspNode};
pub use offline::{render, render_with};
pub use voices::{VoicePool, VoiceState, MAX_VOICES};
pub use worklet::{WorkletContext, WorkletError, WorkletNode, WorkletPolyNode};
