//! Call-stack frame walker for Prism.
//!
//! Models activation records on a native stack and computes their callers:
//! - Frame classification (entry, optimized entry, interpreted, compiled, native)
//! - Sender resolution with register-map bookkeeping
//! - Deoptimization original-pc recovery
//! - Continuation return-barrier handling
//! - GC root enumeration for compiled and interpreted frames
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod arch;
pub mod barrier;
pub mod code;
pub mod config;
pub mod continuation;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod register_map;
pub mod runtime;
pub mod stream;
pub mod vmreg;

pub use address::{CodeAddr, CodeRange, StackAddr, WORD_SIZE};
pub use arch::{FrameLayout, PointerAuth};
pub use barrier::{LoadBarrier, Oop, RawAccess, StackWatermark};
pub use code::{BlobKind, CodeBlob, CodeCache, CodeLookup, CompiledMethodInfo, OptimizedEntryInfo};
pub use config::WalkConfig;
pub use continuation::{ContinuationOverlay, NoContinuations};
pub use error::WalkError;
pub use frame::{DeoptState, Frame, FrameKind, OopClosure};
pub use interpreter::{InterpreterOopMask, Method};
pub use register_map::RegisterMap;
pub use runtime::{CallWrapper, FrameAnchor, FrameRuntime, FrameRuntimeBuilder, ManagedThread};
pub use stream::FrameStream;
pub use vmreg::VmReg;
