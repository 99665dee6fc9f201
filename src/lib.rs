//! # creation
//!
//! A build-time bytecode weaver. It scans an Android application's compiled
//! classes and archives, registers classes marked as module entries, splices
//! lifecycle dispatch into the class marked as the application host, and
//! synthesizes a provider class that lists every module by priority.
//!
//! ## Architecture
//!
//! - **classfile**: Class file codec (constant pool, attributes, code, stack map frames)
//! - **weave**: Per-class analysis and rewriting of module and host types
//! - **registry**: Thread-safe, deterministic collection of module entries
//! - **provider**: Synthesis of the module list provider class
//! - **pipeline**: Clean, scan and synthesize phases of one invocation
//! - **worker**: Bounded pool plus completion barrier for phase tasks
//! - **archive**: Deterministic jar rewriting
//! - **scan**: Directory enumeration and the per-entry transform
//! - **invocation**: Inputs, incremental status and output locations
//! - **state**: Registry entries persisted between incremental builds (heed)
//! - **config**: Weaver configuration
//! - **logging**: tracing subscriber setup

pub mod archive;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod scan;
pub mod state;
pub mod weave;
pub mod worker;
