//! Packbench: container packing and measured re-compression sweeps for
//! two-stage IoT compression experiments.
//!
//! The crate provides:
//! - A lossless, self-describing binary container for pre-compressed
//!   messages (`container`)
//! - A uniform adapter contract over second-stage compressors, in-process
//!   and external (`adapter`)
//! - Per-invocation resource sampling (`metrics`)
//! - A per-combination orchestration state machine (`pipeline`)
//! - A cross-product experiment runner with a durable run log (`sweep`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use packbench::adapter::builtin::StoreCompressor;
//! use packbench::adapter::{AdapterConfig, Limits};
//! use packbench::container::Message;
//! use packbench::pipeline::{self, RunState};
//!
//! let messages = vec![
//!     Message::new("a.bin", b"".to_vec()).unwrap(),
//!     Message::new("b.bin", vec![1, 2, 3]).unwrap(),
//! ];
//! let adapter = StoreCompressor::new(&AdapterConfig::new()).unwrap();
//! let outcome = pipeline::run_combination(&messages, &adapter, &Limits::NONE, true);
//! assert_eq!(outcome.state, RunState::Done);
//! ```

pub mod adapter;
pub mod container;
pub mod metrics;
pub mod pipeline;
pub mod sweep;

#[cfg(feature = "cli")]
pub mod cli;
