//! `intellindex-memory` – The memory tiers.
//!
//! Everything the Intelligent Index remembers between workflow runs lives
//! behind the modules of this crate, on a local SQLite substrate.
//!
//! # Modules
//!
//! - [`store`] – [`KeyedStore`][store::KeyedStore]: namespaced key/value
//!   storage with similarity search, implemented by
//!   [`SqliteStore`][store::SqliteStore].
//! - [`instructions`] – [`InstructionStore`][instructions::InstructionStore]:
//!   the per-namespace system instructions, created lazily with a default.
//! - [`stm`] – [`StmConsolidator`][stm::StmConsolidator]: keeps the
//!   per-namespace short-term report bounded by rolling dated buckets up from
//!   day to year and promoting recurring patterns.
//! - [`episodic`] – [`EpisodicMemory`][episodic::EpisodicMemory]: append-only
//!   log of feedback-driven runs, retrieved by similarity to condition future
//!   generations.
//! - [`archive`] – [`LongTermArchive`][archive::LongTermArchive]: searchable
//!   store of every finalized report.
//! - [`checkpoint`] – [`CheckpointStore`][checkpoint::CheckpointStore]:
//!   durable storage for runs suspended at human review.

pub mod archive;
pub mod checkpoint;
pub mod episodic;
pub mod instructions;
pub mod stm;
pub mod store;
