//! pwc-graph: Papers with Code dump loading and Neo4j graph synchronization
//!
//! This crate loads the Papers with Code JSON dumps (papers, code links,
//! evaluation tables, datasets) into a Neo4j property graph that may be shared
//! with unrelated applications, and compares two graph instances:
//!
//! 1. **Parsing** -- Stream each dump file, gzip/bzip2 or plain, in either a
//!    single top-level array or one object per line, without loading it whole
//! 2. **Normalization** -- Turn each raw record into a validated entity; bad
//!    records are rejected and counted, never fatal
//! 3. **Sync** -- Merge entities by key in bounded, partitioned batches, clear
//!    only this pipeline's data, or drop everything behind a typed confirmation
//! 4. **Diff** -- Compare counts and sampled nodes of two stores, either in full
//!    or restricted to the managed types
//!
//! # Managed Data
//!
//! Every label, relationship type and index this pipeline writes is listed in
//! [`registry`]. Selective clearing and the managed-only diff read the same
//! tables, so the two can never disagree on what belongs to the pipeline.
//!
//! - Nodes: `Paper`, `Repository`, `Dataset`, `Task`, `Author`
//! - Relationships: `AUTHORED`, `HAS_CODE`, `USES_DATASET`, `ADDRESSES_TASK`
//!
//! # Key Modules
//!
//! - [`parser`] -- Format-tolerant streaming JSON reader
//! - [`normalize`] -- Field mapping, URL normalization and framework detection
//! - [`registry`] -- Managed node types, relationship types and indexes
//! - [`sync`] -- Ingestion, selective clear and confirmed full drop
//! - [`batch`] -- Partitioned batch writers with retry
//! - [`confirm`] -- The interactive full-drop gate
//! - [`diff`] -- Store comparison and report
//! - [`store`] -- Graph store interface, Neo4j and in-memory implementations
//! - [`environments`] -- Named connection settings from a TOML file
//! - [`inspect`] -- Layout and field survey of a dump directory
//! - [`stats`] -- Atomic counters for sources and write targets
//! - [`config`] -- Defaults and tuning constants
//!
//! # Example Usage
//!
//! ```bash
//! # Load the first 1000 papers of a dump into a local instance
//! pwc-graph -v ingest --data-dir dumps/ --env local --papers 1000
//!
//! # Replace this pipeline's data, leaving everything else in place
//! pwc-graph ingest --data-dir dumps/ --env local --clear
//!
//! # Verify a migration, ignoring co-resident application data
//! pwc-graph diff --source-env local --target-env remote --scope managed-only
//! ```

pub mod batch;
pub mod config;
pub mod confirm;
pub mod diff;
pub mod environments;
pub mod error;
pub mod inspect;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod registry;
pub mod stats;
pub mod store;
pub mod sync;
