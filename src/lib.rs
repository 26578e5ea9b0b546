//! # Libris
//!
//! A hybrid document retrieval pipeline with grounded answer generation.
//!
//! Libris ingests text documents into paired lexical (SQLite FTS5) and
//! vector indices, answers questions by fusing both ranked result lists
//! with Reciprocal Rank Fusion, and generates structured, cited answers
//! that are gated on retrieval quality and model confidence. Untrusted
//! document text passes through a staged sanitizer before it can reach a
//! prompt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Documents │──▶│ Chunk + Embed │──▶│    SQLite      │
//! │  (text)   │   │  (ingest)     │   │ FTS5 + vectors │
//! └──────────┘   └──────────────┘   └───────┬───────┘
//!                                           │
//!                  query ──▶ lexical ╥ vector (parallel)
//!                                    ║
//!                               RRF fusion
//!                                    ║
//!                             retrieval gate
//!                                    ║
//!                        sanitize + format context
//!                                    ║
//!                          generate + confidence gate
//!                                    ║
//!                         answer │ fallback message
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`config_store`] | Live, atomically-swapped RAG tuning parameters |
//! | [`models`] | Core data types |
//! | [`chunker`] | Paragraph-aware text chunking with overlap |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`lexical`] | BM25 search over the FTS5 index |
//! | [`vector`] | Cosine-distance search over stored vectors |
//! | [`fusion`] | Reciprocal Rank Fusion |
//! | [`sanitizer`] | Staged prompt-injection filter |
//! | [`generator`] | Grounded answer generation and validation |
//! | [`pipeline`] | End-to-end query pipeline with both gates |
//! | [`ingest`] | Chunk/embed/dual-write ingestion with retries and DLQ |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunker;
pub mod config;
pub mod config_store;
pub mod db;
pub mod embedding;
pub mod fusion;
pub mod generator;
pub mod ingest;
pub mod lexical;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod sanitizer;
pub mod server;
pub mod vector;
