//! Natural-language query engine
//!
//! A question goes through the translator (language model → structured
//! candidate), the validator (ordered rule chain plus allowlist
//! serializer) and the hybrid executor (exact PostgreSQL query with
//! embedding nearest-neighbour fallback).

pub mod candidate;
pub mod catalog;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod execution;
pub mod llm;
pub mod pipeline;
pub mod sql_compiler;
pub mod translator;
pub mod validation;

pub use error::{NlqError, RejectReason, Rejection, Result};
pub use pipeline::{QueryOutcome, QueryPipeline};
