//! Twingraph - cached digital-twin graph mirror with system-graph extraction
//!
//! Mirrors entities and relationships from external graph sources into
//! scoped caches, and answers derived-graph questions over the mirror:
//! bounded system graphs around seed entities, and a type-level meta graph
//! with counts.

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod services;
pub mod source;
pub mod symbols;
