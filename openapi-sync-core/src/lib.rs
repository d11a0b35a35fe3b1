#![doc = "openapi-sync-core: core logic library for openapi-sync."]

//! This crate contains the whole document pipeline: the schema document
//! model and its local text edits, alias resolution, the fuzzy patch
//! applier, generated-model post-processing, version tracking, and the
//! orchestrator that runs them in order.
//!
//! # Usage
//! The CLI crate loads a [`config::PipelineConfig`] and hands it to
//! [`synchronise::synchronise`] together with a [`contract::CommandRunner`]
//! and an optional [`contract::ReleaseSource`].

pub mod alias;
pub mod backup;
pub mod config;
pub mod contract;
pub mod document;
pub mod download;
pub mod error;
pub mod git;
pub mod inject;
pub mod patch;
pub mod synchronise;
pub mod version;
