#![doc = "deepsea-ai-core: job orchestration library for deepsea-ai."]

//! This crate holds the domain model and pipeline for submitting deep-sea video
//! to cloud inference: configuration and role resolution, input enumeration,
//! job building, the single-job and cluster backends, staging, status polling
//! and the submission orchestrator.
//!
//! Cloud access goes through the traits in [`contract`]; the `deepsea-ai` crate
//! implements them on the AWS SDK.

pub mod backend;
pub mod config;
pub mod contract;
pub mod enumerate;
pub mod error;
pub mod job;
pub mod location;
pub mod orchestrator;
pub mod poll;
pub mod role;
pub mod stage;
pub mod tags;
