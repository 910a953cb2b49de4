//! # Resource Advisor Core
//!
//! Runtime-agnostic logic for Resource Advisor: data models, the vector
//! index abstraction, capability and pattern stores, schema flattening and
//! dependency discovery, hierarchy tiers, scoring, and the validation
//! boundary around reasoning-service responses.
//!
//! This crate performs no network or process I/O of its own and does not
//! depend on tokio. Collaborators are reached through the traits
//! [`index::VectorIndex`], [`embedding::EmbeddingProvider`],
//! [`schema::ClusterIntrospection`] and [`reasoning::ReasoningService`].

pub mod dependencies;
pub mod embedding;
pub mod error;
pub mod hierarchy;
pub mod index;
pub mod models;
pub mod reasoning;
pub mod schema;
pub mod scoring;
pub mod stores;
