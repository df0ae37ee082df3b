//! # sluice-ai
//!
//! Embedding-backed question matching for Sluice: embedding providers, the
//! async embedder, question normalization, the vector index and the
//! semantic SQL answer cache.

pub mod semantic;
