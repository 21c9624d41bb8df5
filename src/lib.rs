//! LLM request queue — serialized access to one stateful text-generation engine.
//!
//! A game talks to its language model from many threads at once: the main
//! loop streams NPC dialogue while background tasks analyse conversations,
//! invent names and extract rewards. The engine itself can only serve one
//! call at a time and must be reset between calls. This crate puts a single
//! worker thread in front of it, fed by a FIFO queue, and hands each caller
//! either a blocking answer or a stream of growing partial texts.

pub mod core;
pub mod schema;
