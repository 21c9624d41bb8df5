pub mod accounting;
pub mod config;
pub mod engine;
pub mod markov;
pub mod prompt;
pub mod queue;
pub mod stream;
pub mod tasks;
