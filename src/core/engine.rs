/// Engine handle — the narrow interface to the text-generation engine.
///
/// An engine is a single stateful resource: it keeps a context buffer across
/// calls and must be reset before every independent generation. It is never
/// shared between threads; the queue's worker owns it.

use std::ops::ControlFlow;
use thiserror::Error;

use crate::core::config::GenerationParams;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("context overflow: {required} tokens required, {available} available")]
    ContextOverflow { required: usize, available: usize },
    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// One call into the engine: the fully formatted prompt and the markers that
/// end generation.
#[derive(Debug, Clone, Copy)]
pub struct EngineInput<'a> {
    pub prompt: &'a str,
    pub stop: &'a [&'a str],
    pub params: &'a GenerationParams,
}

/// A text-generation engine driven token by token.
///
/// `Send` so it can be moved onto the worker thread. Nothing requires `Sync`:
/// exactly one thread ever touches an engine.
pub trait Engine: Send + 'static {
    /// Clear the context left over from the previous call.
    fn reset(&mut self);

    /// Run `input` to completion, handing every generated piece of text to
    /// `on_token` in order.
    ///
    /// Generation ends at a stop marker, when `params.max_tokens` is spent, or
    /// as soon as `on_token` returns `ControlFlow::Break`.
    fn generate(
        &mut self,
        input: &EngineInput<'_>,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError>;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn reset(&mut self) {
        (**self).reset();
    }

    fn generate(
        &mut self,
        input: &EngineInput<'_>,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        (**self).generate(input, on_token)
    }
}

/// Run a generation to completion and return the raw concatenated output.
pub fn generate_to_string<E: Engine + ?Sized>(
    engine: &mut E,
    input: &EngineInput<'_>,
) -> Result<String, EngineError> {
    let mut raw = String::new();
    engine.generate(input, &mut |token| {
        raw.push_str(token);
        ControlFlow::Continue(())
    })?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        resets: usize,
    }

    impl Engine for Echo {
        fn reset(&mut self) {
            self.resets += 1;
        }

        fn generate(
            &mut self,
            input: &EngineInput<'_>,
            on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
        ) -> Result<(), EngineError> {
            for word in input.prompt.split_inclusive(' ').take(input.params.max_tokens) {
                if on_token(word).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn generate_to_string_concatenates_tokens() {
        let mut engine = Echo { resets: 0 };
        let params = GenerationParams::default();
        let input = EngineInput {
            prompt: "one two three",
            stop: &[],
            params: &params,
        };
        assert_eq!(generate_to_string(&mut engine, &input).unwrap(), "one two three");
    }

    #[test]
    fn boxed_engine_forwards_calls() {
        let mut engine: Box<dyn Engine> = Box::new(Echo { resets: 0 });
        engine.reset();
        let params = GenerationParams {
            max_tokens: 2,
            ..GenerationParams::default()
        };
        let input = EngineInput {
            prompt: "one two three",
            stop: &[],
            params: &params,
        };
        assert_eq!(generate_to_string(&mut engine, &input).unwrap(), "one two ");
    }

    #[test]
    fn error_messages_are_readable() {
        let err = EngineError::ContextOverflow {
            required: 5000,
            available: 4096,
        };
        assert_eq!(
            err.to_string(),
            "context overflow: 5000 tokens required, 4096 available"
        );
    }
}
