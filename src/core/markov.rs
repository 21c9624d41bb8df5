/// Markov chain reference engine — training, serialization, and token-by-token generation.
///
/// Lets the queue run end to end without native model bindings: the engine
/// keeps a context buffer like a real one, honors the token budget and context
/// window, and breaks lines at sentence ends.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::core::config::GenerationParams;
use crate::core::engine::{Engine, EngineError, EngineInput};

#[derive(Debug, Error)]
pub enum MarkovError {
    #[error("no data for generation (model is empty)")]
    NoData,
    #[error("n-gram depth must be 2-4, got {0}")]
    InvalidDepth(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON serialization error: {0}")]
    RonWrite(#[from] ron::Error),
}

/// Special token marking sentence start.
const SENTENCE_START: &str = "<S>";
/// Special token marking sentence end.
const SENTENCE_END: &str = "</S>";

const SENTENCE_ENDERS: &[char] = &['.', '!', '?'];
/// Punctuation tokenized separately and glued to the previous word on output.
const PUNCTUATION: &[char] = &['.', '!', '?', ',', ';', ':'];

/// Below this temperature sampling becomes greedy.
const GREEDY_TEMPERATURE: f32 = 0.05;

type TransitionTable = FxHashMap<Vec<String>, Vec<(String, u32)>>;

/// A trained Markov model storing n-gram counts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarkovModel {
    /// N-gram depth (e.g., 2 for bigrams, 3 for trigrams).
    pub n: usize,
    /// Transition table: n-gram prefix → [(next_token, count)].
    pub transitions: TransitionTable,
}

impl MarkovModel {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    fn start_state(&self) -> Vec<String> {
        vec![SENTENCE_START.to_string(); self.n.saturating_sub(1)]
    }
}

/// Trains Markov models from raw text.
pub struct MarkovTrainer;

impl MarkovTrainer {
    /// Train a model from raw text with the given n-gram depth.
    ///
    /// Each non-empty line is split into sentences; every sentence becomes
    /// one chain from a start marker to an end marker.
    pub fn train(text: &str, n: usize) -> Result<MarkovModel, MarkovError> {
        check_depth(n)?;

        let mut transitions = TransitionTable::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let tokens = tokenize(line);
            for sentence in split_into_sentences(&tokens) {
                let mut padded = vec![SENTENCE_START.to_string(); n - 1];
                padded.extend(sentence);
                padded.push(SENTENCE_END.to_string());

                for window in padded.windows(n) {
                    add_transition(&mut transitions, window[..n - 1].to_vec(), window[n - 1].clone());
                }
            }
        }

        Ok(MarkovModel { n, transitions })
    }
}

fn add_transition(table: &mut TransitionTable, prefix: Vec<String>, next: String) {
    let entries = table.entry(prefix).or_default();
    if let Some(entry) = entries.iter_mut().find(|(tok, _)| tok == &next) {
        entry.1 += 1;
    } else {
        entries.push((next, 1));
    }
}

fn is_punctuation(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if PUNCTUATION.contains(&c))
}

/// Split on whitespace, separating punctuation into its own tokens.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split_whitespace() {
        let mut remaining = word;
        while let Some(first) = remaining.chars().next() {
            if PUNCTUATION.contains(&first) {
                tokens.push(first.to_string());
                remaining = &remaining[first.len_utf8()..];
                continue;
            }
            match remaining.find(|c: char| PUNCTUATION.contains(&c)) {
                Some(pos) => {
                    tokens.push(remaining[..pos].to_string());
                    remaining = &remaining[pos..];
                }
                None => {
                    tokens.push(remaining.to_string());
                    break;
                }
            }
        }
    }
    tokens
}

/// Split a token sequence into sentences at sentence-ending punctuation.
fn split_into_sentences(tokens: &[String]) -> Vec<Vec<String>> {
    let mut sentences = Vec::new();
    let mut current = Vec::new();

    for tok in tokens {
        current.push(tok.clone());
        let ends = tok.chars().count() == 1 && tok.starts_with(SENTENCE_ENDERS);
        if ends {
            sentences.push(std::mem::take(&mut current));
        }
    }

    // Keep trailing tokens without a sentence ender
    if !current.is_empty() {
        sentences.push(current);
    }

    sentences
}

/// Save a MarkovModel to a RON file.
pub fn save_model(model: &MarkovModel, path: &std::path::Path) -> Result<(), MarkovError> {
    let serialized = ron::ser::to_string_pretty(model, ron::ser::PrettyConfig::default())?;
    std::fs::write(path, serialized)?;
    Ok(())
}

/// Load a MarkovModel from a RON file.
pub fn load_model(path: &std::path::Path) -> Result<MarkovModel, MarkovError> {
    let contents = std::fs::read_to_string(path)?;
    let model: MarkovModel = ron::from_str(&contents)?;
    check_depth(model.n)?;
    Ok(model)
}

fn check_depth(n: usize) -> Result<(), MarkovError> {
    if (2..=4).contains(&n) {
        Ok(())
    } else {
        Err(MarkovError::InvalidDepth(n))
    }
}

/// Seed from the clock, truncated to 31 bits.
fn clock_seed() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (millis % (1u128 << 31)) as u64
}

/// An [`Engine`] that samples from a [`MarkovModel`].
///
/// Emits one word or punctuation mark per token (words after the first carry
/// a leading space) and a `"\n"` token at each sentence end.
pub struct MarkovEngine {
    model: MarkovModel,
    rng: StdRng,
    context: Vec<String>,
}

impl MarkovEngine {
    /// Build an engine around a trained model. `None` seeds from the clock.
    pub fn new(model: MarkovModel, seed: Option<u64>) -> Self {
        Self {
            model,
            rng: StdRng::seed_from_u64(seed.unwrap_or_else(clock_seed)),
            context: Vec::new(),
        }
    }

    /// Train on `corpus` and build an engine in one step.
    pub fn from_corpus(corpus: &str, n: usize, seed: Option<u64>) -> Result<Self, MarkovError> {
        Ok(Self::new(MarkovTrainer::train(corpus, n)?, seed))
    }

    pub fn model(&self) -> &MarkovModel {
        &self.model
    }

    /// Tokens currently held in the context buffer.
    pub fn context_len(&self) -> usize {
        self.context.len()
    }

    fn pick_next(
        &mut self,
        state: &[String],
        emitted: &FxHashMap<String, u32>,
        params: &GenerationParams,
    ) -> Option<String> {
        let options = self.model.transitions.get(state)?;
        if options.is_empty() {
            return None;
        }

        let penalty = f64::from(params.repetition_penalty.max(f32::MIN_POSITIVE));
        let score = |(tok, count): &(String, u32)| {
            let seen = emitted.get(tok).copied().unwrap_or(0);
            f64::from(*count) / penalty.powi(seen as i32)
        };

        if params.temperature < GREEDY_TEMPERATURE {
            let mut best = 0;
            let mut best_score = f64::MIN;
            for (i, option) in options.iter().enumerate() {
                let s = score(option);
                if s > best_score {
                    best = i;
                    best_score = s;
                }
            }
            return Some(options[best].0.clone());
        }

        let exponent = 1.0 / f64::from(params.temperature);
        let weights: Vec<f64> = options.iter().map(|o| score(o).powf(exponent)).collect();
        let dist = WeightedIndex::new(&weights).ok()?;
        Some(options[dist.sample(&mut self.rng)].0.clone())
    }
}

impl Engine for MarkovEngine {
    fn reset(&mut self) {
        self.context.clear();
    }

    fn generate(
        &mut self,
        input: &EngineInput<'_>,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let params = input.params;
        if self.model.is_empty() {
            return Err(EngineError::Generation(MarkovError::NoData.to_string()));
        }
        check_depth(self.model.n).map_err(|e| EngineError::Generation(e.to_string()))?;

        self.context.extend(input.prompt.split_whitespace().map(str::to_string));
        let required = self.context.len() + params.max_tokens;
        if required > params.context_size {
            return Err(EngineError::ContextOverflow {
                required,
                available: params.context_size,
            });
        }

        let mut state = self.model.start_state();
        let mut emitted: FxHashMap<String, u32> = FxHashMap::default();
        let mut line_start = true;

        for _ in 0..params.max_tokens {
            let Some(next) = self.pick_next(&state, &emitted, params) else {
                break;
            };

            if next == SENTENCE_END {
                self.context.push("\n".to_string());
                if on_token("\n").is_break() {
                    break;
                }
                state = self.model.start_state();
                line_start = true;
                continue;
            }
            if input.stop.contains(&next.as_str()) {
                break;
            }

            let piece = if line_start || is_punctuation(&next) {
                next.clone()
            } else {
                format!(" {}", next)
            };
            line_start = false;

            *emitted.entry(next.clone()).or_default() += 1;
            self.context.push(next.clone());
            state.push(next);
            state.remove(0);

            if on_token(&piece).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::generate_to_string;

    fn train_test_corpus() -> MarkovModel {
        let corpus = std::fs::read_to_string("tests/fixtures/test_corpus.txt").unwrap();
        MarkovTrainer::train(&corpus, 2).unwrap()
    }

    fn params(max_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_tokens,
            ..GenerationParams::default()
        }
    }

    fn input<'a>(prompt: &'a str, params: &'a GenerationParams) -> EngineInput<'a> {
        EngineInput {
            prompt,
            stop: &[],
            params,
        }
    }

    #[test]
    fn tokenize_basic() {
        let tokens = tokenize("Bonjour, voyageur.");
        assert_eq!(tokens, vec!["Bonjour", ",", "voyageur", "."]);
    }

    #[test]
    fn tokenize_keeps_apostrophes_in_words() {
        let tokens = tokenize("Je n'ai rien ?");
        assert_eq!(tokens, vec!["Je", "n'ai", "rien", "?"]);
    }

    #[test]
    fn train_creates_transitions() {
        let model = train_test_corpus();
        assert_eq!(model.n, 2);
        assert!(!model.is_empty());
        let starts = model.transitions.get(&vec![SENTENCE_START.to_string()]).unwrap();
        assert!(starts.iter().any(|(tok, _)| tok == "Bonjour"));
    }

    #[test]
    fn train_rejects_bad_depth() {
        assert!(matches!(
            MarkovTrainer::train("Bonjour.", 5),
            Err(MarkovError::InvalidDepth(5))
        ));
    }

    #[test]
    fn generate_deterministic_with_seed() {
        let p = params(30);
        let mut engine1 = MarkovEngine::new(train_test_corpus(), Some(42));
        let mut engine2 = MarkovEngine::new(train_test_corpus(), Some(42));
        let a = generate_to_string(&mut engine1, &input("Bonjour", &p)).unwrap();
        let b = generate_to_string(&mut engine2, &input("Bonjour", &p)).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn generate_respects_token_budget() {
        let p = params(5);
        let mut engine = MarkovEngine::new(train_test_corpus(), Some(7));
        let mut calls = 0;
        engine
            .generate(&input("Bonjour", &p), &mut |_| {
                calls += 1;
                ControlFlow::Continue(())
            })
            .unwrap();
        assert!(calls <= 5);
    }

    #[test]
    fn generate_breaks_lines_at_sentence_end() {
        let p = params(200);
        let mut engine = MarkovEngine::new(train_test_corpus(), Some(3));
        let text = generate_to_string(&mut engine, &input("Bonjour", &p)).unwrap();
        assert!(text.contains('\n'), "expected a sentence break in {:?}", text);
        assert!(!text.starts_with(' '));
    }

    #[test]
    fn callback_break_stops_generation() {
        let p = params(200);
        let mut engine = MarkovEngine::new(train_test_corpus(), Some(3));
        let mut tokens = Vec::new();
        engine
            .generate(&input("Bonjour", &p), &mut |t| {
                tokens.push(t.to_string());
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn reset_clears_context() {
        let p = params(10);
        let mut engine = MarkovEngine::new(train_test_corpus(), Some(1));
        generate_to_string(&mut engine, &input("Bonjour voyageur", &p)).unwrap();
        assert!(engine.context_len() >= 2);
        engine.reset();
        assert_eq!(engine.context_len(), 0);
    }

    #[test]
    fn context_overflow_without_reset() {
        let p = GenerationParams {
            max_tokens: 10,
            context_size: 16,
            ..GenerationParams::default()
        };
        let mut engine = MarkovEngine::new(train_test_corpus(), Some(1));
        let prompt = "un deux trois quatre cinq six sept huit neuf dix";
        assert!(matches!(
            generate_to_string(&mut engine, &input(prompt, &p)),
            Err(EngineError::ContextOverflow { available: 16, .. })
        ));
    }

    #[test]
    fn empty_model_is_an_error() {
        let p = params(10);
        let mut engine = MarkovEngine::new(MarkovModel::default(), Some(1));
        assert!(matches!(
            generate_to_string(&mut engine, &input("Bonjour", &p)),
            Err(EngineError::Generation(_))
        ));
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let p = GenerationParams {
            max_tokens: 12,
            temperature: 0.0,
            ..GenerationParams::default()
        };
        let mut engine1 = MarkovEngine::new(train_test_corpus(), Some(1));
        let mut engine2 = MarkovEngine::new(train_test_corpus(), Some(999));
        assert_eq!(
            generate_to_string(&mut engine1, &input("Bonjour", &p)).unwrap(),
            generate_to_string(&mut engine2, &input("Bonjour", &p)).unwrap()
        );
    }

    #[test]
    fn save_and_load_model() {
        let model = train_test_corpus();
        std::fs::create_dir_all("target").unwrap();
        let path = std::path::PathBuf::from("target/test_markov_model.ron");

        save_model(&model, &path).unwrap();
        let loaded = load_model(&path).unwrap();

        assert_eq!(loaded.n, model.n);
        assert_eq!(loaded.transitions.len(), model.transitions.len());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_rejects_bad_depth() {
        let mut model = train_test_corpus();
        model.n = 1;
        std::fs::create_dir_all("target").unwrap();
        let path = std::path::PathBuf::from("target/test_markov_unigram.ron");
        save_model(&model, &path).unwrap();

        let loaded = load_model(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(loaded, Err(MarkovError::InvalidDepth(1))));
    }

    #[test]
    fn engine_with_bad_depth_fails_cleanly() {
        let mut model = train_test_corpus();
        model.n = 1;
        let mut engine = MarkovEngine::new(model, Some(1));
        let p = params(10);
        assert!(matches!(
            generate_to_string(&mut engine, &input("Bonjour", &p)),
            Err(EngineError::Generation(_))
        ));
    }

    #[test]
    fn trigram_model_generates() {
        let corpus = std::fs::read_to_string("tests/fixtures/test_corpus.txt").unwrap();
        let mut engine = MarkovEngine::from_corpus(&corpus, 3, Some(42)).unwrap();
        let p = params(20);
        let text = generate_to_string(&mut engine, &input("Bonjour", &p)).unwrap();
        assert!(!text.is_empty());
    }
}
