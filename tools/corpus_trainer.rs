/// Corpus Trainer — builds the reference engine's Markov model from a text corpus.
///
/// Usage: corpus_trainer --input <file.txt> --output <model.ron> [--ngram <2|3|4>]
use llm_request_queue::core::markov::{save_model, MarkovTrainer};
use std::path::{Path, PathBuf};

struct Options {
    input: PathBuf,
    output: PathBuf,
    ngram: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(message) = run(&options) {
        eprintln!("ERROR: {}", message);
        std::process::exit(1);
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut input = None;
    let mut output = None;
    let mut ngram = 2;

    for pair in args.chunks(2) {
        let [flag, value] = pair else {
            return Err(format!("Missing value for {}", pair[0]));
        };
        match flag.as_str() {
            "--input" => input = Some(PathBuf::from(value)),
            "--output" => output = Some(PathBuf::from(value)),
            "--ngram" => {
                ngram = value
                    .parse()
                    .map_err(|_| format!("--ngram expects 2, 3 or 4, got '{}'", value))?
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(Options {
        input: input.ok_or("--input is required")?,
        output: output.ok_or("--output is required")?,
        ngram,
    })
}

fn run(options: &Options) -> Result<(), String> {
    let text = std::fs::read_to_string(&options.input)
        .map_err(|e| format!("reading {}: {}", options.input.display(), e))?;

    log::info!(
        "training {}-gram model from {}",
        options.ngram,
        options.input.display()
    );
    let model = MarkovTrainer::train(&text, options.ngram).map_err(|e| e.to_string())?;
    if model.is_empty() {
        log::warn!("corpus produced an empty model; the engine will refuse to generate");
    }

    let transitions: usize = model.transitions.values().map(Vec::len).sum();
    println!(
        "Model: {}-gram, {} prefixes, {} transitions",
        model.n,
        model.transitions.len(),
        transitions
    );

    save_model(&model, Path::new(&options.output))
        .map_err(|e| format!("saving {}: {}", options.output.display(), e))?;
    println!("Saved to {}", options.output.display());
    Ok(())
}

fn print_usage() {
    println!("Corpus Trainer — builds a Markov model for the dialogue engine.");
    println!();
    println!("Usage: corpus_trainer --input <file.txt> --output <model.ron> [--ngram <n>]");
    println!();
    println!("  --input <path>   Plain-text corpus, one utterance per line");
    println!("  --output <path>  Where to write the model (RON)");
    println!("  --ngram <n>      N-gram depth, 2 to 4 (default: 2)");
}
