/// Dialogue Shell — interactive console for driving the request queue by hand.
///
/// Usage: dialogue_shell (--corpus <file.txt> | --model <model.ron>) [--config <queue.ron>]
///                       [--seed <n>] [--ngram <2|3|4>]
///
/// Commands:
///   say <text>       stream a reply, printing each partial text
///   ask <text>       blocking request, print the cleaned reply
///   system <text>    set the system prompt ('none' to clear)
///   status           show queue counters
///   bulk <n>         fire n concurrent blocking requests from background tasks
///   help             list commands
///   quit             exit

use llm_request_queue::core::config::QueueConfig;
use llm_request_queue::core::markov::{load_model, MarkovEngine, MarkovTrainer};
use llm_request_queue::core::queue::RequestQueue;
use llm_request_queue::core::tasks::TaskPool;
use llm_request_queue::schema::request::PromptRequest;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let mut corpus_path = None;
    let mut model_path = None;
    let mut config_path = None;
    let mut seed = None;
    let mut ngram = 2usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--corpus" if i + 1 < args.len() => {
                i += 1;
                corpus_path = Some(args[i].clone());
            }
            "--model" if i + 1 < args.len() => {
                i += 1;
                model_path = Some(args[i].clone());
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(args[i].clone());
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().ok();
            }
            "--ngram" if i + 1 < args.len() => {
                i += 1;
                ngram = args[i].parse().unwrap_or(2);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(ref path) => match QueueConfig::load_from_ron(Path::new(path)) {
            Ok(config) => {
                println!("Loaded config: {}", path);
                config
            }
            Err(e) => {
                eprintln!("ERROR loading config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => QueueConfig::default(),
    };
    if seed.is_some() {
        config.generation.seed = seed;
    }

    let model = if let Some(ref path) = model_path {
        load_model(Path::new(path))
    } else if let Some(ref path) = corpus_path {
        match std::fs::read_to_string(path) {
            Ok(text) => MarkovTrainer::train(&text, ngram),
            Err(e) => {
                eprintln!("ERROR reading corpus {}: {}", path, e);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("One of --corpus or --model is required.");
        print_usage();
        std::process::exit(1);
    };
    let model = model.unwrap_or_else(|e| {
        eprintln!("ERROR building model: {}", e);
        std::process::exit(1);
    });
    println!("Model: {}-gram, {} prefixes", model.n, model.transitions.len());

    let engine = MarkovEngine::new(model, config.generation.seed);
    let queue = match RequestQueue::start(engine, config) {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("ERROR starting queue: {}", e);
            std::process::exit(1);
        }
    };
    println!("Type 'help' for commands.\n");

    let mut system_prompt = String::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("shell> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
            None => (line.to_lowercase(), ""),
        };

        match cmd.as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => {
                print_help();
            }
            "say" => {
                if rest.is_empty() {
                    println!("Usage: say <text>");
                    continue;
                }
                let mut shown = 0;
                for chunk in queue.submit_streaming(rest, &system_prompt) {
                    match chunk {
                        Ok(text) => {
                            // Chunks are cumulative; print only the new tail.
                            if let Some(tail) = text.get(shown..) {
                                print!("{}", tail);
                                stdout.flush().ok();
                            }
                            shown = text.len();
                        }
                        Err(e) => {
                            println!("\nERROR: {}", e);
                            break;
                        }
                    }
                }
                println!();
            }
            "ask" => {
                if rest.is_empty() {
                    println!("Usage: ask <text>");
                    continue;
                }
                let started = Instant::now();
                match queue.submit_blocking(rest, &system_prompt) {
                    Ok(text) => println!("{}\n({:.0?})", text, started.elapsed()),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "system" => {
                if rest.is_empty() {
                    if system_prompt.is_empty() {
                        println!("System prompt: none");
                    } else {
                        println!("System prompt: {}", system_prompt);
                    }
                    continue;
                }
                if rest == "none" {
                    system_prompt.clear();
                    println!("System prompt cleared.");
                } else {
                    system_prompt = rest.to_string();
                    println!("System prompt set.");
                }
            }
            "status" => {
                let status = queue.status();
                println!(
                    "active: {}  queued: {}  total: {}",
                    status.active,
                    status.queued,
                    status.total()
                );
            }
            "bulk" => {
                let count: usize = match rest.parse() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        println!("Usage: bulk <n>");
                        continue;
                    }
                };

                let pool = TaskPool::new("bulk");
                let started = Instant::now();
                let mut handles = Vec::with_capacity(count);
                for n in 0..count {
                    let client = queue.client();
                    let request = PromptRequest::from_pair(&format!("Requête numéro {}", n), &system_prompt)
                        .labeled(format!("bulk #{}", n));
                    match pool.spawn_fallible(&format!("req{}", n), move || client.submit_request(request)) {
                        Ok(handle) => handles.push(handle),
                        Err(e) => println!("ERROR: {}", e),
                    }
                }
                println!("Submitted {} requests; pending: {}", handles.len(), queue.pending_work_count());

                let mut replies = Vec::new();
                let mut errors = Vec::new();
                for handle in handles {
                    match handle.join() {
                        Ok(text) => replies.push(text),
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                pool.join_all();

                println!(
                    "\n=== Bulk: {} replies, {} failures in {:.0?} ===",
                    replies.len(),
                    errors.len(),
                    started.elapsed()
                );
                for error in &errors {
                    println!("  {}", error);
                }
                let unique: std::collections::HashSet<&String> = replies.iter().collect();
                println!("Unique replies: {} / {}", unique.len(), replies.len());
                if let Some(first) = replies.first() {
                    println!("Sample: {}", first);
                }
                println!();
            }
            _ => {
                println!("Unknown command: '{}'. Type 'help' for available commands.", cmd);
            }
        }
    }

    queue.shutdown();
}

fn print_usage() {
    println!("Dialogue Shell — interactive console for the LLM request queue.");
    println!();
    println!("Usage: dialogue_shell (--corpus <file.txt> | --model <model.ron>) [options]");
    println!();
    println!("  --corpus <path>   Train the reference engine from a text corpus");
    println!("  --model <path>    Load a model saved by corpus_trainer");
    println!("  --config <path>   Queue configuration (RON)");
    println!("  --seed <n>        Fixed sampling seed (default: clock)");
    println!("  --ngram <n>       N-gram depth when training from a corpus (default: 2)");
}

fn print_help() {
    println!("Commands:");
    println!("  say <text>     Stream a reply");
    println!("  ask <text>     Blocking request");
    println!("  system <text>  Set the system prompt ('none' to clear)");
    println!("  status         Show queue counters");
    println!("  bulk <n>       Fire n concurrent blocking requests");
    println!("  help           Show this help");
    println!("  quit           Exit");
}
