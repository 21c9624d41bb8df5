/// Village demo — one engine shared by the dialogue box and background game systems.
///
/// A player talks to the blacksmith (streamed, shown word by word) while quest
/// analysis, name generation and reward extraction run as blocking requests on
/// background tasks. All of them go through the same queue, one at a time.
///
/// Run with: cargo run --example village

use llm_request_queue::core::config::QueueConfig;
use llm_request_queue::core::markov::MarkovEngine;
use llm_request_queue::core::queue::{QueueClient, RequestQueue};
use llm_request_queue::core::tasks::TaskPool;
use llm_request_queue::schema::request::PromptRequest;
use std::time::Duration;

const NPC_SYSTEM: &str = "Tu es Gaspard, le forgeron du village. Réponds en une phrase.";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --- Reference engine trained on the bundled dialogue corpus ---
    let corpus = std::fs::read_to_string("tests/fixtures/test_corpus.txt")
        .expect("Failed to read dialogue corpus");
    let engine = MarkovEngine::from_corpus(&corpus, 2, Some(2026))
        .expect("Failed to train dialogue model");

    let mut config = QueueConfig::default();
    config.generation.max_tokens = 40;
    config.worker.thread_name = "village-llm".to_string();
    let queue = RequestQueue::start(engine, config).expect("Failed to start request queue");

    // --- Background systems, each holding its own client ---
    let systems = TaskPool::new("village");

    let quests = queue.client();
    let quest = systems
        .spawn_fallible("quest-analysis", move || {
            analyse_quest(&quests, "Rapporte trois peaux de loup au forgeron.")
        })
        .expect("Failed to spawn quest analysis");

    let names = queue.client();
    let name = systems
        .spawn_fallible("npc-name", move || {
            names.submit_request(
                PromptRequest::new("Invente un nom pour un marchand ambulant.")
                    .with_system("Réponds seulement avec un nom.")
                    .labeled("Generate NPC name"),
            )
        })
        .expect("Failed to spawn name generation");

    let rewards = queue.client();
    let reward = systems
        .spawn_fallible("reward", move || extract_reward(&rewards, "Je te donnerai 50 pièces d'or."))
        .expect("Failed to spawn reward extraction");

    // --- Dialogue: stream the blacksmith's answers like a typewriter ---
    let lines = ["Bonjour", "Avez-vous du travail pour moi ?", "Au revoir"];
    for line in lines {
        println!("Joueur : {}", line);
        println!("  (requests in flight: {})", queue.pending_work_count());

        print!("Gaspard : ");
        let mut shown = 0;
        for chunk in queue.submit_streaming(line, NPC_SYSTEM) {
            match chunk {
                Ok(text) => {
                    if let Some(tail) = text.get(shown..) {
                        print!("{}", tail);
                    }
                    shown = text.len();
                    std::thread::sleep(Duration::from_millis(15));
                }
                Err(e) => {
                    print!("[silence: {}]", e);
                    break;
                }
            }
        }
        println!("\n");
    }

    // --- Collect background results ---
    match quest.join() {
        Ok(summary) => println!("Quest summary: {}", summary),
        Err(e) => println!("Quest analysis failed: {}", e),
    }
    match name.join() {
        Ok(name) => println!("Merchant name: {}", name),
        Err(e) => println!("Name generation failed: {}", e),
    }
    match reward.join() {
        Ok(gold) => println!("Quest reward: {} gold", gold),
        Err(e) => println!("Reward extraction failed: {}", e),
    }

    // Failures above were already reported through their handles.
    for failure in systems.join_all() {
        println!("Unreported background failure in {}: {}", failure.label, failure.message);
    }

    let status = queue.status();
    println!("Queue idle: {} (active {}, queued {})", status.is_idle(), status.active, status.queued);
    queue.shutdown();
}

fn analyse_quest(
    client: &QueueClient,
    quest: &str,
) -> Result<String, llm_request_queue::core::queue::QueueError> {
    client.submit_request(
        PromptRequest::new(format!("Résume cette quête : {}", quest))
            .with_system("Tu analyses des quêtes de jeu de rôle.")
            .labeled("Quest analysis"),
    )
}

/// Ask for the reward and fall back to the first number in the quest text
/// when the engine answers with words.
fn extract_reward(
    client: &QueueClient,
    quest: &str,
) -> Result<u32, llm_request_queue::core::queue::QueueError> {
    let answer = client.submit_request(
        PromptRequest::new(format!("Combien de pièces d'or rapporte : {}", quest))
            .with_system("Réponds seulement avec un nombre.")
            .labeled("Extract reward"),
    )?;
    Ok(first_number(&answer).or_else(|| first_number(quest)).unwrap_or(0))
}

fn first_number(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}
