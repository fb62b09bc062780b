//! High-level chat API
//!
//! One-shot questions and the interactive chat loop used by the CLI.

use crate::agent::{AgentResponse, ConversationSession, KnowledgeAgent};
use crate::api::knowledge_base::RetrievedPassage;
use crate::config::{Config, ConversationConfig};
use crate::error::Result;
use crate::utils::{format_file_size, truncate_chars};
use std::io::{self, Write};
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Characters of each passage shown by `search`
const PREVIEW_CHARS: usize = 100;

/// A line typed into the chat loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Quit,
    Help,
    Clear,
    Stats,
    Search(String),
    Ask(String),
    Empty,
}

impl ChatCommand {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return ChatCommand::Empty;
        }
        match input.to_lowercase().as_str() {
            "quit" | "exit" | "q" => return ChatCommand::Quit,
            "help" => return ChatCommand::Help,
            "clear" => return ChatCommand::Clear,
            "stats" => return ChatCommand::Stats,
            _ => {}
        }
        match input.split_once(char::is_whitespace) {
            Some((head, rest)) if head.eq_ignore_ascii_case("search") && !rest.trim().is_empty() => {
                ChatCommand::Search(rest.trim().to_string())
            }
            _ => ChatCommand::Ask(input.to_string()),
        }
    }
}

/// Distinct source filenames, in order of first appearance
pub fn source_list(passages: &[RetrievedPassage]) -> Vec<&str> {
    let mut sources: Vec<&str> = Vec::new();
    for passage in passages {
        if !sources.contains(&passage.filename.as_str()) {
            sources.push(&passage.filename);
        }
    }
    sources
}

/// Answer text followed by its sources, as printed to the terminal
pub fn render_response(response: &AgentResponse) -> String {
    let sources = source_list(&response.passages);
    if sources.is_empty() {
        response.answer.clone()
    } else {
        format!("{}\n\nSources: {}", response.answer, sources.join(", "))
    }
}

/// Ask a single question with no conversation history
pub async fn ask(agent: &KnowledgeAgent, question: &str) -> Result<AgentResponse> {
    let mut session = ConversationSession::default();
    agent.handle_turn(&mut session, question).await
}

/// Build an agent from `config` and answer one question
///
/// Per-turn failures come back as a friendly message; only setup errors
/// are returned as `Err`.
pub async fn quick_ask(config: &Config, question: &str) -> Result<String> {
    let agent = KnowledgeAgent::from_config(config)?;
    match ask(&agent, question).await {
        Ok(response) => Ok(render_response(&response)),
        Err(e) => {
            log::warn!("Question failed: {}", e);
            Ok(e.user_message())
        }
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  search <query> - Show raw search results");
    println!("  stats          - Show knowledge base statistics");
    println!("  clear          - Clear conversation history");
    println!("  help           - Show this help");
    println!("  exit/quit      - End session");
}

fn print_stats(agent: &KnowledgeAgent) {
    match agent.knowledge_base().stats() {
        Ok(stats) => {
            println!("\nKnowledge base:");
            println!("  Documents: {}", stats.document_count);
            println!("  Chunks: {}", stats.chunk_count);
            println!("  Index entries: {} (dimension {})", stats.index_entries, stats.index_dimension);
            println!("  Embedding model: {}", stats.embedding_model);
            println!("  Database size: {}", format_file_size(stats.database_size_bytes));
        }
        Err(e) => println!("Error getting stats: {}", e),
    }
}

async fn print_search(agent: &KnowledgeAgent, query: &str) {
    println!("\nSearching: '{}'", query);
    let start = Instant::now();
    match agent.retriever().search(query).await {
        Ok(passages) if passages.is_empty() => println!("No passages cleared the relevance floor."),
        Ok(passages) => {
            println!(
                "Found {} results in {:.3}s:\n",
                passages.len(),
                start.elapsed().as_secs_f64()
            );
            for (i, passage) in passages.iter().enumerate() {
                println!(
                    "{}. [Score: {:.3}] {}: {}",
                    i + 1,
                    passage.score,
                    passage.filename,
                    truncate_chars(&passage.chunk.text, PREVIEW_CHARS)
                );
            }
        }
        Err(e) => println!("{}", e.user_message()),
    }
}

/// Interactive chat session on stdin/stdout
pub async fn run_chat(agent: &KnowledgeAgent, conversation: ConversationConfig) -> Result<()> {
    let mut session = ConversationSession::new(conversation);

    println!("Interactive Chat Mode");
    println!("   Type 'quit' or 'exit' to end the session");
    println!("   Type 'help' for more commands");
    if let Ok(stats) = agent.knowledge_base().stats() {
        println!(
            "\nKnowledge base loaded: {} documents, {} chunks",
            stats.document_count, stats.chunk_count
        );
    }
    println!("LLM: {}", agent.model().name());
    println!("{}", "-".repeat(50));

    chat_loop(agent, &mut session, BufReader::new(tokio::io::stdin())).await
}

/// Read commands from `input` until it ends or the user quits
pub async fn chat_loop<R>(
    agent: &KnowledgeAgent,
    session: &mut ConversationSession,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        print!("\nYou: ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        match ChatCommand::parse(&line) {
            ChatCommand::Empty => continue,
            ChatCommand::Quit => {
                println!("Goodbye!");
                break;
            }
            ChatCommand::Help => print_help(),
            ChatCommand::Stats => print_stats(agent),
            ChatCommand::Clear => {
                session.clear();
                println!("Conversation history cleared.");
            }
            ChatCommand::Search(query) => print_search(agent, &query).await,
            ChatCommand::Ask(question) => {
                let start = Instant::now();
                match agent.handle_turn(session, &question).await {
                    Ok(response) => {
                        println!("\nAssistant: {}", render_response(&response));
                        println!("[{} | {:.1}s]", response.intent(), start.elapsed().as_secs_f64());
                    }
                    Err(e) => {
                        log::warn!("Turn failed: {}", e);
                        println!("\nAssistant: {}", e.user_message());
                    }
                }
            }
        }
    }

    Ok(())
}
