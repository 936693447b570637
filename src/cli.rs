//! Kaede CLI - manage memories, notes and the conversation buffer
//!
//! Usage:
//!   kaede memory add "content" -t core   Add a memory
//!   kaede memory list                    List memories
//!   kaede memory edit <id>               Edit a memory
//!   kaede memory delete <id>             Delete a memory
//!   kaede note add|list|delete           Manage saved notes
//!   kaede buffer show|clear              Inspect or archive the buffer
//!   kaede history                        Show archived and buffered turns
//!   kaede context "message"              Preview the assembled prompt
//!   kaede chat "message"                 Send one turn, streamed to stdout
//!   kaede probe                          Check the local model endpoint
//!   kaede export / import                Backup and restore
//!   kaede settings show|set              Read or change preferences

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::StreamExt;
use kaede::{
    backup, clean_for_speech, ChatError, ChatRequest, ChatRole, CompletionGateway,
    ContextAssembler, GatewayConfig, Kaede, LocalModelClient, Memory, MemoryType, RoutingMode,
    SavedNote, UpdateMemoryInput, UserTurn,
};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kaede")]
#[command(about = "Kaede - companion backend with tiered memory")]
#[command(version)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, env = "KAEDE_DATA_DIR", default_value = "./kaede_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage memories
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage saved notes
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Inspect or clear the conversation buffer
    Buffer {
        #[command(subcommand)]
        action: BufferAction,
    },

    /// Show conversation history, newest first
    History {
        #[arg(short, long, default_value = "50")]
        limit: i64,

        #[arg(short, long, default_value = "0")]
        offset: i64,
    },

    /// Preview the prompt that would be sent for a message
    Context {
        message: String,

        /// Token budget (defaults to the saved setting)
        #[arg(short, long)]
        max_tokens: Option<i64>,

        /// Attach a file's text
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Send one message and stream the reply
    Chat {
        message: String,

        /// Attach a file's text
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Override the routing mode from settings
        #[arg(short, long, value_enum)]
        mode: Option<CliMode>,

        /// Also print the reply as it would be spoken (on when voice.ttsEnabled is set)
        #[arg(long)]
        speech: bool,

        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[arg(long, env = "KAEDE_COMPLETION_URL", default_value = kaede::gateway::DEFAULT_COMPLETION_URL)]
        endpoint: String,
    },

    /// Check whether the local model endpoint is up
    Probe,

    /// Export memories and notes to a backup file
    Export {
        /// Output file (defaults to kaede-backup-<date>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a backup file
    Import { input: PathBuf },

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Add a new memory
    Add {
        content: String,

        #[arg(short = 't', long = "type", value_enum, default_value = "identity")]
        memory_type: CliMemoryType,

        /// Importance (0-5)
        #[arg(short, long)]
        importance: Option<i64>,
    },

    /// List memories by importance, then recency
    List {
        #[arg(short = 't', long = "type", value_enum)]
        memory_type: Option<CliMemoryType>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Edit a memory
    Edit {
        id: String,

        #[arg(short, long)]
        content: Option<String>,

        #[arg(short = 't', long = "type", value_enum)]
        memory_type: Option<CliMemoryType>,

        #[arg(short, long)]
        importance: Option<i64>,
    },

    /// Delete a memory
    Delete {
        id: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum NoteAction {
    Add { content: String },
    List,
    Delete { id: String },
}

#[derive(Subcommand)]
enum BufferAction {
    Show,
    /// Archive every buffered turn
    Clear,
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    /// Set a key, e.g. `maxTokens 3000` or `voice.ttsEnabled true`
    Set { key: String, value: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMemoryType {
    Core,
    Identity,
    Experience,
}

impl From<CliMemoryType> for MemoryType {
    fn from(cli: CliMemoryType) -> Self {
        match cli {
            CliMemoryType::Core => MemoryType::Core,
            CliMemoryType::Identity => MemoryType::Identity,
            CliMemoryType::Experience => MemoryType::Experience,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMode {
    Cloud,
    Hybrid,
}

impl From<CliMode> for RoutingMode {
    fn from(cli: CliMode) -> Self {
        match cli {
            CliMode::Cloud => RoutingMode::Cloud,
            CliMode::Hybrid => RoutingMode::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("kaede=debug"))
            .with_writer(std::io::stderr)
            .init();
    }

    let kaede = Kaede::new(&cli.data_dir).await?;

    match cli.command {
        Commands::Memory { action } => match action {
            MemoryAction::Add {
                content,
                memory_type,
                importance,
            } => cmd_memory_add(&kaede, content, memory_type, importance).await,
            MemoryAction::List { memory_type, limit } => {
                cmd_memory_list(&kaede, memory_type, limit).await
            }
            MemoryAction::Edit {
                id,
                content,
                memory_type,
                importance,
            } => cmd_memory_edit(&kaede, id, content, memory_type, importance).await,
            MemoryAction::Delete { id, force } => cmd_memory_delete(&kaede, id, force).await,
        },
        Commands::Note { action } => cmd_note(&kaede, action).await,
        Commands::Buffer { action } => cmd_buffer(&kaede, action).await,
        Commands::History { limit, offset } => cmd_history(&kaede, limit, offset).await,
        Commands::Context {
            message,
            max_tokens,
            file,
        } => cmd_context(&kaede, message, max_tokens, file).await,
        Commands::Chat {
            message,
            file,
            mode,
            speech,
            api_key,
            endpoint,
        } => {
            let gateway = GatewayConfig { endpoint, api_key };
            cmd_chat(&kaede, message, file, mode, speech, gateway).await
        }
        Commands::Probe => cmd_probe(&kaede).await,
        Commands::Export { output } => cmd_export(&kaede, output).await,
        Commands::Import { input } => cmd_import(&kaede, input).await,
        Commands::Settings { action } => cmd_settings(&kaede, action),
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn preview(text: &str, width: usize) -> String {
    let mut out: String = text.chars().take(width).collect();
    if text.chars().count() > width {
        out.push('…');
    }
    out.replace('\n', " ")
}

fn read_attachment(file: Option<&Path>) -> anyhow::Result<Option<String>> {
    file.map(std::fs::read_to_string).transpose().map_err(Into::into)
}

async fn cmd_memory_add(
    kaede: &Kaede,
    content: String,
    memory_type: CliMemoryType,
    importance: Option<i64>,
) -> anyhow::Result<()> {
    let mut memory = Memory::new(content, memory_type.into());
    if let Some(importance) = importance {
        memory = memory.with_importance(importance);
    }
    kaede.store().save_memory(&memory).await?;

    println!("{}", "Memory added".green().bold());
    println!("  ID:         {}", memory.id.cyan());
    println!("  Type:       {}", memory.memory_type);
    println!("  Importance: {}", memory.importance);
    Ok(())
}

async fn cmd_memory_list(
    kaede: &Kaede,
    memory_type: Option<CliMemoryType>,
    limit: usize,
) -> anyhow::Result<()> {
    let memories = match memory_type {
        Some(mt) => kaede.store().get_by_type(mt.into(), limit as i64).await?,
        None => kaede.store().list_memories().await?,
    };

    if memories.is_empty() {
        println!("{}", "No memories found".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Showing {} memories:", memories.len().min(limit)).bold()
    );
    println!();

    for memory in memories.iter().take(limit) {
        let tier = match memory.memory_type {
            MemoryType::Core => memory.memory_type.to_string().red(),
            MemoryType::Identity => memory.memory_type.to_string().cyan(),
            MemoryType::Experience => memory.memory_type.to_string().blue(),
        };
        println!(
            "{} {:<10} {} | {}",
            short_id(&memory.id).dimmed(),
            tier,
            "★".repeat(memory.importance.max(0) as usize).yellow(),
            preview(&memory.content, 60)
        );
    }

    Ok(())
}

async fn cmd_memory_edit(
    kaede: &Kaede,
    id: String,
    content: Option<String>,
    memory_type: Option<CliMemoryType>,
    importance: Option<i64>,
) -> anyhow::Result<()> {
    let Some(mut memory) = kaede.store().load_memory(&id).await? else {
        println!("{}", format!("Memory '{}' not found", id).red());
        return Ok(());
    };

    UpdateMemoryInput {
        content,
        memory_type: memory_type.map(Into::into),
        importance,
    }
    .apply(&mut memory);
    kaede.store().update_memory(&memory).await?;

    println!("{}", "Memory updated".green().bold());
    Ok(())
}

async fn cmd_memory_delete(kaede: &Kaede, id: String, force: bool) -> anyhow::Result<()> {
    if !force {
        let Some(memory) = kaede.store().load_memory(&id).await? else {
            println!("{}", format!("Memory '{}' not found", id).red());
            return Ok(());
        };
        println!("About to delete: {}", preview(&memory.content, 50));
        println!("Are you sure? (yes/no)");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "yes" {
            println!("Cancelled");
            return Ok(());
        }
    }

    if kaede.store().delete_memory(&id).await? {
        println!("{}", "Memory deleted".green());
    } else {
        println!("{}", format!("Memory '{}' not found", id).red());
    }
    Ok(())
}

async fn cmd_note(kaede: &Kaede, action: NoteAction) -> anyhow::Result<()> {
    match action {
        NoteAction::Add { content } => {
            let note = SavedNote::new(content, None);
            kaede.store().save_note(&note).await?;
            println!("{} {}", "Note saved".green(), note.id.cyan());
        }
        NoteAction::List => {
            let notes = kaede.store().list_notes().await?;
            if notes.is_empty() {
                println!("{}", "No notes saved".yellow());
            }
            for note in notes {
                println!(
                    "{} {} | {}",
                    short_id(&note.id).dimmed(),
                    note.created_at.format("%Y-%m-%d %H:%M"),
                    preview(&note.content, 60)
                );
            }
        }
        NoteAction::Delete { id } => {
            if kaede.store().delete_note(&id).await? {
                println!("{}", "Note deleted".green());
            } else {
                println!("{}", format!("Note '{}' not found", id).red());
            }
        }
    }
    Ok(())
}

fn print_turn(role: &str, content: &str, at: chrono::DateTime<chrono::Utc>, archived: bool) {
    let label = match role {
        "user" => "Tú   ".green().bold(),
        _ => "Kaede".magenta().bold(),
    };
    let stamp = at.format("%Y-%m-%d %H:%M").to_string().dimmed();
    if archived {
        println!("{} {} {} {}", stamp, label, "(archivado)".dimmed(), content);
    } else {
        println!("{} {} {}", stamp, label, content);
    }
}

async fn cmd_buffer(kaede: &Kaede, action: BufferAction) -> anyhow::Result<()> {
    match action {
        BufferAction::Show => {
            let messages = kaede.store().buffer_messages().await?;
            if messages.is_empty() {
                println!("{}", "Buffer is empty".yellow());
            }
            for message in messages {
                print_turn(message.role.as_str(), &message.content, message.created_at, false);
            }
        }
        BufferAction::Clear => {
            let archived = kaede.store().clear_buffer().await?;
            println!("{}", format!("Archived {} turns", archived).green());
        }
    }
    Ok(())
}

async fn cmd_history(kaede: &Kaede, limit: i64, offset: i64) -> anyhow::Result<()> {
    let messages = kaede.store().history(limit, offset).await?;
    if messages.is_empty() {
        println!("{}", "No history yet".yellow());
    }
    for message in messages {
        print_turn(
            message.role.as_str(),
            &message.content,
            message.created_at,
            !message.is_in_buffer,
        );
    }
    Ok(())
}

async fn cmd_context(
    kaede: &Kaede,
    message: String,
    max_tokens: Option<i64>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let settings = kaede.load_settings();
    let memories = kaede.store().list_memories().await?;
    let buffer = kaede.store().buffer_messages().await?;

    let mut turn = UserTurn::new(message);
    if let Some(attachment) = read_attachment(file.as_deref())? {
        turn = turn.with_attachment(attachment);
    }

    let assembler = ContextAssembler::new(max_tokens.unwrap_or(settings.max_tokens));
    let assembled = assembler.assemble(&memories, &buffer, &turn);

    println!("{}", "Assembled context".bold().underline());
    println!("  Budget:         {}", assembler.max_tokens);
    println!("  System tokens:  {}", assembled.system_tokens);
    println!("  History tokens: {}", assembled.history_tokens);
    println!("  Turns included: {} of {}", assembled.included_turns, buffer.len());
    println!();

    for message in &assembled.messages {
        let role = match message.role {
            ChatRole::System => "system".yellow().bold(),
            ChatRole::User => "user".green().bold(),
            ChatRole::Assistant => "assistant".magenta().bold(),
        };
        println!("[{}]\n{}\n", role, message.content);
    }
    Ok(())
}

async fn cmd_chat(
    kaede: &Kaede,
    message: String,
    file: Option<PathBuf>,
    mode: Option<CliMode>,
    speech: bool,
    gateway: GatewayConfig,
) -> anyhow::Result<()> {
    let settings = kaede.load_settings();
    let speech = speech || settings.voice.tts_enabled;
    let mode = mode.map(RoutingMode::from).unwrap_or(settings.mode);

    let chat = kaede
        .chat_service(Arc::new(CompletionGateway::new(gateway)))
        .with_local_model(Arc::new(LocalModelClient::new(settings.local_model_config())));

    let request = ChatRequest {
        max_tokens: Some(settings.max_tokens),
        temperature: Some(settings.temperature),
        model: Some(settings.cloud_model.clone()),
        file_content: read_attachment(file.as_deref())?,
        mode: Some(mode),
        ..ChatRequest::new(message)
    };

    let mut turn = match chat.start(&request).await {
        Ok(turn) => turn,
        Err(ChatError::Kaede(e)) => return Err(e.into()),
        Err(ChatError::Gateway { apology, .. }) => {
            println!("{}", apology.red());
            return Ok(());
        }
    };

    if turn.prepared.tokens_saved > 0 {
        tracing::info!(tokens_saved = turn.prepared.tokens_saved, "context compressed");
    }

    let mut parser = kaede::DeltaParser::new();
    let mut stdout = std::io::stdout();
    print!("{} ", "Kaede:".magenta().bold());

    while let Some(chunk) = turn.stream.next().await {
        match chunk {
            Ok(bytes) => {
                for fragment in parser.push(&bytes) {
                    print!("{fragment}");
                    stdout.flush()?;
                }
            }
            Err(e) => {
                println!();
                let error = kaede::GatewayError::Transport(e);
                let apology = chat
                    .record_apology(error.public_message(), turn.prepared.local_missing())
                    .await;
                println!("{}", apology.red());
                return Ok(());
            }
        }
    }
    println!();

    let reply = parser.finish();
    if speech {
        let spoken = clean_for_speech(&reply);
        if !spoken.is_empty() {
            println!("{} {}", "🔊".dimmed(), spoken.dimmed());
        }
    }
    chat.record_reply(&reply).await?;
    Ok(())
}

async fn cmd_probe(kaede: &Kaede) -> anyhow::Result<()> {
    let settings = kaede.load_settings();
    let mut config = settings.local_model_config();
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        config.ollama_url = url;
    }
    let client = LocalModelClient::new(config);

    let probe = client.probe().await;
    if probe.available {
        println!("{} {}", "●".green(), probe.message.unwrap_or_default());
    } else {
        println!(
            "{} {}",
            "●".red(),
            probe.error.unwrap_or_else(|| "Ollama no disponible".to_string())
        );
    }

    if client.config().bridge_url.is_some() {
        let ready = client.check_available().await;
        println!("  Bridge: {}", if ready { "ok".green() } else { "unreachable".red() });
    }
    Ok(())
}

async fn cmd_export(kaede: &Kaede, output: Option<PathBuf>) -> anyhow::Result<()> {
    let data = kaede.export_backup().await?;
    let output = output.unwrap_or_else(|| PathBuf::from(backup::todays_file_name()));
    std::fs::write(&output, backup::to_json(&data)?)?;

    println!(
        "{}",
        format!(
            "Exported {} memories and {} notes to {}",
            data.memories.len(),
            data.saved_notes.len(),
            output.display()
        )
        .green()
    );
    Ok(())
}

async fn cmd_import(kaede: &Kaede, input: PathBuf) -> anyhow::Result<()> {
    println!("{}", format!("Importing from {}...", input.display()).bold());
    let raw = std::fs::read_to_string(&input)?;

    let data = match backup::parse_backup(&raw) {
        Ok(data) => data,
        Err(e) => {
            println!("{}", e.to_string().red());
            return Ok(());
        }
    };

    let report = kaede.import_backup(&data).await?;
    println!("{}", report.to_string().green());
    Ok(())
}

fn cmd_settings(kaede: &Kaede, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show => {
            let settings = kaede.load_settings();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsAction::Set { key, value } => {
            let value: Value =
                serde_json::from_str(&value).unwrap_or_else(|_| Value::String(value.clone()));
            let patch = match key.split_once('.') {
                Some((parent, child)) => serde_json::json!({ parent: { child: value } }),
                None => serde_json::json!({ key.as_str(): value }),
            };

            let settings = kaede.load_settings().merged(&patch)?;
            kaede.save_settings(&settings)?;
            println!("{}", format!("Updated {}", key).green());
        }
    }
    Ok(())
}
