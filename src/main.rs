//! Bard - 命令行对话入口
//!
//! 运行方式：
//! ```bash
//! cargo run -- elara                      # 与 elara 对话
//! cargo run -- elara --config my.toml     # 额外配置文件
//! BARD__LLM__PROVIDER=deepseek cargo run -- elara
//! ```
//!
//! 对话中可用命令：`/history`、`/clear`、`/set <clé> <valeur>`、`/quit`。
//! `/set` 修改玩家属性（值按 JSON 解析，失败时当作字符串），例如 `/set inventory ["lanterne"]`。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bard::character::{CharacterCatalog, CharacterSource};
use bard::config::load_config;
use bard::core::{format_actions, new_session_id, PlayerData};
use bard::create_orchestrator;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

struct CliArgs {
    character_id: Option<String>,
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        character_id: None,
        config_path: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => parsed.config_path = args.next().map(PathBuf::from),
            _ if parsed.character_id.is_none() => parsed.character_id = Some(arg),
            _ => {}
        }
    }
    parsed
}

/// `clé valeur` → (clé, valeur JSON)
fn parse_attribute(input: &str) -> Option<(String, serde_json::Value)> {
    let (key, raw) = input.trim().split_once(char::is_whitespace)?;
    let raw = raw.trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
    Some((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bard::observability::init();

    let args = parse_args();
    let cfg = load_config(args.config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let catalog = CharacterCatalog::open(cfg.app.data_dir.join("characters"));
    let available = catalog.available_ids();
    let character_id = match args.character_id.or_else(|| available.first().cloned()) {
        Some(id) => id,
        None => anyhow::bail!(
            "no character found in {}",
            cfg.app.data_dir.join("characters").display()
        ),
    };
    let character = catalog
        .load(&character_id)
        .await
        .with_context(|| format!("failed to load character {}", character_id))?;

    let orchestrator = create_orchestrator(&cfg)
        .await
        .context("Failed to create orchestrator")?;

    let cancel = CancellationToken::new();
    let sweeper = Arc::clone(orchestrator.registry()).spawn_sweeper(
        cfg.session.sweep_interval(),
        cfg.session.ttl(),
        cancel.clone(),
    );

    let mut player = PlayerData::new(std::env::var("BARD_PLAYER").unwrap_or_else(|_| "joueur".to_string()));
    let session_id = new_session_id();

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("=== {} ({}) ===\n{}\n\n", character.name, orchestrator.completion_name(), character.description).as_bytes())
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let output = match message {
            "/quit" | "/exit" => break,
            "/history" => match orchestrator
                .history(&session_id, cfg.memory.max_summaries_in_context)
                .await
            {
                Ok(history) => {
                    let mut out = format!(
                        "[{} échanges, {} résumés, {} messages en attente]\n",
                        history.stats.total_turn_count, history.stats.summaries, history.stats.pending_turns
                    );
                    if !history.context.summaries.is_empty() {
                        out.push_str(&history.context.render_summaries());
                        out.push('\n');
                    }
                    out.push_str(&history.context.render_turns(&character.name));
                    out
                }
                Err(e) => format!("[{}] {}", e.kind(), e),
            },
            _ if message.starts_with("/set ") => match parse_attribute(&message["/set ".len()..]) {
                Some((key, value)) => {
                    let shown = format!("[{} = {}]", key, value);
                    player.set_attribute(key, value);
                    shown
                }
                None => "[usage: /set <clé> <valeur>]".to_string(),
            },
            "/clear" => match orchestrator.clear_memory(&session_id, true).await {
                Ok(stats) => format!("[mémoire effacée, {} résumés conservés]", stats.summaries),
                Err(e) => format!("[{}] {}", e.kind(), e),
            },
            _ => match orchestrator
                .process_message(message, &character_id, &player, &session_id)
                .await
            {
                Ok(outcome) => {
                    let mut out = format!("{}: {}", character.name, outcome.response_parsed.text);
                    if outcome.response_parsed.has_actions() {
                        out.push_str(&format!("\n  {}", format_actions(&outcome.response_parsed.actions)));
                    }
                    for refused in &outcome.diagnostics.refused_triggers {
                        out.push_str(&format!("\n  ✗ {} ({})", refused.trigger_id, refused.reason));
                    }
                    for fired in outcome.fired_triggers() {
                        out.push_str(&format!(
                            "\n  ⚡ {} ({:.2}) {}",
                            fired.trigger_id,
                            fired.confidence,
                            serde_json::to_string(&fired.effect)?
                        ));
                    }
                    out
                }
                Err(e) => format!("[{}] {}", e.kind(), e),
            },
        };
        stdout.write_all(format!("{}\n\n", output).as_bytes()).await?;
    }

    cancel.cancel();
    let _ = sweeper.await;
    orchestrator.shutdown().await;
    Ok(())
}
