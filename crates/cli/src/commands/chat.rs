use std::io::Write;
use std::sync::Arc;

use negocia_agent::{AgentRuntime, GeminiClient, HttpDebtGateway, RuntimeSettings};
use negocia_core::config::{AppConfig, LoadOptions};
use negocia_core::ContextStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::commands::CommandResult;

const EXIT_COMMANDS: [&str; 2] = ["/sair", "/exit"];
const RESET_COMMAND: &str = "/reset";

pub fn run(user_id: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let gateway = match HttpDebtGateway::new(&config.gateway) {
        Ok(gateway) => gateway,
        Err(error) => {
            return CommandResult::failure("chat", "gateway_init", format!("{error:#}"), 3);
        }
    };
    let llm = match GeminiClient::new(&config.llm) {
        Ok(llm) => llm,
        Err(error) => return CommandResult::failure("chat", "llm_init", format!("{error:#}"), 3),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let agent = AgentRuntime::new(
        Arc::new(ContextStore::new()),
        Arc::new(gateway),
        Arc::new(llm),
        RuntimeSettings::from_config(&config.negotiation),
    );

    let session = runtime.block_on(async {
        let input = BufReader::new(tokio::io::stdin());
        let mut output = std::io::stdout();
        run_session(&agent, user_id, input, &mut output).await
    });

    match session {
        Ok(handled) => {
            CommandResult::success("chat", format!("session ended after {handled} messages"))
        }
        Err(error) => CommandResult::failure("chat", "io", error.to_string(), 4),
    }
}

/// Feeds each non-empty input line to the agent and writes `[state] reply`.
///
/// `/reset` drops the user's context and `/sair` or `/exit` ends the session.
/// Returns the number of messages handled.
pub async fn run_session<R, W>(
    agent: &AgentRuntime,
    user_id: &str,
    input: R,
    output: &mut W,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.contains(&text) {
            break;
        }
        if text == RESET_COMMAND {
            let note = if agent.reset_context(user_id).await {
                "conversa reiniciada"
            } else {
                "nada para reiniciar"
            };
            writeln!(output, "[reset] {note}")?;
            continue;
        }

        let reply = agent.handle_inbound_message(user_id, text).await;
        writeln!(output, "[{}] {}", reply.current_state.as_str(), reply.reply_text)?;
        output.flush()?;
        handled += 1;
    }

    Ok(handled)
}
