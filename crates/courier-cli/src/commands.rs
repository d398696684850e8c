//! Command handlers for the Courier CLI

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use courier_core::{AppEvent, Command, ConnectionStatus, ConversationId, CorrelationId, MessageContent, UserId};

use crate::app::CourierApp;
use crate::cli::{Cli, Commands};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};
use crate::input::{parse_line, InputAction, HELP};
use crate::render::{describe_event, format_snapshot};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliAppConfig) -> Result<()> {
        match cli.command {
            Commands::Chat => Self::handle_chat_command(config).await,
            Commands::Send {
                conversation,
                to,
                message,
            } => Self::handle_send_command(config, conversation, to, message).await,
            Commands::Status => Self::handle_status_command(config).await,
            Commands::Config { output } => {
                match output {
                    Some(path) => {
                        config.save_to_file(&path)?;
                        println!("Wrote configuration to {}", path.display());
                    }
                    None => println!("{}", CliAppConfig::example_config()),
                }
                Ok(())
            }
        }
    }

    /// Interactive mode: typed lines become commands, engine output is printed
    async fn handle_chat_command(config: CliAppConfig) -> Result<()> {
        let prompt = config.cli.prompt.clone();
        let mut app = CourierApp::start(config).await?;
        let mut events = app.take_events()?;
        let self_id = app.self_id().clone();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        println!("Type 'help' for commands.");
        show_prompt(&prompt);
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_line(&line) {
                        Ok(Some(InputAction::Engine(command))) => app.send(command).await?,
                        Ok(Some(InputAction::Status)) => print!("{}", format_snapshot(&app.snapshot())),
                        Ok(Some(InputAction::Help)) => println!("{}", HELP),
                        Ok(Some(InputAction::Quit)) => break,
                        Ok(None) => {}
                        Err(e) => println!("{}", e),
                    }
                    show_prompt(&prompt);
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Engine stopped");
                        break;
                    };
                    if let Some(text) = describe_event(&event, &self_id) {
                        println!("\r{}", text);
                        show_prompt(&prompt);
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        // Keep draining so shutdown never waits on a full event buffer
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        app.stop().await
    }

    /// Send one message and wait until it is confirmed or fails
    async fn handle_send_command(
        config: CliAppConfig,
        conversation: String,
        to: String,
        message: String,
    ) -> Result<()> {
        let mut app = CourierApp::start(config).await?;
        let mut events = app.take_events()?;
        let self_id = app.self_id().clone();
        let conversation_id = ConversationId::new(conversation);

        if app.config().server.token.is_some() {
            app.wait_for("server connection", |s| s.can_send).await?;
        }
        app.send(Command::SendMessage {
            conversation_id: conversation_id.clone(),
            recipient_id: UserId::new(to),
            content: MessageContent::text(message),
            metadata: None,
        })
        .await?;

        let limit = app.wait_limit();
        let outcome = tokio::time::timeout(limit, async {
            let mut correlation: Option<CorrelationId> = None;
            while let Some(event) = events.recv().await {
                match event {
                    AppEvent::MessageUpserted { message }
                        if message.conversation_id == conversation_id
                            && message.is_authored_by(&self_id) =>
                    {
                        if correlation.is_none() {
                            correlation = message.correlation_id.clone();
                        }
                        if message.correlation_id == correlation {
                            if let Some(id) = &message.id {
                                return Ok(id.to_string());
                            }
                        }
                    }
                    AppEvent::SendFailed {
                        correlation_id,
                        reason,
                        ..
                    } if correlation.is_none() || correlation.as_ref() == Some(&correlation_id) => {
                        return Err(CliError::Input(format!("message not sent: {}", reason)));
                    }
                    _ => {}
                }
            }
            Err(CliError::Courier(courier_core::CourierError::channel_error("engine stopped")))
        })
        .await
        .map_err(|_| CliError::Timeout("send confirmation".to_string()));

        let result = match outcome {
            Ok(Ok(id)) => {
                println!("Message sent (ID: {})", id);
                Ok(())
            }
            Ok(Err(e)) | Err(e) => Err(e),
        };
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        app.stop().await?;
        result
    }

    /// Connect, let the resync land and print the status view
    async fn handle_status_command(config: CliAppConfig) -> Result<()> {
        let mut app = CourierApp::start(config).await?;
        let mut events = app.take_events()?;
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        if app.config().server.token.is_some() {
            match app
                .wait_for("server connection", |s| {
                    matches!(s.connection, ConnectionStatus::Connected | ConnectionStatus::Exhausted)
                })
                .await
            {
                Ok(_) => {
                    // Backfill results follow the connection closely
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(e) => warn!("{}", e),
            }
        } else {
            info!("Signed out; showing local state only");
        }

        print!("{}", format_snapshot(&app.snapshot()));
        app.stop().await
    }
}

fn show_prompt(prompt: &str) {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
}
