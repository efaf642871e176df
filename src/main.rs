use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[cfg(feature = "alsa")]
use voice_chat_rs::audio::AlsaOutput;
#[cfg(not(feature = "alsa"))]
use voice_chat_rs::audio::SilentOutput;
use voice_chat_rs::attachment::Attachment;
use voice_chat_rs::audio::{OutputBackend, PlaybackController, PlaybackEvent, PlaybackState};
use voice_chat_rs::config::Config;
use voice_chat_rs::gateway::{GeminiChat, GeminiSpeech};
use voice_chat_rs::message::{Message, Role};
use voice_chat_rs::{SessionEngine, SessionEvent, SessionTexts};

/// One line of console input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Attach(String),
    Detach,
    Autoplay(Option<bool>),
    Play(usize),
    Stop,
    Reset,
    Log,
    Quit,
    Help,
    Say(String),
    Invalid(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match (name, arg) {
        ("attach", "") => Command::Invalid("usage: /attach <path.pdf>".into()),
        ("attach", path) => Command::Attach(path.to_string()),
        ("detach", _) => Command::Detach,
        ("autoplay", "") => Command::Autoplay(None),
        ("autoplay", "on") => Command::Autoplay(Some(true)),
        ("autoplay", "off") => Command::Autoplay(Some(false)),
        ("play", n) => match n.parse() {
            Ok(index) => Command::Play(index),
            Err(_) => Command::Invalid("usage: /play <message number>".into()),
        },
        ("stop", _) => Command::Stop,
        ("reset", _) => Command::Reset,
        ("log", _) => Command::Log,
        ("quit", _) | ("exit", _) => Command::Quit,
        ("help", _) => Command::Help,
        _ => Command::Invalid(format!("unknown command: {}", line)),
    }
}

const HELP: &str = "Commands: /attach <path.pdf>, /detach, /autoplay [on|off], /play <n>, /stop, /reset, /log, /quit";

/// Prints the log as it changes, streaming replies included.
#[derive(Default)]
struct Transcript {
    /// Bytes already printed of the reply being streamed.
    printed: usize,
}

impl Transcript {
    fn show(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::MessageAppended { index, message } => {
                if message.id().is_streaming() {
                    print!("[{}] {}: {}", index, speaker(&message), message.text());
                    self.printed = message.text().len();
                    let _ = std::io::stdout().flush();
                } else {
                    println!("{}", render(index, &message));
                }
            }
            SessionEvent::MessageUpdated { text, .. } => {
                if let Some(tail) = text.get(self.printed..) {
                    print!("{}", tail);
                    let _ = std::io::stdout().flush();
                }
                self.printed = text.len();
            }
            SessionEvent::MessageFinalized { .. } => {
                println!();
                self.printed = 0;
            }
            SessionEvent::MessageDiscarded { index } => {
                println!();
                println!("(reply {} interrupted)", index);
                self.printed = 0;
            }
            SessionEvent::AwaitingReply(true) => println!("..."),
            SessionEvent::AwaitingReply(false) => {}
            SessionEvent::Reset => println!("--- new conversation ---"),
        }
    }
}

fn speaker(message: &Message) -> &'static str {
    match (message.role(), message.is_error()) {
        (Role::User, _) => "You",
        (Role::Model, true) => "Error",
        (Role::Model, false) => "Assistant",
    }
}

fn render(index: usize, message: &Message) -> String {
    let marker = if message.speakable_id().is_some() { " \u{266a}" } else { "" };
    format!("[{}]{} {}: {}", index, marker, speaker(message), message.text())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new()
        .context("Invalid build-time configuration")?
        .with_env_overrides();
    if config.api_key.is_empty() {
        log::warn!("No Gemini API key configured; set GEMINI_API_KEY");
    }

    let chat = Arc::new(GeminiChat::from_config(&config).context("Failed to build chat client")?);
    let speech = Arc::new(GeminiSpeech::from_config(&config).context("Failed to build speech client")?);

    #[cfg(feature = "alsa")]
    let backend: Arc<dyn OutputBackend> = Arc::new(AlsaOutput::new(
        config.playback_device,
        config.playback_period_size,
    ));
    #[cfg(not(feature = "alsa"))]
    let backend: Arc<dyn OutputBackend> = Arc::new(SilentOutput);

    let playback = Arc::new(PlaybackController::new(
        speech,
        backend,
        config.sample_rate,
        config.channels,
    ));
    let mut rx_playback = playback.subscribe();

    let engine = Arc::new(
        SessionEngine::start(chat, playback.clone(), SessionTexts::from_config(&config), config.autoplay)
            .await
            .context("Failed to open chat session")?,
    );
    let mut rx_session = engine.subscribe();

    for (index, message) in engine.messages().iter().enumerate() {
        println!("{}", render(index, message));
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut transcript = Transcript::default();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read input: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parse_command(&line) {
                    Command::Quit => break,
                    Command::Help => println!("{}", HELP),
                    Command::Invalid(reason) => eprintln!("{}", reason),
                    Command::Say(text) => {
                        if engine.is_awaiting_reply() {
                            eprintln!("Still waiting for the previous reply");
                            continue;
                        }
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            let outcome = engine.submit_pending(&text).await;
                            log::debug!("Turn finished: {:?}", outcome);
                        });
                    }
                    Command::Attach(path) => match Attachment::from_path(&path).await {
                        Ok(attachment) => {
                            let name = attachment.name().to_string();
                            if let Some(previous) = engine.attach(attachment) {
                                println!("Replaced {}", previous.name());
                            }
                            println!("Attached {}; it will be sent with your next message", name);
                        }
                        Err(e) => eprintln!("Cannot attach {}: {}", path, e),
                    },
                    Command::Detach => match engine.detach() {
                        Some(attachment) => println!("Removed {}", attachment.name()),
                        None => println!("No file attached"),
                    },
                    Command::Autoplay(value) => {
                        let enabled = value.unwrap_or(!engine.autoplay());
                        engine.set_autoplay(enabled);
                        println!("Autoplay {}", if enabled { "on" } else { "off" });
                    }
                    Command::Play(index) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            match engine.play(index).await {
                                Ok(Some(outcome)) => log::debug!("Playback of [{}]: {:?}", index, outcome),
                                Ok(None) => eprintln!("Message {} cannot be played", index),
                                Err(e) => eprintln!("Playback failed: {}", e),
                            }
                        });
                    }
                    Command::Stop => playback.stop(),
                    Command::Reset => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.reset().await {
                                eprintln!("Reset failed: {}", e);
                            }
                        });
                    }
                    Command::Log => {
                        for (index, message) in engine.messages().iter().enumerate() {
                            println!("{}", render(index, message));
                        }
                        if let Some(name) = engine.pending_attachment() {
                            println!("(attached: {})", name);
                        }
                    }
                }
            }

            Some(event) = rx_session.recv() => {
                let reset = matches!(event, SessionEvent::Reset);
                transcript.show(event);
                if reset {
                    for (index, message) in engine.messages().iter().enumerate() {
                        println!("{}", render(index, message));
                    }
                }
            }

            Some(event) = rx_playback.recv() => {
                match event {
                    PlaybackEvent::StateChanged(PlaybackState::Loading(id)) => println!("(preparing speech for {})", id),
                    PlaybackEvent::StateChanged(PlaybackState::Playing(id)) => println!("(speaking {})", id),
                    PlaybackEvent::StateChanged(PlaybackState::Idle) => {}
                    PlaybackEvent::Failed { id, error } => eprintln!("(could not speak {}: {})", id, error),
                }
            }
        }
    }

    playback.shutdown();
    println!("Bye");
    Ok(())
}
