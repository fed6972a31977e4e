use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use practice_realtime::realtime::{Language, ProficiencyLevel};
use practice_realtime::settings::{load_settings, save_settings, settings_path};
use practice_realtime::{Conversation, PracticeSetup, SessionConfig, SessionEvent, TranscriptLog};

#[derive(Parser)]
#[command(name = "practice-realtime")]
#[command(about = "Practice speaking a language with a realtime AI tutor")]
struct Args {
    /// Language to practice (english, spanish, french, vietnamese)
    #[arg(short, long, default_value = "spanish")]
    language: Language,

    /// Learner's native language
    #[arg(long, default_value = "english")]
    native: Language,

    /// Class level (1-2, 3-4, 5-6, 7-8, ap-language, ap-literature)
    #[arg(short = 'c', long, default_value = "3-4")]
    level: ProficiencyLevel,

    /// What the conversation should be about
    #[arg(short, long, required_unless_present = "write_settings")]
    topic: Option<String>,

    /// Text file with a grading rubric
    #[arg(long)]
    rubric: Option<PathBuf>,

    /// Give up after the first failed connection attempt
    #[arg(long)]
    no_retry: bool,

    /// Write the effective settings to the config file and exit
    #[arg(long)]
    write_settings: bool,
}

enum Command {
    ToggleRecording,
    Say(String),
    Quit,
}

impl Command {
    fn parse(line: &str) -> Command {
        match line.trim() {
            "" | "r" => Command::ToggleRecording,
            "q" | "quit" | "exit" => Command::Quit,
            text => Command::Say(text.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = load_settings();

    if args.write_settings {
        save_settings(&settings).context("Failed to write settings")?;
        println!("Settings written to {}", settings_path()?.display());
        return Ok(());
    }
    let topic = args.topic.clone().context("--topic is required")?;

    let rubric = match &args.rubric {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read rubric {:?}", path))?,
        ),
        None => None,
    };

    let setup = PracticeSetup {
        native_language: args.native,
        learning_language: args.language,
        class_level: args.level,
        conversation_prompt: topic,
        rubric,
    };

    let (mut conversation, mut events) =
        Conversation::new(&settings).context("Failed to set up the conversation")?;

    let config = SessionConfig::for_practice(&setup);
    let connected = if args.no_retry {
        conversation.connect(config).await
    } else {
        conversation.connect_with_retry(config).await
    };
    connected.context("Failed to start conversation")?;

    println!("Press Enter to start/stop talking, type a message to send it, q to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut transcript = TranscriptLog::new();
    let mut recording = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };

                match Command::parse(&line) {
                    Command::ToggleRecording if recording => {
                        conversation.stop_capture().await;
                        recording = false;
                        println!("[stopped, waiting for the tutor]");
                    }
                    Command::ToggleRecording => match conversation.start_capture() {
                        Ok(()) => {
                            recording = true;
                            println!("[listening]");
                        }
                        Err(e) => eprintln!("Failed to start recording: {}", e),
                    },
                    Command::Say(text) => {
                        if let Err(e) = conversation.send_text(&text) {
                            eprintln!("Failed to send message: {}", e);
                        }
                    }
                    Command::Quit => break,
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !show_event(event, &setup, &mut transcript) {
                    break;
                }
            }
        }
    }

    conversation.disconnect().await;
    println!("Conversation ended.");
    Ok(())
}

/// Print one session event; returns false once the conversation is over
fn show_event(event: SessionEvent, setup: &PracticeSetup, transcript: &mut TranscriptLog) -> bool {
    match event {
        SessionEvent::Connected => {
            println!("Connected! The tutor will speak in {}.", setup.learning_language);
        }
        SessionEvent::Disconnected => return false,
        SessionEvent::Error(e) => eprintln!("Error: {}", e),
        SessionEvent::AudioReceived(_) => {}
        SessionEvent::Transcript(entry) => {
            let line = transcript.push(entry);
            if line.complete {
                println!("{}: {}", line.speaker.label(), line.text);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_required_unless_writing_settings() {
        assert!(Args::try_parse_from(["practice-realtime"]).is_err());

        let args = Args::try_parse_from(["practice-realtime", "--write-settings"]).unwrap();
        assert!(args.write_settings);
        assert!(args.topic.is_none());

        let args = Args::try_parse_from(["practice-realtime", "-t", "la comida", "-l", "french"])
            .unwrap();
        assert_eq!(args.topic.as_deref(), Some("la comida"));
        assert_eq!(args.language, Language::French);
    }

    #[test]
    fn test_command_parse() {
        assert!(matches!(Command::parse(""), Command::ToggleRecording));
        assert!(matches!(Command::parse(" r "), Command::ToggleRecording));
        assert!(matches!(Command::parse("quit"), Command::Quit));
        assert!(matches!(Command::parse("hola"), Command::Say(text) if text == "hola"));
    }
}
