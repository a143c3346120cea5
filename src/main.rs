//! LiveVoice demo - talk to Gemini Live through PulseAudio
//!
//! Links, mail and calendar intents are handed to `xdg-open`; everything
//! else is only logged. Ctrl-C ends the session.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use livevoice::audio::pulse::{PulseMicrophone, PulseSpeaker};
use livevoice::gemini::setup_from_env;
use livevoice::tools::{ActionExecutor, ExternalAction, PermissionSet};
use livevoice::{
    EngineConfig, EngineDeps, EngineError, EngineNotice, GeminiBackend, GeminiConfig, SessionSetup,
    VoiceEngine,
};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Opens URLs with the desktop handler and logs everything else.
struct DesktopExecutor;

impl DesktopExecutor {
    async fn xdg_open(&self, target: &str) -> livevoice::Result<()> {
        let status = Command::new("xdg-open")
            .arg(target)
            .status()
            .await
            .map_err(|e| EngineError::ToolExecution(format!("xdg-open: {}", e)))?;
        if !status.success() {
            return Err(EngineError::ToolExecution(format!("xdg-open exited with {}", status)));
        }
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for DesktopExecutor {
    async fn execute(&self, action: ExternalAction) -> livevoice::Result<String> {
        match action {
            ExternalAction::OpenLink { url } => {
                self.xdg_open(&url).await?;
                Ok(format!("Opened {}", url))
            }
            ExternalAction::LaunchApp { app, scheme } => {
                self.xdg_open(&scheme).await?;
                Ok(format!("Opened {}", app))
            }
            ExternalAction::ComposeEmail { to, subject, body } => {
                let mut url = format!("mailto:{}", to);
                let query: Vec<String> = [("subject", subject), ("body", body)]
                    .into_iter()
                    .filter_map(|(key, value)| value.map(|v| format!("{}={}", key, v.replace(' ', "%20"))))
                    .collect();
                if !query.is_empty() {
                    url.push('?');
                    url.push_str(&query.join("&"));
                }
                self.xdg_open(&url).await?;
                Ok(format!("Drafted an email to {}", to))
            }
            ExternalAction::Dial { number } => {
                info!("Would dial {}", number);
                Ok(format!("Calling {}", number))
            }
            ExternalAction::CalendarEvent { title, date, time, .. } => {
                info!("Would create calendar event {:?} on {:?} at {:?}", title, date, time);
                Ok(format!("Created event {}", title))
            }
            ExternalAction::ControlLight {
                brightness,
                color_temperature,
            } => {
                info!("Lights -> {}% {:?}", brightness, color_temperature);
                Ok(format!("Lights are at {}%", brightness))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livevoice");

    let gemini = GeminiConfig::from_env().context("GEMINI_API_KEY is not set")?;
    let setup = setup_from_env(SessionSetup::default());

    let deps = EngineDeps {
        backend: Arc::new(GeminiBackend::new(gemini)),
        microphone: Arc::new(PulseMicrophone::new("livevoice", None)),
        speaker: Arc::new(PulseSpeaker::new("livevoice", None)),
        executor: Arc::new(DesktopExecutor),
        permissions: Arc::new(PermissionSet::new(true)),
    };
    let engine = VoiceEngine::spawn(EngineConfig::default(), deps, setup);
    info!("Announcing {} tools", engine.tools().len());

    let mut notices = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(EngineNotice::StateChanged { from, to }) => info!("{} -> {}", from, to),
                Ok(EngineNotice::TurnCompleted(turn)) => {
                    if !turn.user_text.is_empty() {
                        info!("You: {}", turn.user_text.trim());
                    }
                    if !turn.model_text.is_empty() {
                        info!("Model: {}", turn.model_text.trim());
                    }
                }
                Ok(EngineNotice::ToolHandled { call_id, entry }) => {
                    info!("[{}] {:?}: {}", call_id, entry.status, entry.description)
                }
                Ok(EngineNotice::Error(message)) => error!("{}", message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} notices", n)
                }
                Err(_) => break,
            }
        }
    });

    engine.start().await.context("failed to start session")?;
    info!("Listening. Press Ctrl-C to stop.");

    let mut watch = engine.watch();
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl-C")?,
        ended = watch.wait_for(|s| !s.state.is_active()) => {
            drop(ended);
            warn!("Session ended: {:?}", engine.snapshot().last_error);
        }
    }

    engine.shutdown().await;
    info!("livevoice stopped");
    Ok(())
}
