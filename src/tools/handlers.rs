//! Built-in tool handlers
//!
//! Each handler destructures its arguments into a typed struct, checks the
//! capability it needs, and delegates the side effect to the
//! [`ActionExecutor`].

use crate::error::{EngineError, Result};
use crate::tools::actions::{ActionExecutor, ExternalAction, PermissionStore};
use crate::tools::schema::{ParamType, ToolDeclaration};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Denied,
    Failed,
    Unknown,
}

/// Result text for the model plus a line for the recent-actions log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub status: ActionStatus,
    pub result: String,
    pub log: String,
}

impl ToolOutcome {
    pub fn completed(result: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Completed,
            result: result.into(),
            log: log.into(),
        }
    }

    /// Capability switched off: nothing was executed.
    pub fn denied(tool: &str, label: &str) -> Self {
        Self {
            status: ActionStatus::Denied,
            result: format!(
                "Permission to use {} is turned off. Ask the user to enable it in settings.",
                label
            ),
            log: format!("Blocked {}: {} permission disabled", tool, label),
        }
    }
}

/// What a handler may touch while running.
pub struct ToolContext<'a> {
    pub executor: &'a dyn ActionExecutor,
    pub permissions: &'a dyn PermissionStore,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> ToolDeclaration;

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome>;
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| EngineError::ToolExecution(format!("invalid arguments for {}: {}", tool, e)))
}

pub fn builtin_handlers() -> Vec<Arc<dyn ToolHandler>> {
    vec![
        Arc::new(OpenWebsite),
        Arc::new(MakePhoneCall),
        Arc::new(LaunchApp),
        Arc::new(CreateCalendarEvent),
        Arc::new(ComposeEmail),
        Arc::new(ControlLight),
    ]
}

pub struct OpenWebsite;

#[derive(Deserialize)]
struct OpenWebsiteArgs {
    url: String,
}

#[async_trait]
impl ToolHandler for OpenWebsite {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("openWebsite", "Open a web page in the browser.")
            .required("url", ParamType::String, "Address of the page to open")
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: OpenWebsiteArgs = parse_args("openWebsite", args)?;
        let url = if args.url.starts_with("http://") || args.url.starts_with("https://") {
            args.url
        } else {
            format!("https://{}", args.url.trim_start_matches('/'))
        };
        let result = ctx
            .executor
            .execute(ExternalAction::OpenLink { url: url.clone() })
            .await?;
        Ok(ToolOutcome::completed(result, format!("Opened {}", url)))
    }
}

pub struct MakePhoneCall;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MakePhoneCallArgs {
    phone_number: String,
}

#[async_trait]
impl ToolHandler for MakePhoneCall {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("makePhoneCall", "Start a phone call to a number.")
            .required("phoneNumber", ParamType::String, "Number to dial")
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: MakePhoneCallArgs = parse_args("makePhoneCall", args)?;
        if !ctx.permissions.is_allowed("phone") {
            return Ok(ToolOutcome::denied("makePhoneCall", "Phone"));
        }
        let number: String = args
            .phone_number
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        if number.is_empty() {
            return Err(EngineError::ToolExecution(format!(
                "'{}' is not a phone number",
                args.phone_number
            )));
        }
        let result = ctx
            .executor
            .execute(ExternalAction::Dial {
                number: number.clone(),
            })
            .await?;
        Ok(ToolOutcome::completed(result, format!("Calling {}", number)))
    }
}

/// Apps the assistant can open: (capability id, display name, launch scheme).
const KNOWN_APPS: &[(&str, &str, &str)] = &[
    ("whatsapp", "WhatsApp", "whatsapp://"),
    ("spotify", "Spotify", "spotify:"),
    ("youtube", "YouTube", "vnd.youtube://"),
    ("instagram", "Instagram", "instagram://"),
    ("telegram", "Telegram", "tg://"),
    ("gmail", "Gmail", "googlegmail://"),
    ("maps", "Maps", "geo:0,0"),
    ("camera", "Camera", "camera:"),
];

fn find_app(name: &str) -> Option<(&'static str, &'static str, &'static str)> {
    let wanted: String = name
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    KNOWN_APPS
        .iter()
        .find(|(id, _, _)| *id == wanted)
        .or_else(|| KNOWN_APPS.iter().find(|(id, _, _)| wanted.contains(id)))
        .copied()
}

pub struct LaunchApp;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchAppArgs {
    app_name: String,
}

#[async_trait]
impl ToolHandler for LaunchApp {
    fn declaration(&self) -> ToolDeclaration {
        let names: Vec<&str> = KNOWN_APPS.iter().map(|(_, name, _)| *name).collect();
        ToolDeclaration::new("launchApp", "Open an installed application.").param(
            "appName",
            ParamType::String,
            "Application to open",
            &names,
            true,
        )
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: LaunchAppArgs = parse_args("launchApp", args)?;
        let (id, label, scheme) = find_app(&args.app_name).ok_or_else(|| {
            EngineError::ToolExecution(format!("no known app called '{}'", args.app_name))
        })?;
        if !ctx.permissions.is_allowed(id) {
            return Ok(ToolOutcome::denied("launchApp", label));
        }
        let result = ctx
            .executor
            .execute(ExternalAction::LaunchApp {
                app: label.to_string(),
                scheme: scheme.to_string(),
            })
            .await?;
        Ok(ToolOutcome::completed(result, format!("Launched {}", label)))
    }
}

pub struct CreateCalendarEvent;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarArgs {
    title: String,
    date: Option<String>,
    time: Option<String>,
    duration_minutes: Option<f64>,
}

#[async_trait]
impl ToolHandler for CreateCalendarEvent {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("createCalendarEvent", "Add an event to the user's calendar.")
            .required("title", ParamType::String, "Event title")
            .optional("date", ParamType::String, "Date, YYYY-MM-DD")
            .optional("time", ParamType::String, "Start time, HH:MM")
            .optional("durationMinutes", ParamType::Number, "Length in minutes")
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: CalendarArgs = parse_args("createCalendarEvent", args)?;
        if !ctx.permissions.is_allowed("calendar") {
            return Ok(ToolOutcome::denied("createCalendarEvent", "Calendar"));
        }
        let when = match (&args.date, &args.time) {
            (Some(date), Some(time)) => format!(" on {} at {}", date, time),
            (Some(date), None) => format!(" on {}", date),
            (None, Some(time)) => format!(" at {}", time),
            (None, None) => String::new(),
        };
        let result = ctx
            .executor
            .execute(ExternalAction::CalendarEvent {
                title: args.title.clone(),
                date: args.date,
                time: args.time,
                duration_minutes: args.duration_minutes.map(|m| m.max(0.0).round() as u32),
            })
            .await?;
        Ok(ToolOutcome::completed(
            result,
            format!("Calendar event \"{}\"{}", args.title, when),
        ))
    }
}

pub struct ComposeEmail;

#[derive(Deserialize)]
struct ComposeEmailArgs {
    to: String,
    subject: Option<String>,
    body: Option<String>,
}

#[async_trait]
impl ToolHandler for ComposeEmail {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("composeEmail", "Open a new email draft.")
            .required("to", ParamType::String, "Recipient address")
            .optional("subject", ParamType::String, "Subject line")
            .optional("body", ParamType::String, "Message body")
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: ComposeEmailArgs = parse_args("composeEmail", args)?;
        if !ctx.permissions.is_allowed("email") {
            return Ok(ToolOutcome::denied("composeEmail", "Email"));
        }
        let to = args.to.clone();
        let result = ctx
            .executor
            .execute(ExternalAction::ComposeEmail {
                to: args.to,
                subject: args.subject,
                body: args.body,
            })
            .await?;
        Ok(ToolOutcome::completed(result, format!("Email draft to {}", to)))
    }
}

pub struct ControlLight;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlLightArgs {
    brightness: f64,
    color_temperature: Option<String>,
}

#[async_trait]
impl ToolHandler for ControlLight {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("controlLight", "Set the room lights.")
            .required("brightness", ParamType::Number, "Brightness from 0 to 100")
            .param(
                "colorTemperature",
                ParamType::String,
                "Color temperature",
                &["warm", "neutral", "cool"],
                false,
            )
    }

    async fn handle(&self, args: Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: ControlLightArgs = parse_args("controlLight", args)?;
        let brightness = args.brightness.clamp(0.0, 100.0).round() as u8;
        let color = args.color_temperature.map(|c| c.to_lowercase());
        let result = ctx
            .executor
            .execute(ExternalAction::ControlLight {
                brightness,
                color_temperature: color.clone(),
            })
            .await?;
        let log = match color {
            Some(color) => format!("Lights set to {}% ({})", brightness, color),
            None => format!("Lights set to {}%", brightness),
        };
        Ok(ToolOutcome::completed(result, log))
    }
}
