//! attest: command-line client for the attendance attestation daemon.
//!
//! Every subcommand is a single request over the daemon socket. Results are
//! printed to stdout as JSON; diagnostics go to the log file.
//!
//! ## Subcommands
//!
//! - `webhook`: forward a provider callback (body on stdin)
//! - `heartbeat`: report a client activity heartbeat
//! - `sweep`: run a reconciliation sweep now
//! - `session` / `sessions`: inspect attendance sessions
//! - `record`: look up or verify a verification record
//! - `health`: daemon status
//! - `outbox`: drain pending notifications

mod daemon_client;
mod logging;

use attest_core::webhook::compute_signature;
use attest_protocol::{HeartbeatParams, HeartbeatState, ListParams, Method, RecordLookup, WebhookParams};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;

use daemon_client::CallError;

#[derive(Parser)]
#[command(name = "attest")]
#[command(about = "Attendance attestation client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a meeting provider webhook (reads the raw body from stdin)
    Webhook(WebhookArgs),

    /// Report a client heartbeat for a session
    Heartbeat(HeartbeatArgs),

    /// Run a reconciliation sweep immediately
    Sweep,

    /// Show one session with its events
    Session {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// List sessions, newest first
    Sessions {
        /// Filter by status (in_progress, completed, finalized, rejected)
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Look up a verification record by id or card number
    Record(RecordArgs),

    /// Show daemon health
    Health,

    /// Drain pending outbox notifications
    Outbox {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args)]
struct WebhookArgs {
    /// Provider signature header value
    #[arg(long, requires = "timestamp", conflicts_with = "secret")]
    signature: Option<String>,

    /// Provider request timestamp header value
    #[arg(long)]
    timestamp: Option<String>,

    /// Sign the body locally with this secret instead of passing a signature
    #[arg(long)]
    secret: Option<String>,

    /// Read the body from a file instead of stdin
    #[arg(long, value_name = "PATH")]
    body_file: Option<PathBuf>,
}

#[derive(Args)]
struct HeartbeatArgs {
    #[arg(long)]
    session_id: String,

    /// Defaults to a fresh ULID
    #[arg(long)]
    event_id: Option<String>,

    #[arg(long, value_enum, default_value_t = StateArg::Active)]
    state: StateArg,

    /// RFC 3339 timestamp; defaults to now
    #[arg(long)]
    at: Option<String>,

    #[arg(long)]
    mouse: bool,

    #[arg(long)]
    keyboard: bool,

    #[arg(long)]
    tab_focused: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Active,
    Idle,
}

impl From<StateArg> for HeartbeatState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Active => HeartbeatState::Active,
            StateArg::Idle => HeartbeatState::Idle,
        }
    }
}

#[derive(Args)]
struct RecordArgs {
    #[arg(long, conflicts_with = "card", required_unless_present = "card")]
    id: Option<String>,

    #[arg(long)]
    card: Option<String>,

    /// Print only the integrity verdict; exits non-zero when invalid
    #[arg(long)]
    verify: bool,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "attest command failed");
            eprintln!("attest: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the command succeeded but reported a negative
/// verdict.
fn run(command: Commands) -> Result<bool, String> {
    match command {
        Commands::Webhook(args) => {
            let body = read_body(args.body_file.as_ref())?;
            let params = webhook_params(&args, body, Utc::now())?;
            print_call(Method::Webhook, Some(to_value(&params)?))
        }
        Commands::Heartbeat(args) => {
            let params = heartbeat_params(&args, Utc::now());
            print_call(Method::Heartbeat, Some(to_value(&params)?))
        }
        Commands::Sweep => print_call(Method::RunSweep, None),
        Commands::Session { session_id } => {
            print_call(Method::GetSession, Some(json!({ "session_id": session_id })))
        }
        Commands::Sessions { status, limit } => {
            let params = ListParams { status, limit };
            print_call(Method::ListSessions, Some(to_value(&params)?))
        }
        Commands::Record(args) => {
            let lookup = RecordLookup {
                record_id: args.id,
                card_number: args.card,
            };
            let method = if args.verify {
                Method::VerifyRecord
            } else {
                Method::GetRecord
            };
            let data = daemon_client::call(method, Some(to_value(&lookup)?))
                .map_err(|err| err.to_string())?;
            print_json(&data)?;
            Ok(record_is_valid(&data))
        }
        Commands::Health => print_call(Method::GetHealth, None),
        Commands::Outbox { limit } => {
            let params = ListParams {
                status: None,
                limit,
            };
            print_call(Method::DrainOutbox, Some(to_value(&params)?))
        }
    }
}

fn print_call(method: Method, params: Option<Value>) -> Result<bool, String> {
    match daemon_client::call(method, params) {
        Ok(data) => {
            print_json(&data)?;
            Ok(true)
        }
        Err(CallError::Daemon { code, message }) => {
            print_json(&json!({ "error": { "code": code, "message": message } }))?;
            Ok(false)
        }
        Err(err) => Err(err.to_string()),
    }
}

fn print_json(value: &Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| format!("Failed to format response: {}", err))?;
    println!("{}", text);
    Ok(())
}

fn to_value<T: serde::Serialize>(params: &T) -> Result<Value, String> {
    serde_json::to_value(params).map_err(|err| format!("Failed to serialize params: {}", err))
}

fn read_body(path: Option<&PathBuf>) -> Result<String, String> {
    match path {
        Some(path) => fs_err::read_to_string(path).map_err(|err| err.to_string()),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .map_err(|err| format!("Failed to read stdin: {}", err))?;
            Ok(body)
        }
    }
}

/// The body is forwarded byte-for-byte apart from one trailing newline that
/// shells tend to append.
fn webhook_params(
    args: &WebhookArgs,
    body: String,
    now: DateTime<Utc>,
) -> Result<WebhookParams, String> {
    let body = body
        .strip_suffix('\n')
        .map(str::to_string)
        .unwrap_or(body);
    if let Some(secret) = &args.secret {
        let timestamp = args
            .timestamp
            .clone()
            .unwrap_or_else(|| now.timestamp().to_string());
        let signature =
            compute_signature(secret, &timestamp, &body).map_err(|err| err.to_string())?;
        return Ok(WebhookParams {
            signature,
            timestamp,
            body,
        });
    }

    match (&args.signature, &args.timestamp) {
        (Some(signature), Some(timestamp)) => Ok(WebhookParams {
            signature: signature.clone(),
            timestamp: timestamp.clone(),
            body,
        }),
        _ => Err("either --signature with --timestamp, or --secret, is required".to_string()),
    }
}

fn heartbeat_params(args: &HeartbeatArgs, now: DateTime<Utc>) -> HeartbeatParams {
    HeartbeatParams {
        event_id: args
            .event_id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string()),
        session_id: args.session_id.clone(),
        occurred_at: args
            .at
            .clone()
            .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        state: args.state.into(),
        mouse_active: args.mouse,
        keyboard_active: args.keyboard,
        tab_focused: args.tab_focused,
    }
}

fn record_is_valid(data: &Value) -> bool {
    data.get("valid")
        .or_else(|| data.get("integrity").and_then(|integrity| integrity.get("valid")))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
