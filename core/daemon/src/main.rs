//! Attestation daemon entrypoint.
//!
//! A single-writer service that owns the event store and the record ledger:
//! a socket listener with strict request validation, a SQLite-backed event
//! log, and a periodic reconciliation sweep that closes sessions and issues
//! signed verification records.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use attest_core::{IngestionError, SessionStatus};
use attest_protocol::{
    parse_heartbeat, parse_list, parse_record_lookup, parse_session_lookup, parse_webhook,
    ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

mod config;
mod db;
mod generator;
mod ingest;
mod keys;
mod scheduler;
mod state;
mod verifier;

use db::Db;
use generator::RecordGenerator;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_LIST_LIMIT: usize = 100;

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load daemon config");
            std::process::exit(1);
        }
    };

    let key_path = match config.ledger.signing_key_path.clone() {
        Some(path) => path,
        None => match keys::default_key_path() {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "Failed to resolve signing key path");
                std::process::exit(1);
            }
        },
    };
    let signer = match keys::load_or_create_signing_key(&key_path) {
        Ok(signer) => signer,
        Err(err) => {
            error!(error = %err, "Failed to load signing key");
            std::process::exit(1);
        }
    };

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    if config.webhook.secret.is_none() {
        warn!("Webhook secret not configured; webhook ingestion will be refused");
    }
    let generator = RecordGenerator::new(signer, config.ledger.chain_scope);
    info!(
        path = %socket_path.display(),
        key_id = %generator.signer().key_id(),
        chain_scope = ?config.ledger.chain_scope,
        sweep_interval_secs = config.scheduler.interval_secs,
        grace_period_min = config.scheduler.grace_period_min,
        "Attestation daemon started"
    );

    let shared_state = Arc::new(SharedState::new(db, config, generator));
    if shared_state.config.scheduler.enabled {
        spawn_reconciliation_scheduler(Arc::clone(&shared_state));
    } else {
        info!("Periodic reconciliation disabled; sweeps run only on request");
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_reconciliation_scheduler(state: Arc<SharedState>) {
    let interval = Duration::from_secs(state.config.scheduler.interval_secs.max(1));
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.sweep("periodic") {
            warn!(error = %err, "Periodic reconciliation sweep failed");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("ATTEST_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".attest").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".attest").join("daemon").join("attest.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "key_id": state.verifier().key_id(),
                "public_key": state.verifier().public_key_hex(),
                "chain_scope": state.generator.chain_scope(),
                "webhook_configured": state.config.webhook.secret.is_some(),
                "sweep_interval_secs": state.config.scheduler.interval_secs,
            });
            if let Some(summary) = state.last_sweep_snapshot() {
                if let Ok(value) = serde_json::to_value(summary) {
                    data["last_sweep"] = value;
                }
            }
            if let Ok(counts) = state.db.count_sessions_by_status() {
                if let Ok(value) = serde_json::to_value(counts) {
                    data["sessions"] = value;
                }
            }
            Response::ok(id, data)
        }
        Method::Webhook => {
            let Some(params) = request.params else {
                return Response::error(id, "invalid_params", "webhook payload is required");
            };
            let params = match parse_webhook(params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let result = ingest::ingest_webhook(
                &state.db,
                &state.config.webhook,
                &state.config.ingest,
                &params,
                Utc::now(),
            );
            ingestion_response(id, result)
        }
        Method::Heartbeat => {
            let Some(params) = request.params else {
                return Response::error(id, "invalid_params", "heartbeat payload is required");
            };
            let params = match parse_heartbeat(params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let result =
                ingest::ingest_heartbeat(&state.db, &state.config.ingest, &params, Utc::now());
            ingestion_response(id, result)
        }
        Method::RunSweep => match state.sweep("manual") {
            Ok(summary) => serialize_response(id, &summary, "sweep summary"),
            Err(err) => Response::error(
                id,
                "sweep_error",
                format!("Failed to run reconciliation sweep: {}", err),
            ),
        },
        Method::GetSession => {
            let Some(params) = request.params else {
                return Response::error(id, "invalid_params", "session_id is required");
            };
            let lookup = match parse_session_lookup(params) {
                Ok(lookup) => lookup,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.db.get_session(&lookup.session_id) {
                Ok(Some(session)) => serialize_response(id, &session, "session"),
                Ok(None) => Response::error(
                    id,
                    "not_found",
                    format!("session {} not found", lookup.session_id),
                ),
                Err(err) => Response::error(
                    id,
                    "sessions_error",
                    format!("Failed to fetch session: {}", err),
                ),
            }
        }
        Method::ListSessions => {
            let params = match parse_list(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let status = match params.status.as_deref() {
                Some(value) => match SessionStatus::from_str(value) {
                    Some(status) => Some(status),
                    None => {
                        return Response::error(
                            id,
                            "invalid_params",
                            format!("unknown session status: {}", value),
                        )
                    }
                },
                None => None,
            };
            match state
                .db
                .list_sessions(status, params.effective_limit(DEFAULT_LIST_LIMIT))
            {
                Ok(sessions) => {
                    tracing::debug!(sessions = sessions.len(), "Sessions listing");
                    serialize_response(id, &sessions, "sessions")
                }
                Err(err) => Response::error(
                    id,
                    "sessions_error",
                    format!("Failed to list sessions: {}", err),
                ),
            }
        }
        Method::GetRecord | Method::VerifyRecord => {
            let verify_only = request.method == Method::VerifyRecord;
            let Some(params) = request.params else {
                return Response::error(
                    id,
                    "invalid_params",
                    "record_id or card_number is required",
                );
            };
            let lookup = match parse_record_lookup(params) {
                Ok(lookup) => lookup,
                Err(err) => return Response::error_with_info(id, err),
            };
            let result = if verify_only {
                verifier::verify(&state.db, state.verifier(), &lookup)
                    .map(|found| found.map(|outcome| serde_json::to_value(outcome)))
            } else {
                verifier::lookup(&state.db, state.verifier(), &lookup)
                    .map(|found| found.map(|view| serde_json::to_value(view)))
            };
            match result {
                Ok(Some(Ok(value))) => Response::ok(id, value),
                Ok(Some(Err(err))) => Response::error(
                    id,
                    "serialization_error",
                    format!("Failed to serialize record: {}", err),
                ),
                Ok(None) => Response::error(id, "not_found", "record not found"),
                Err(err) => Response::error(
                    id,
                    "records_error",
                    format!("Failed to fetch record: {}", err),
                ),
            }
        }
        Method::DrainOutbox => {
            let params = match parse_list(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state
                .db
                .drain_outbox(params.effective_limit(DEFAULT_LIST_LIMIT), Utc::now())
            {
                Ok(entries) => serialize_response(id, &entries, "outbox entries"),
                Err(err) => Response::error(
                    id,
                    "outbox_error",
                    format!("Failed to drain outbox: {}", err),
                ),
            }
        }
    }
}

fn ingestion_response(id: Option<String>, result: Result<Value, IngestionError>) -> Response {
    match result {
        Ok(value) => Response::ok(id, value),
        Err(err) => {
            match &err {
                IngestionError::Storage(_) => warn!(error = %err, "Event ingestion failed"),
                _ => info!(code = err.code(), error = %err, "Event refused"),
            }
            Response::error(id, err.code(), err.to_string())
        }
    }
}

fn serialize_response<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
