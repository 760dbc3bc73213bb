//! Client helper for talking to the attestation daemon over its socket.
//!
//! The daemon owns all state. Transport failures are retried once with the
//! same request id; error responses are surfaced to the caller unchanged.

use attest_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use serde_json::Value;
use std::env;
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "ATTEST_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 10_000;
const WRITE_TIMEOUT_MS: u64 = 2_000;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The daemon could not be reached or its reply was unreadable.
    Transport(String),
    /// The daemon answered with an error response.
    Daemon { code: String, message: String },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Transport(message) => write!(f, "{}", message),
            CallError::Daemon { code, message } => write!(f, "{}: {}", code, message),
        }
    }
}

impl std::error::Error for CallError {}

pub fn call(method: Method, params: Option<Value>) -> Result<Value, CallError> {
    let request_id = ulid::Ulid::new().to_string();
    let build = || Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(request_id.clone()),
        params: params.clone(),
    };

    let response = send_request_with_retry(build, method_label(method))?;
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(err) => CallError::Daemon {
            code: err.code,
            message: err.message,
        },
        None => CallError::Daemon {
            code: "unknown".to_string(),
            message: "Unknown daemon error".to_string(),
        },
    })
}

fn method_label(method: Method) -> &'static str {
    match method {
        Method::GetHealth => "health check",
        Method::Webhook => "webhook",
        Method::Heartbeat => "heartbeat",
        Method::RunSweep => "sweep",
        Method::GetSession => "session lookup",
        Method::ListSessions => "session list",
        Method::GetRecord => "record lookup",
        Method::VerifyRecord => "record verification",
        Method::DrainOutbox => "outbox drain",
    }
}

pub fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".attest").join(SOCKET_NAME))
}

fn send_request_with_retry<F>(mut build: F, label: &str) -> Result<Response, CallError>
where
    F: FnMut() -> Request,
{
    match send_request(build()) {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(build()).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    "Retry failed sending {} to daemon",
                    label
                );
                CallError::Transport(retry_err)
            })
        }
    }
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    };
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn socket_dir(prefix: &str) -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in("/tmp")
            .unwrap()
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }

        let newline_index = buffer.iter().position(|b| *b == b'\n');
        let request_bytes = match newline_index {
            Some(index) => &buffer[..index],
            None => buffer.as_slice(),
        };
        serde_json::from_slice(request_bytes).ok()
    }

    fn write_response(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    fn serve<F>(socket_path: &Path, connections: usize, mut handler: F) -> std::thread::JoinHandle<()>
    where
        F: FnMut(usize, &mut UnixStream) + Send + 'static,
    {
        let listener = UnixListener::bind(socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();
        std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < connections && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        handled += 1;
                        let _ = stream.set_nonblocking(false);
                        handler(handled, &mut stream);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        })
    }

    #[test]
    fn retry_reuses_same_request_id_after_lost_response() {
        let _guard = env_lock();
        let dir = socket_dir("attest-cli-lost");
        let socket_path = dir.path().join("daemon.sock");

        let attempt_ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let attempt_ids_clone = Arc::clone(&attempt_ids);
        let server = serve(&socket_path, 2, move |handled, stream| {
            let request = read_request(stream);
            attempt_ids_clone
                .lock()
                .unwrap()
                .push(request.and_then(|request| request.id));
            if handled == 2 {
                write_response(stream, &Response::ok(None, serde_json::json!({"status": "ok"})));
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let data = call(Method::GetHealth, None).expect("second attempt succeeds");
        assert_eq!(data["status"], "ok");
        server.join().unwrap();

        let ids = attempt_ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].is_some());
        assert_eq!(ids[0], ids[1], "retry must reuse the same request id");
    }

    #[test]
    fn daemon_error_is_surfaced_without_retry() {
        let _guard = env_lock();
        let dir = socket_dir("attest-cli-error");
        let socket_path = dir.path().join("daemon.sock");

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let server = serve(&socket_path, 1, move |_, stream| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            let request = read_request(stream).expect("request");
            assert_eq!(request.method, Method::Heartbeat);
            assert_eq!(request.params.as_ref().unwrap()["session_id"], "ses-1");
            write_response(
                stream,
                &Response::error(request.id, "unknown_session", "Unknown session: ses-1"),
            );
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let err = call(
            Method::Heartbeat,
            Some(serde_json::json!({ "session_id": "ses-1" })),
        )
        .unwrap_err();
        server.join().unwrap();

        assert_eq!(
            err,
            CallError::Daemon {
                code: "unknown_session".to_string(),
                message: "Unknown session: ses-1".to_string(),
            }
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_daemon_is_a_transport_error() {
        let _guard = env_lock();
        let dir = socket_dir("attest-cli-missing");
        let socket_path = dir.path().join("absent.sock");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let err = call(Method::RunSweep, None).unwrap_err();
        assert!(matches!(err, CallError::Transport(_)), "{:?}", err);
    }

    #[test]
    fn socket_path_honors_env_override() {
        let _guard = env_lock();
        let _socket_guard = EnvGuard::set(SOCKET_ENV, "/tmp/attest-override.sock");
        assert_eq!(
            socket_path().unwrap(),
            PathBuf::from("/tmp/attest-override.sock")
        );
    }
}
