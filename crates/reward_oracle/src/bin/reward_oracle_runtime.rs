use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reward_oracle::{
    build_reconciler, now_unix_ms, ConfiguredReconciler, CycleOutcomeKind, OracleConfig,
    OracleRuntime, OracleRuntimeSnapshot, DEFAULT_CONFIG_FILE_NAME,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";
const LOG_TARGET_HEALTH: &str = "reward_oracle.health";

type ConfiguredRuntime = OracleRuntime<
    reward_oracle::DynBaselineStore,
    reward_oracle::YouTubeMetricSource,
    reward_oracle::DynMintLedger,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    config_path: String,
    once: bool,
    health_bind: Option<String>,
    log_filter: String,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_path: DEFAULT_CONFIG_FILE_NAME.to_string(),
            once: false,
            health_bind: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[derive(Debug)]
struct StatusServer {
    stop_tx: Sender<()>,
    error_rx: Receiver<String>,
    join_handle: Option<thread::JoinHandle<()>>,
}

#[derive(Debug, Serialize)]
struct OracleStatusResponse {
    ok: bool,
    observed_at_unix_ms: i64,
    #[serde(flatten)]
    runtime: OracleRuntimeSnapshot,
}

fn main() {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    if raw_args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return;
    }

    let options = match parse_options(raw_args.iter().map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(options.log_filter.as_str()))
        .init();

    match run_oracle(options) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("reward_oracle_runtime failed: {err}");
            process::exit(1);
        }
    }
}

fn run_oracle(options: CliOptions) -> Result<i32, String> {
    let config =
        OracleConfig::load(Path::new(options.config_path.as_str())).map_err(|err| err.to_string())?;
    let entity = config.entity_key().map_err(|err| err.to_string())?;
    let reconciler: ConfiguredReconciler =
        build_reconciler(&config).map_err(|err| err.to_string())?;
    let runtime = OracleRuntime::new(entity, config.interval, reconciler);

    if options.once {
        let outcome = runtime.run_once();
        let report = outcome.report(runtime.entity(), now_unix_ms());
        let body = serde_json::to_string_pretty(&report)
            .map_err(|err| format!("failed to encode cycle report: {err}"))?;
        println!("{body}");
        return Ok(exit_code_for(report.outcome));
    }

    let health_bind = options.health_bind.or(config.health_bind.clone());
    let runtime = Arc::new(Mutex::new(runtime));

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|err| format!("failed to install signal handler: {err}"))?;

    {
        let mut locked = runtime
            .lock()
            .map_err(|_| "failed to start oracle runtime: lock poisoned".to_string())?;
        locked.start().map_err(|err| err.to_string())?;
    }

    let mut status_server = match health_bind.as_deref() {
        Some(bind) => {
            let (host, port) = parse_host_port(bind, "--health-bind")?;
            match start_status_server(host.as_str(), port, Arc::clone(&runtime)) {
                Ok(server) => {
                    tracing::info!(
                        target: LOG_TARGET_HEALTH,
                        "status server listening on http://{host}:{port}/v1/oracle/status"
                    );
                    Some(server)
                }
                Err(err) => {
                    stop_runtime(&runtime);
                    return Err(err);
                }
            }
        }
        None => None,
    };

    tracing::info!(
        target: "reward_oracle.runtime",
        entity = %config.entity_id,
        interval_secs = config.interval.as_secs(),
        "reward_oracle_runtime ready; press Ctrl+C to stop"
    );

    loop {
        match shutdown_rx.recv_timeout(Duration::from_millis(300)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if let Some(server) = status_server.as_mut() {
            if let Some(server_err) = poll_status_server_error(server) {
                stop_status_server(server);
                stop_runtime(&runtime);
                return Err(server_err);
            }
        }
    }

    tracing::info!(target: "reward_oracle.runtime", "shutdown requested; waiting for in-flight cycle");
    if let Some(server) = status_server.as_mut() {
        stop_status_server(server);
    }
    stop_runtime(&runtime);
    Ok(0)
}

fn exit_code_for(outcome: CycleOutcomeKind) -> i32 {
    match outcome {
        CycleOutcomeKind::Minted | CycleOutcomeKind::NoReward | CycleOutcomeKind::Skipped => 0,
        CycleOutcomeKind::TransientFailure => 1,
        CycleOutcomeKind::InconsistentState => 2,
    }
}

fn stop_runtime(runtime: &Arc<Mutex<ConfiguredRuntime>>) {
    let mut locked = match runtime.lock() {
        Ok(locked) => locked,
        Err(_) => {
            tracing::error!(target: "reward_oracle.runtime", "failed to stop oracle runtime: lock poisoned");
            return;
        }
    };
    if let Err(err) = locked.stop() {
        tracing::warn!(target: "reward_oracle.runtime", "failed to stop oracle runtime: {err}");
    }
}

fn start_status_server(
    host: &str,
    port: u16,
    runtime: Arc<Mutex<ConfiguredRuntime>>,
) -> Result<StatusServer, String> {
    let listener = TcpListener::bind((host, port))
        .map_err(|err| format!("failed to bind status server at {host}:{port}: {err}"))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("failed to set status server listener nonblocking: {err}"))?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (error_tx, error_rx) = mpsc::channel::<String>();

    let join_handle = thread::spawn(move || {
        if let Err(err) = run_status_server_loop(listener, stop_rx, runtime) {
            let _ = error_tx.send(err);
        }
    });

    Ok(StatusServer {
        stop_tx,
        error_rx,
        join_handle: Some(join_handle),
    })
}

fn run_status_server_loop(
    listener: TcpListener,
    stop_rx: Receiver<()>,
    runtime: Arc<Mutex<ConfiguredRuntime>>,
) -> Result<(), String> {
    loop {
        match stop_rx.try_recv() {
            Ok(_) | Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {}
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    if let Err(err) = handle_status_connection(stream, runtime) {
                        tracing::warn!(target: LOG_TARGET_HEALTH, "status connection failed: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                return Err(format!("status server accept failed: {err}"));
            }
        }
    }
}

fn handle_status_connection(
    mut stream: TcpStream,
    runtime: Arc<Mutex<ConfiguredRuntime>>,
) -> Result<(), String> {
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("failed to set stream blocking: {err}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .map_err(|err| format!("failed to set read timeout: {err}"))?;

    let mut buffer = [0_u8; 4096];
    let bytes = stream
        .read(&mut buffer)
        .map_err(|err| format!("failed to read request: {err}"))?;
    if bytes == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes]);
    let Some(line) = request.lines().next() else {
        write_json_response(&mut stream, 400, b"{\"error\":\"bad request\"}", false)
            .map_err(|err| format!("failed to write 400 response: {err}"))?;
        return Ok(());
    };

    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let head_only = method.eq_ignore_ascii_case("HEAD");

    if !method.eq_ignore_ascii_case("GET") && !head_only {
        write_json_response(
            &mut stream,
            405,
            b"{\"error\":\"method not allowed\"}",
            head_only,
        )
        .map_err(|err| format!("failed to write 405 response: {err}"))?;
        return Ok(());
    }

    match target.split('?').next().unwrap_or(target) {
        "/healthz" => {
            write_json_response(&mut stream, 200, b"{\"ok\":true}", head_only)
                .map_err(|err| format!("failed to write /healthz response: {err}"))?;
        }
        "/v1/oracle/status" => {
            let snapshot = runtime
                .lock()
                .map_err(|_| "failed to read oracle runtime snapshot: lock poisoned".to_string())?
                .snapshot();
            let body = serde_json::to_vec_pretty(&build_status_payload(snapshot))
                .map_err(|err| format!("failed to encode status payload: {err}"))?;
            write_json_response(&mut stream, 200, body.as_slice(), head_only)
                .map_err(|err| format!("failed to write /v1/oracle/status response: {err}"))?;
        }
        _ => {
            write_json_response(&mut stream, 404, b"{\"error\":\"not found\"}", head_only)
                .map_err(|err| format!("failed to write 404 response: {err}"))?;
        }
    }

    Ok(())
}

fn build_status_payload(snapshot: OracleRuntimeSnapshot) -> OracleStatusResponse {
    OracleStatusResponse {
        ok: snapshot.running && snapshot.inconsistent_count == 0,
        observed_at_unix_ms: now_unix_ms(),
        runtime: snapshot,
    }
}

fn poll_status_server_error(server: &mut StatusServer) -> Option<String> {
    match server.error_rx.try_recv() {
        Ok(err) => Some(format!("status server failed: {err}")),
        Err(TryRecvError::Disconnected) => {
            Some("status server channel disconnected unexpectedly".to_string())
        }
        Err(TryRecvError::Empty) => {
            if let Some(handle) = server.join_handle.as_ref() {
                if handle.is_finished() {
                    return Some("status server exited unexpectedly".to_string());
                }
            }
            None
        }
    }
}

fn stop_status_server(server: &mut StatusServer) {
    let _ = server.stop_tx.send(());
    if let Some(handle) = server.join_handle.take() {
        let _ = handle.join();
    }
}

fn write_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let headers = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(headers.as_bytes())?;
    if !head_only {
        stream.write_all(body)?;
    }
    stream.flush()?;
    Ok(())
}

fn parse_options<'a>(args: impl Iterator<Item = &'a str>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.peekable();

    while let Some(arg) = iter.next() {
        match arg {
            "--config" => {
                options.config_path = parse_required_value(&mut iter, "--config")?;
            }
            "--once" => {
                options.once = true;
            }
            "--health-bind" => {
                let raw = parse_required_value(&mut iter, "--health-bind")?;
                parse_host_port(raw.as_str(), "--health-bind")?;
                options.health_bind = Some(raw);
            }
            "--log" => {
                options.log_filter = parse_required_value(&mut iter, "--log")?;
            }
            _ => return Err(format!("unknown option: {arg}")),
        }
    }

    if options.once && options.health_bind.is_some() {
        return Err("--health-bind cannot be combined with --once".to_string());
    }

    Ok(options)
}

fn parse_required_value<'a, I>(
    iter: &mut std::iter::Peekable<I>,
    flag: &str,
) -> Result<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let Some(value) = iter.next() else {
        return Err(format!("{flag} requires a value"));
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{flag} requires a non-empty value"));
    }
    Ok(value.to_string())
}

fn parse_host_port(raw: &str, label: &str) -> Result<(String, u16), String> {
    let trimmed = raw.trim();
    let (host, port_text) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| format!("{label} must be in <host:port> format"))?;
    if host.trim().is_empty() {
        return Err(format!("{label} host cannot be empty"));
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| format!("{label} port must be an integer in 1..=65535"))?;
    if port == 0 {
        return Err(format!("{label} port must be in 1..=65535"));
    }
    Ok((host.trim().to_string(), port))
}

fn print_help() {
    println!(
        "Usage: reward_oracle_runtime [options]\n\n\
Reconciles channel counters against the stored baseline and mints earned rewards.\n\
Runs one cycle at start and then one per configured interval.\n\n\
Options:\n\
  --config <path>            config file with REWARD_ORACLE_* keys (default: {DEFAULT_CONFIG_FILE_NAME});\n\
                             falls back to environment variables when the file is absent\n\
  --once                     run a single cycle, print its report and exit\n\
  --health-bind <host:port>  serve /healthz and /v1/oracle/status (overrides REWARD_ORACLE_HEALTH_BIND)\n\
  --log <filter>             tracing filter directive (default: {DEFAULT_LOG_FILTER})\n\
  -h, --help                 show help\n\n\
Exit status with --once: 0 minted/no reward/skipped, 1 transient failure, 2 inconsistent state"
    );
}

#[cfg(test)]
mod tests {
    use super::{
        build_status_payload, exit_code_for, parse_host_port, parse_options, DEFAULT_LOG_FILTER,
    };
    use reward_oracle::{CycleOutcomeKind, OracleRuntimeSnapshot, DEFAULT_CONFIG_FILE_NAME};

    #[test]
    fn parse_options_defaults() {
        let options = parse_options(std::iter::empty()).expect("parse should succeed");
        assert_eq!(options.config_path, DEFAULT_CONFIG_FILE_NAME);
        assert_eq!(options.log_filter, DEFAULT_LOG_FILTER);
        assert!(!options.once);
        assert_eq!(options.health_bind, None);
    }

    #[test]
    fn parse_options_reads_custom_values() {
        let options = parse_options(
            [
                "--config",
                "deploy/oracle.toml",
                "--health-bind",
                "0.0.0.0:8080",
                "--log",
                "reward_oracle=debug",
            ]
            .into_iter(),
        )
        .expect("parse should succeed");

        assert_eq!(options.config_path, "deploy/oracle.toml");
        assert_eq!(options.health_bind.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(options.log_filter, "reward_oracle=debug");
    }

    #[test]
    fn parse_options_rejects_invalid_health_bind() {
        let err = parse_options(["--health-bind", "8080"].into_iter()).expect_err("should fail");
        assert!(err.contains("<host:port>"));
        let err =
            parse_options(["--health-bind", "127.0.0.1:0"].into_iter()).expect_err("should fail");
        assert!(err.contains("1..=65535"));
    }

    #[test]
    fn parse_options_rejects_once_with_health_bind() {
        let err = parse_options(["--once", "--health-bind", "127.0.0.1:8080"].into_iter())
            .expect_err("should fail");
        assert!(err.contains("--once"));
    }

    #[test]
    fn parse_options_rejects_unknown_option() {
        let err = parse_options(["--interval"].into_iter()).expect_err("should fail");
        assert!(err.contains("unknown option"));
    }

    #[test]
    fn parse_options_rejects_missing_value() {
        let err = parse_options(["--config"].into_iter()).expect_err("should fail");
        assert!(err.contains("requires a value"));
    }

    #[test]
    fn parse_host_port_trims_host() {
        assert_eq!(
            parse_host_port(" localhost:9000 ", "--health-bind").expect("parse"),
            ("localhost".to_string(), 9000)
        );
    }

    #[test]
    fn exit_code_separates_inconsistent_state() {
        assert_eq!(exit_code_for(CycleOutcomeKind::Minted), 0);
        assert_eq!(exit_code_for(CycleOutcomeKind::NoReward), 0);
        assert_eq!(exit_code_for(CycleOutcomeKind::TransientFailure), 1);
        assert_eq!(exit_code_for(CycleOutcomeKind::InconsistentState), 2);
    }

    #[test]
    fn status_payload_flags_inconsistent_runtime() {
        let snapshot = OracleRuntimeSnapshot {
            entity_id: "UCchannel".to_string(),
            running: true,
            interval_secs: 3_600,
            cycle_count: 3,
            minted_count: 1,
            minted_total: 105,
            inconsistent_count: 1,
            last_cycle_unix_ms: Some(1),
            last_report: None,
        };
        let payload = build_status_payload(snapshot);
        assert!(!payload.ok);

        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["entity_id"], "UCchannel");
        assert_eq!(json["minted_total"], 105);
    }
}
