use std::process;
use std::sync::Arc;
use std::time::Duration;

use mcp_bridge::transport::{ServerConfig, serve};
use mcp_bridge::{BridgeConfig, BridgeService, ChildCommand, CommandSpawner};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: mcp-bridge [options] -- <command> [args...]

Options:
  --host <addr>                 Bind address [env: MCP_BRIDGE_HOST] [default: 0.0.0.0]
  --port <port>                 Bind port [env: MCP_BRIDGE_PORT] [default: 3000]
  --max-restarts <n>            Child restarts allowed [env: MCP_BRIDGE_MAX_RESTARTS] [default: 5]
  --backoff-ms <ms>             Base restart backoff [env: MCP_BRIDGE_BACKOFF_MS] [default: 1000]
  --timeout-ms <ms>             Per-request timeout [env: MCP_BRIDGE_REQUEST_TIMEOUT_MS] [default: 60000]
  --handshake-timeout-ms <ms>   Initialize timeout [default: 30000]
  --auth-token <token>          Require 'Authorization: Bearer <token>' [env: MCP_BRIDGE_AUTH_TOKEN]
  --credential-header <name>    Header forwarded to tools/call [default: x-mcp-credential]
  --protocol-version <version>  MCP protocol version offered to the child [env: MCP_BRIDGE_PROTOCOL_VERSION] [default: 2024-11-05]
  --cwd <dir>                   Working directory of the child [env: MCP_BRIDGE_CWD]

The child command may also be given as MCP_BRIDGE_COMMAND (split on whitespace).";

#[derive(Debug)]
struct Options {
    server: ServerConfig,
    bridge: BridgeConfig,
    command: ChildCommand,
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {name}: '{value}'"))
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

/// Flags win over environment variables, which win over defaults.
fn parse_args(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<Options, String> {
    let mut server = ServerConfig::default();
    let mut bridge = BridgeConfig::default();

    if let Some(host) = env("MCP_BRIDGE_HOST") {
        server = server.with_host(host);
    }
    if let Some(port) = env("MCP_BRIDGE_PORT") {
        server = server.with_port(parse_num("MCP_BRIDGE_PORT", &port)?);
    }
    if let Some(n) = env("MCP_BRIDGE_MAX_RESTARTS") {
        bridge = bridge.with_max_restarts(parse_num("MCP_BRIDGE_MAX_RESTARTS", &n)?);
    }
    if let Some(ms) = env("MCP_BRIDGE_BACKOFF_MS") {
        bridge = bridge.with_base_backoff(Duration::from_millis(parse_num(
            "MCP_BRIDGE_BACKOFF_MS",
            &ms,
        )?));
    }
    if let Some(ms) = env("MCP_BRIDGE_REQUEST_TIMEOUT_MS") {
        bridge = bridge.with_request_timeout(Duration::from_millis(parse_num(
            "MCP_BRIDGE_REQUEST_TIMEOUT_MS",
            &ms,
        )?));
    }
    if let Some(token) = env("MCP_BRIDGE_AUTH_TOKEN").filter(|t| !t.is_empty()) {
        bridge = bridge.with_auth_token(token);
    }
    if let Some(version) = env("MCP_BRIDGE_PROTOCOL_VERSION").filter(|v| !v.is_empty()) {
        bridge = bridge.with_protocol_version(version);
    }
    let mut cwd = env("MCP_BRIDGE_CWD").filter(|d| !d.is_empty());

    let mut command: Vec<String> = Vec::new();
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--host" => server = server.with_host(take_value(args, &mut i, flag)?),
            "--port" => {
                let port = parse_num(flag, take_value(args, &mut i, flag)?)?;
                server = server.with_port(port);
            }
            "--max-restarts" => {
                let n = parse_num(flag, take_value(args, &mut i, flag)?)?;
                bridge = bridge.with_max_restarts(n);
            }
            "--backoff-ms" => {
                let ms = parse_num(flag, take_value(args, &mut i, flag)?)?;
                bridge = bridge.with_base_backoff(Duration::from_millis(ms));
            }
            "--timeout-ms" => {
                let ms = parse_num(flag, take_value(args, &mut i, flag)?)?;
                bridge = bridge.with_request_timeout(Duration::from_millis(ms));
            }
            "--handshake-timeout-ms" => {
                let ms = parse_num(flag, take_value(args, &mut i, flag)?)?;
                bridge = bridge.with_handshake_timeout(Duration::from_millis(ms));
            }
            "--auth-token" => bridge = bridge.with_auth_token(take_value(args, &mut i, flag)?),
            "--credential-header" => {
                bridge = bridge.with_credential_header(take_value(args, &mut i, flag)?)
            }
            "--protocol-version" => {
                bridge = bridge.with_protocol_version(take_value(args, &mut i, flag)?)
            }
            "--cwd" => cwd = Some(take_value(args, &mut i, flag)?.to_string()),
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if command.is_empty()
        && let Some(from_env) = env("MCP_BRIDGE_COMMAND")
    {
        command = from_env.split_whitespace().map(str::to_string).collect();
    }
    let mut command = command.into_iter();
    let program = command
        .next()
        .ok_or("missing child command (pass it after `--` or set MCP_BRIDGE_COMMAND)")?;

    let mut command = ChildCommand::new(program).with_args(command);
    if let Some(cwd) = cwd {
        command = command.with_cwd(cwd);
    }

    Ok(Options {
        server,
        bridge,
        command,
    })
}

/// Initialize tracing, writing to stderr.
///
/// `RUST_LOG` takes precedence; otherwise `MCP_BRIDGE_LOG` picks the level for
/// the bridge crates. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("MCP_BRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "mcp_bridge={level},mcp_bridge_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args, |key| std::env::var(key).ok()) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();
    info!(
        command = %options.command,
        max_restarts = options.bridge.max_restarts,
        base_backoff_ms = options.bridge.base_backoff.as_millis() as u64,
        request_timeout_ms = options.bridge.request_timeout.as_millis() as u64,
        auth = options.bridge.auth_token.is_some(),
        "mcp-bridge {}",
        mcp_bridge::BRIDGE_VERSION
    );

    let spawner = Arc::new(CommandSpawner::new(options.command));
    let service = Arc::new(BridgeService::new(options.bridge, spawner));
    service.start();

    serve(options.server, service).await
}
