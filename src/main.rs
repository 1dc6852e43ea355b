//! Command-line XMPP client: logs in, sends initial presence and prints
//! connection events and inbound stanzas as JSON lines on stdout.

use std::path::PathBuf;

use serde_json::json;
use tracing::{error, info, warn};

use fluux_xmpp::filter::AnyStanza;
use fluux_xmpp::ns;
use fluux_xmpp::{
    Connection, ConnectionConfig, ConnectionEvent, Element, TlsPolicy, XmppError,
};

const PASSWORD_ENV: &str = "FLUUX_XMPP_PASSWORD";

struct Options {
    jid: String,
    password: String,
    server: Option<String>,
    tls: TlsPolicy,
    dangerous_insecure_tls: bool,
    verbose_level: Option<String>,
    log_file_path: Option<String>,
}

fn print_help() {
    eprintln!("Fluux XMPP v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-xmpp --jid=USER@DOMAIN [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID         Account to log in with (may carry a resource)");
    eprintln!("      --password=PASS   Account password (default: ${PASSWORD_ENV})");
    eprintln!("      --server=ADDR     Server to connect to: host, host:port or tls://host:port");
    eprintln!("                        (default: SRV lookup on the JID domain)");
    eprintln!("      --tls=POLICY      required (default), if-available or disabled");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP traffic");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform data dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
    eprintln!("  {PASSWORD_ENV}   Password when --password is not given");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let value = |name: &str| {
        let prefix = format!("--{name}=");
        args.iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()).map(str::to_string))
    };

    let jid = value("jid").ok_or("missing --jid")?;
    let password = value("password")
        .or_else(|| std::env::var(PASSWORD_ENV).ok())
        .ok_or_else(|| format!("missing --password (or ${PASSWORD_ENV})"))?;
    let tls = match value("tls").as_deref() {
        None | Some("required") => TlsPolicy::Required,
        Some("if-available") => TlsPolicy::IfAvailable,
        Some("disabled") => TlsPolicy::Disabled,
        Some(other) => return Err(format!("unknown TLS policy '{other}'")),
    };

    // --verbose / -v (no traffic) or --verbose=xmpp (with traffic)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default".to_string())
        } else {
            arg.strip_prefix("--verbose=").map(str::to_string)
        }
    });

    Ok(Options {
        jid,
        password,
        server: value("server"),
        tls,
        dangerous_insecure_tls: args.iter().any(|arg| arg == "--dangerous-insecure-tls"),
        verbose_level,
        log_file_path: value("log-file"),
    })
}

/// Log directory: `--log-file=<path>` overrides the platform data directory.
fn log_dir(log_file_path: Option<&str>) -> PathBuf {
    match log_file_path {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("com.processone.fluux")
            .join("logs"),
    }
}

/// File layer always at info; stderr layer only when verbose.
fn init_tracing(options: &Options) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir(options.log_file_path.as_deref());
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_xmpp=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-xmpp.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if options.verbose_level.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if options.verbose_level.as_deref() == Some("xmpp") {
            EnvFilter::new("fluux_xmpp=debug,info")
        } else {
            EnvFilter::new("fluux_xmpp=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", log_dir.display());
    guard
}

fn print_json(value: serde_json::Value) {
    println!("{value}");
}

async fn run(options: Options) -> Result<(), XmppError> {
    let mut builder = ConnectionConfig::builder(&options.jid, options.password.as_str())
        .tls(options.tls)
        .dangerous_insecure_tls(options.dangerous_insecure_tls)
        .debug_traffic(options.verbose_level.as_deref() == Some("xmpp"));
    if let Some(server) = &options.server {
        builder = builder.server(server.as_str());
    }
    let conn = Connection::new(builder.build()?);

    let mut events = conn.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                // Traffic is already logged at debug level
                Ok(ConnectionEvent::Traffic { .. }) => {}
                Ok(event) => match serde_json::to_value(&event) {
                    Ok(value) => print_json(value),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    conn.add_stanza_listener(AnyStanza, |stanza| {
        print_json(json!({ "stanza": stanza.to_xml() }));
    });

    conn.connect().await?;
    info!(jid = ?conn.bound_jid().map(|j| j.to_string()), "Logged in");
    conn.send_stanza(Element::new("presence", ns::CLIENT)).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
    }
    info!("Interrupted, disconnecting");
    conn.disconnect().await
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Try --help for usage.");
            std::process::exit(2);
        }
    };
    if options.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    // Dropping the guard stops the background log writer
    let guard = init_tracing(&options);
    if options.verbose_level.is_some() {
        eprintln!("Fluux XMPP v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
        eprintln!("---");
    }

    if let Err(e) = run(options).await {
        error!(error = %e, "Session ended with an error");
        eprintln!("error: {e}");
        drop(guard);
        std::process::exit(1);
    }
}
