//! XMPP server resolution: server input parsing and SRV record lookup.
//!
//! Turns the configured server input (bare domain, `tls://host:port`, ...) or
//! the account domain into an ordered list of [`Endpoint`]s. Callers try them
//! in order and fall through to the next one on connection failure.

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::XmppError;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// How the TCP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP (port 5222), upgraded with STARTTLS when negotiated.
    StartTls,
    /// TLS from the first byte (port 5223, XEP-0368).
    DirectTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain for TLS SNI and certificate checks when `host` is an SRV
    /// target (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl Endpoint {
    /// Name used for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint: SRV resolution is skipped.
    Direct(Endpoint),
    /// Domain only: resolve through SRV.
    Domain(String),
}

/// Split an optional `?domain=` parameter off `host:port`.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query.strip_prefix("domain=").map(str::to_string),
        ),
        None => (input, None),
    }
}

fn explicit(host_port: &str, default_port: u16, mode: ConnectionMode, domain: Option<String>) -> ParsedServer {
    // rsplit_once keeps IPv6 literals intact
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (host_port, default_port),
        },
        None => (host_port, default_port),
    };
    ParsedServer::Direct(Endpoint {
        host: host.to_string(),
        port,
        mode,
        domain,
    })
}

/// Parse server input.
///
/// Supported formats:
/// - `tls://host[:port][?domain=d]`  direct TLS, default port 5223
/// - `tcp://host[:port][?domain=d]`  STARTTLS, default port 5222
/// - `host:port`                     5223 means direct TLS, anything else STARTTLS
/// - `domain`                        SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        let (host_port, domain) = split_domain_param(rest);
        return explicit(host_port, 5223, ConnectionMode::DirectTls, domain);
    }
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        let (host_port, domain) = split_domain_param(rest);
        return explicit(host_port, 5222, ConnectionMode::StartTls, domain);
    }
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let mode = if port == 5223 {
                ConnectionMode::DirectTls
            } else {
                ConnectionMode::StartTls
            };
            return ParsedServer::Direct(Endpoint {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            });
        }
    }
    ParsedServer::Domain(trimmed.to_string())
}

/// Endpoints for the configured server input, or for the account domain.
pub async fn endpoints_for(server: Option<&str>, domain: &str) -> Result<Vec<Endpoint>, XmppError> {
    match server.map(parse_server_input) {
        Some(ParsedServer::Direct(mut endpoint)) => {
            if endpoint.domain.is_none() && endpoint.host != domain {
                endpoint.domain = Some(domain.to_string());
            }
            Ok(vec![endpoint])
        }
        Some(ParsedServer::Domain(server_domain)) => resolve_xmpp_server(&server_domain).await,
        None => resolve_xmpp_server(domain).await,
    }
}

/// Resolve an XMPP domain through SRV records (RFC 6120 §3.2).
///
/// Returns candidates in connection-attempt order:
/// 1. `_xmpps-client._tcp.{domain}` records (direct TLS)
/// 2. `_xmpp-client._tcp.{domain}` records (STARTTLS)
/// 3. `domain:5222` with STARTTLS, only if no SRV record exists at all
pub async fn resolve_xmpp_server(domain: &str) -> Result<Vec<Endpoint>, XmppError> {
    if domain.is_empty() {
        return Err(XmppError::Resolve("empty domain".to_string()));
    }
    let resolve_started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, falling back to default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    for (prefix, mode) in [
        ("_xmpps-client._tcp", ConnectionMode::DirectTls),
        ("_xmpp-client._tcp", ConnectionMode::StartTls),
    ] {
        endpoints.extend(srv_endpoints(&resolver, domain, prefix, mode).await);
    }

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback {}:5222",
            domain
        );
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: 5222,
            mode: ConnectionMode::StartTls,
            domain: None,
        });
    } else {
        info!(
            domain,
            total = endpoints.len(),
            resolve_total_ms = elapsed_ms(resolve_started),
            "SRV resolution complete"
        );
    }
    Ok(endpoints)
}

async fn srv_endpoints(
    resolver: &TokioAsyncResolver,
    domain: &str,
    prefix: &str,
    mode: ConnectionMode,
) -> Vec<Endpoint> {
    let srv_name = format!("{prefix}.{domain}");
    let started = Instant::now();
    let lookup = match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup
        .iter()
        .map(|r| {
            (
                r.priority(),
                r.weight(),
                r.target().to_string().trim_end_matches('.').to_string(),
                r.port(),
            )
        })
        .collect();
    sort_srv_records(&mut records);

    let endpoints: Vec<Endpoint> = records
        .into_iter()
        // RFC 2782: target "." means the service is decidedly not available
        .filter(|(_, _, target, _)| !target.is_empty())
        .map(|(priority, weight, host, port)| {
            info!(domain, host = %host, port, priority, weight, ?mode, "SRV record");
            Endpoint {
                host,
                port,
                mode,
                domain: Some(domain.to_string()),
            }
        })
        .collect();
    info!(domain, srv = %srv_name, count = endpoints.len(), lookup_ms = elapsed_ms(started), "SRV resolved");
    endpoints
}

/// Priority ascending (lower preferred), then weight descending (RFC 2782).
fn sort_srv_records(records: &mut [(u16, u16, String, u16)]) {
    records.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
}
