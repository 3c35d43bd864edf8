//! Command-line interface definitions for mitm-cache-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Caching forward proxy with TLS interception.
///
/// mitm-cache-proxy relays plain HTTP requests and intercepts HTTPS CONNECT
/// tunnels with per-domain certificates signed by a process-lifetime root.
/// Cacheable GET responses are served from memory. Import the root
/// certificate logged at startup into the client's trust store.
#[derive(Parser, Debug, Default)]
#[command(name = "mitm-cache-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long = "listen-address", value_name = "IP")]
    pub listen_address: Option<IpAddr>,

    /// Port to listen on.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Log request and response headers.
    #[arg(long = "dump-headers")]
    pub dump_headers: bool,

    /// Log POST request bodies.
    #[arg(long = "dump-post-data")]
    pub dump_post_data: bool,

    /// Log response bodies.
    #[arg(long = "dump-response-data")]
    pub dump_response_data: bool,

    /// Disable the response cache.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Directory receiving the generated certificates.
    ///
    /// Defaults to a fresh private temporary directory, removed on exit.
    #[arg(long = "cert-dir", value_name = "PATH")]
    pub cert_dir: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Log filter directive selected by `-v` flags, if any.
    pub fn verbosity_filter(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }
}
