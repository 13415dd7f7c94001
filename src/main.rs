use clap::Parser;
use std::io;
use std::time::Duration;

use detour_direct::context::TIMEOUT_TO_CONNECT;
use detour_direct::probe::{self, ProbeConfig};

#[derive(Parser)]
#[command(name = "detour-probe")]
#[command(about = "Probe addresses over the direct path and detect tampering", long_about = None)]
struct Args {
    /// Addresses to probe (host:port)
    #[arg(required = true)]
    addrs: Vec<String>,

    /// ISO 3166-1 alpha-2 country code selecting detection rules
    #[arg(short, long, default_value = "")]
    country: String,

    /// Connect timeout in seconds
    #[arg(short, long, default_value_t = TIMEOUT_TO_CONNECT.as_secs())]
    timeout: u64,

    /// Request to send after connecting ("\r\n" escapes are expanded)
    #[arg(short, long)]
    request: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .try_init();
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = ProbeConfig {
        addrs: args.addrs,
        country: args.country,
        connect_timeout: Duration::from_secs(args.timeout),
        request: args
            .request
            .map(|r| r.replace("\\r", "\r").replace("\\n", "\n").into_bytes()),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(probe::run(config))
}
