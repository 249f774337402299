//! loomwire - message echo server and client over any registered transport

use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use loomwire::aio::{pool, AsyncOp};
use loomwire::common::{Configurable, MessagePipe, OptionName};
use loomwire::config::Config;
use loomwire::error::{Error, Result};
use loomwire::{metrics, transport};

/// Upper bound on a dial, handshake included
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let config = match config_type.as_str() {
            "client" => Config::default_client(),
            "server" => Config::default_server(),
            _ => {
                eprintln!("Unknown config type: {}. Use 'client' or 'server'", config_type);
                std::process::exit(1);
            }
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("Failed to encode config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // RUST_LOG directives win over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    pool::configure(config.pool_config())?;
    metrics::init_metrics();

    match args.command {
        Some(Command::Listen { url }) => run_listen(&config, &url),
        Some(Command::Dial { url, message }) => run_dial(&config, &url, &message),
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}

/// Apply file defaults and TLS credentials to a dialer or listener
fn prepare<T: Configurable + ?Sized>(config: &Config, target: &T, url: &str) -> Result<()> {
    config.apply_defaults(target)?;
    if url.starts_with("tls+") {
        if let Some(tls) = config.tls_config()? {
            target.set_tls(tls)?;
        }
    }
    Ok(())
}

fn run_listen(config: &Config, url: &str) -> Result<()> {
    let listener = transport::listener(url)?;
    prepare(config, &*listener, url)?;
    listener.listen()?;
    info!(
        "loomwire v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.get_string(OptionName::Url)?
    );

    let handle = pool::handle()?;
    loop {
        let op = AsyncOp::new();
        listener.accept(&op);
        op.wait();
        if let Err(e) = op.result() {
            match after_accept_error(&e) {
                AfterAccept::Stop => {
                    info!("Listener stopped: {}", e);
                    break;
                }
                AfterAccept::Retry => debug!("Accept failed: {}", e),
                AfterAccept::Backoff => {
                    warn!("Accept failed: {}", e);
                    std::thread::sleep(ACCEPT_BACKOFF);
                }
            }
            continue;
        }
        if let Some(conn) = op.take_connection(0) {
            handle.spawn(echo(MessagePipe::new(conn)));
        }
    }

    info!("Goodbye!");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum AfterAccept {
    Stop,
    Retry,
    Backoff,
}

/// The listener is gone, one peer misbehaved, or the failure may persist
fn after_accept_error(err: &Error) -> AfterAccept {
    match err {
        Error::ConnectionClosed | Error::Canceled | Error::State(_) => AfterAccept::Stop,
        Error::HandshakeFailed(_) | Error::Timeout | Error::ConnectionReset => AfterAccept::Retry,
        _ => AfterAccept::Backoff,
    }
}

/// Send every message back until the peer goes away
async fn echo(pipe: MessagePipe) {
    let peer = pipe
        .connection()
        .get_addr(OptionName::RemoteAddr)
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
    info!("Connection from {}", peer);

    let op = AsyncOp::new();
    loop {
        pipe.recv(&op);
        op.wait_async().await;
        if let Err(e) = op.result() {
            debug!("{}: {}", peer, e);
            break;
        }
        let Some(msg) = op.take_message(0) else {
            break;
        };
        debug!("{} sent {} bytes", peer, msg.len());

        op.set_iov(vec![BytesMut::from(&msg[..])]);
        pipe.send(&op);
        op.wait_async().await;
        if let Err(e) = op.result() {
            debug!("{}: {}", peer, e);
            break;
        }
    }
    info!("Connection from {} closed", peer);
}

fn run_dial(config: &Config, url: &str, message: &str) -> Result<()> {
    let dialer = transport::dialer(url)?;
    prepare(config, &*dialer, url)?;

    let op = AsyncOp::new();
    op.set_timeout(Some(DIAL_TIMEOUT));
    dialer.dial(&op);
    op.wait();
    op.result()?;
    let conn = op
        .take_connection(0)
        .ok_or_else(|| Error::State("dial produced no connection".into()))?;
    let pipe = MessagePipe::new(conn);

    let op = AsyncOp::new();
    op.set_iov(vec![BytesMut::from(message.as_bytes())]);
    pipe.send(&op);
    op.wait();
    op.result()?;

    pipe.recv(&op);
    op.wait();
    op.result()?;
    let reply = op.take_message(0).unwrap_or_default();
    println!("{}", String::from_utf8_lossy(&reply));

    pipe.close();
    debug!("{}", metrics::gather());
    Ok(())
}

enum Command {
    Listen { url: String },
    Dial { url: String, message: String },
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: Option<String>,
    version: bool,
    command: Option<Command>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = None;
        let mut version = false;
        let mut positional = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => {
                    if i + 1 < args.len() {
                        gen_config = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') => positional.push(arg.to_string()),
                _ => {}
            }
            i += 1;
        }

        let command = match positional.as_slice() {
            [cmd, url] if cmd == "listen" => Some(Command::Listen { url: url.clone() }),
            [cmd, url, message] if cmd == "dial" => Some(Command::Dial {
                url: url.clone(),
                message: message.clone(),
            }),
            _ => None,
        };

        Self {
            config,
            gen_config,
            version,
            command,
        }
    }
}

fn print_help() {
    println!(
        r#"loomwire - asynchronous stream messaging over TCP and TLS

USAGE:
    loomwire [OPTIONS] listen <URL>
    loomwire [OPTIONS] dial <URL> <MESSAGE>

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config <TYPE>     Generate example config (client/server)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    loomwire listen tcp://127.0.0.1:5555
    loomwire dial tcp://127.0.0.1:5555 hello
    loomwire -c server.json listen tls+tcp://*:5556
    loomwire -c client.json dial tls+tcp://localhost:5556 hello
    loomwire --gen-config server > server.json
"#
    );
}

fn print_version() {
    println!("loomwire v{}", env!("CARGO_PKG_VERSION"));
    println!("Asynchronous stream messaging over TCP and TLS");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_errors() {
        assert_eq!(after_accept_error(&Error::ConnectionClosed), AfterAccept::Stop);
        assert_eq!(after_accept_error(&Error::Canceled), AfterAccept::Stop);
        assert_eq!(
            after_accept_error(&Error::HandshakeFailed("bad mac".into())),
            AfterAccept::Retry
        );
        let exhausted = std::io::Error::new(std::io::ErrorKind::Other, "too many open files");
        assert_eq!(after_accept_error(&Error::from(exhausted)), AfterAccept::Backoff);
    }
}
