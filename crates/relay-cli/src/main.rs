use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use relay_codec::iproto;
use relay_core::{Connector, EventLoop, Handler, HandlerContext, RelayConfig, StreamRef};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Schema id stamped on every locally-answered response when no upstream
/// is configured for a request's stream.
const MOCK_SCHEMA_ID: u32 = 1;

/// Version line used for a synthetic greeting when the proxy has no
/// upstream to relay a real one from.
const SYNTHETIC_VERSION: &str = "Tarantool 2.10.0 (relay)";
const SYNTHETIC_SALT: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

#[derive(Parser, Debug)]
#[command(name = "relay-proxy", about = "Programmable Iproto reverse proxy")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log verbosity, forwarded to `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Exit codes distinguish "config is wrong" from "couldn't bind/listen"
/// from "the loop died"; §6 doesn't mandate specific values beyond 0 on
/// clean shutdown.
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_ERROR: u8 = 2;
const EXIT_LOOP_ERROR: u8 = 3;

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match RelayConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let has_upstreams = !config.upstreams.is_empty();
    let handler = build_default_handler(has_upstreams);
    let connector = Connector::new(config.listen_addr.clone(), config.listen_port, config.upstreams.clone(), handler);

    let mut event_loop = match EventLoop::new(&config, connector) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(error = %e, "failed to bind/listen");
            return ExitCode::from(EXIT_BIND_ERROR);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        running_for_handler.store(false, std::sync::atomic::Ordering::Relaxed);
    }) {
        error!(error = %e, "failed to install signal handler");
        return ExitCode::from(EXIT_BIND_ERROR);
    }

    info!(addr = %config.listen_addr, port = config.listen_port, upstreams = config.upstreams.len(), "relay-proxy listening");

    match event_loop.run(&running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "event loop exited with an error");
            ExitCode::from(EXIT_LOOP_ERROR)
        }
    }
}

/// A reference handler: forwards client requests to upstream instance 0
/// when one is configured (relaying its real greeting through once), or
/// answers every request locally with OK and synthesizes a greeting
/// otherwise. Deployments with routing or fan-out policy beyond this
/// should supply their own `Handler` instead of this default.
fn build_default_handler(has_upstreams: bool) -> Handler {
    let synthetic_greeting =
        relay_codec::encode_greeting(SYNTHETIC_VERSION, SYNTHETIC_SALT).expect("synthetic greeting fits in 63 chars");

    Box::new(move |ctx: &mut HandlerContext| {
        if ctx.is_recv_from_client() {
            if ctx.is_client_first_request() && !has_upstreams {
                let _ = ctx.deliver_encoded_greeting(&synthetic_greeting);
            }
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                if has_upstreams {
                    if ctx.connect(0).is_ok() {
                        let _ = ctx.send_decoded_to_stream(StreamRef::Upstream(0), n);
                    }
                } else {
                    match ctx.create_message(msg.header.sync, MOCK_SCHEMA_ID, iproto::code::OK, None) {
                        Ok(resp_len) => {
                            let _ = ctx.send_encoded_to_client(resp_len);
                        }
                        Err(e) => error!(error = %e, "failed to encode local response"),
                    }
                }
                ctx.skip_last_decoded_message(n);
            }
        } else if ctx.is_greeting_expected() {
            let _ = ctx.deliver_decoded_greeting();
        } else {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                let _ = ctx.send_decoded_to_client(n);
                ctx.skip_last_decoded_message(n);
            }
        }
    })
}
