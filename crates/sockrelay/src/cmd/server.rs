use std::sync::atomic::Ordering;
use std::sync::Arc;

use sockrelay::mux::MultiplexerConfig;
use sockrelay::relay::{CommandProcessor, DispatchConfig, GatewayConfig, RelayConfig, RelayServer};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, ServerArgs};
use crate::exit::{relay_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: ServerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = relay_config(&args)?;
    let processor = CommandProcessor::new()
        .with_program(args.ffmpeg)
        .with_video_codec(args.video_codec);
    info!(
        program = %processor.program().display(),
        workers = config.dispatch.workers,
        "starting consumer"
    );

    let server = RelayServer::bind(config, Arc::new(processor))
        .map_err(|err| relay_error("consumer startup failed", err))?;

    let running = server.shutdown_flag();
    install_ctrlc_handler(move || running.store(false, Ordering::Release))?;

    print_listening("consumer", server.local_addr(), format);
    server
        .run()
        .map_err(|err| relay_error("consumer stopped", err))?;
    Ok(SUCCESS)
}

fn relay_config(args: &ServerArgs) -> CliResult<RelayConfig> {
    let defaults = DispatchConfig::default();
    Ok(RelayConfig {
        listen: args.listen.clone(),
        gateway: GatewayConfig {
            path: args.path.clone(),
            handshake_timeout: parse_duration(&args.handshake_timeout)?,
            ..GatewayConfig::default()
        },
        dispatch: DispatchConfig {
            workers: args.workers.unwrap_or(defaults.workers).max(1),
            queue_capacity: args.queue.max(1),
            ..defaults
        },
        multiplexer: MultiplexerConfig {
            max_connections: args.max_connections,
            ..MultiplexerConfig::default()
        },
        raise_fd_limit: !args.keep_fd_limit,
    })
}
