use std::sync::Arc;

use sockrelay::http::{serve, AppState, HttpConfig};
use sockrelay::link::{LinkConfig, ResilientLink};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, ClientArgs};
use crate::exit::{io_error, link_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: ClientArgs, format: OutputFormat) -> CliResult<i32> {
    let link_config = LinkConfig {
        dial_timeout: parse_duration(&args.dial_timeout)?,
        queue_capacity: args.queue,
        retry_failed_packet: args.retry_failed,
        ..LinkConfig::new(args.upstream)
    };
    let link = ResilientLink::connect(link_config)
        .map_err(|err| link_error("upstream dial failed", err))?;
    info!(upstream = link.url(), "link established");

    let http = HttpConfig {
        listen: args.listen,
        files_dir: args.files_dir,
        static_dir: args.static_dir,
        ..HttpConfig::default()
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    install_ctrlc_handler(move || on_signal.cancel())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sockrelay-http")
        .build()
        .map_err(|err| io_error("async runtime startup failed", err))?;

    let listen = http.listen.clone();
    let state = AppState::new(http, Arc::new(link.sender()), link.fanout().clone())
        .with_shutdown(shutdown);
    let served = runtime.block_on(async move {
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|err| io_error(&format!("failed to bind {listen}"), err))?;
        let addr = listener
            .local_addr()
            .map_err(|err| io_error("listener address unavailable", err))?;
        print_listening("producer", addr, format);
        serve(listener, state)
            .await
            .map_err(|err| io_error("producer HTTP failed", err))
    });

    link.shutdown();
    served.map(|()| SUCCESS)
}
