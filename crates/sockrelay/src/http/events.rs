use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, Stream};
use sockrelay_link::ResultEvent;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub(super) async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = converted_names(state.fanout.subscribe(), state.shutdown.clone());
    debug!(subscribers = state.fanout.subscriber_count(), "event stream opened");
    (
        [(ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
}

/// One `data: <file name>` event per result, until shutdown or the fanout closes.
fn converted_names(
    receiver: Receiver<ResultEvent>,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((receiver, shutdown), |(mut receiver, shutdown)| async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return None,
                received = receiver.recv() => received,
            };
            match received {
                Ok(event) => {
                    let item = Ok(Event::default().data(event.file_name));
                    return Some((item, (receiver, shutdown)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged, results dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
