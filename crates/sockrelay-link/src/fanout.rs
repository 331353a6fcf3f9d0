use sockrelay_frame::JobResult;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events a slow subscriber may fall behind before it lags.
pub const DEFAULT_FANOUT_CAPACITY: usize = 256;

/// A decoded result as seen by event-stream subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEvent {
    /// Base name of the converted path.
    pub file_name: String,
    pub result: JobResult,
}

impl From<JobResult> for ResultEvent {
    fn from(result: JobResult) -> Self {
        Self {
            file_name: result.converted_file_name().to_string(),
            result,
        }
    }
}

/// Broadcasts results to every current subscriber.
///
/// Publishing never blocks; a subscriber that falls behind loses the oldest
/// events and is told how many on its next receive.
#[derive(Debug, Clone)]
pub struct ResultFanout {
    sender: broadcast::Sender<ResultEvent>,
}

impl Default for ResultFanout {
    fn default() -> Self {
        Self::new(DEFAULT_FANOUT_CAPACITY)
    }
}

impl ResultFanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.sender.subscribe()
    }

    /// Publish a result; returns how many subscribers received it.
    pub fn publish(&self, result: JobResult) -> usize {
        let event = ResultEvent::from(result);
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!(file = %event.file_name, "no subscribers for result");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use sockrelay_frame::WorkPacket;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn result(name: &str) -> JobResult {
        JobResult::success(WorkPacket::new(name), format!("/srv/files/{name}.mp4"))
    }

    #[test]
    fn every_subscriber_sees_each_event() {
        let fanout = ResultFanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        assert_eq!(fanout.publish(result("1.mov")), 2);

        assert_eq!(a.try_recv().expect("a should receive").file_name, "1.mov.mp4");
        assert_eq!(b.try_recv().expect("b should receive").file_name, "1.mov.mp4");
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let fanout = ResultFanout::default();
        assert_eq!(fanout.publish(result("x")), 0);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_lags_instead_of_blocking() {
        let fanout = ResultFanout::new(2);
        let mut slow = fanout.subscribe();
        for i in 0..5 {
            fanout.publish(result(&i.to_string()));
        }

        assert!(matches!(slow.try_recv(), Err(TryRecvError::Lagged(3))));
        assert_eq!(slow.try_recv().expect("newest events kept").file_name, "3.mp4");
    }
}
