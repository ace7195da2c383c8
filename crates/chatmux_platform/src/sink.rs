#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ChatMessage;

/// A normalized message as carried by the sink.
pub type SharedMessage = Arc<dyn ChatMessage>;

/// Callback every adapter invokes for each normalized inbound message.
pub type Handler = Arc<dyn Fn(SharedMessage) + Send + Sync>;

/// Consumer half of the fan-in channel.
pub type SinkReader = mpsc::Receiver<SharedMessage>;

const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Multi-producer fan-in point for all adapters.
///
/// Backpressure policy: the queue is bounded and publishing never blocks a
/// read loop. When the consumer falls behind, the newest message is dropped
/// and counted; drops are reported at most once per report interval.
/// Producers never close the channel.
#[derive(Clone)]
pub struct Sink {
	tx: mpsc::Sender<SharedMessage>,
	dropped: Arc<AtomicU64>,
	last_report: Arc<Mutex<Instant>>,
}

impl Sink {
	/// Build a sink and its single consumer end.
	pub fn bounded(capacity: usize) -> (Self, SinkReader) {
		let (tx, rx) = mpsc::channel(capacity);
		let sink = Self {
			tx,
			dropped: Arc::new(AtomicU64::new(0)),
			last_report: Arc::new(Mutex::new(Instant::now())),
		};
		(sink, rx)
	}

	/// Enqueue a message, dropping it if the queue is full.
	pub fn publish(&self, message: SharedMessage) {
		if self.tx.try_send(message).is_err() {
			let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;

			let mut last = self.last_report.lock();
			if last.elapsed() >= DROP_REPORT_INTERVAL {
				*last = Instant::now();
				warn!(total_dropped = total, "sink full; dropping chat messages");
			}
		}
	}

	/// Handler closure adapters are constructed with.
	pub fn handler(&self) -> Handler {
		let sink = self.clone();
		Arc::new(move |message| sink.publish(message))
	}

	/// Total messages dropped since construction.
	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use chatmux_domain::Html;

	use super::*;

	struct StubMessage(&'static str);

	impl ChatMessage for StubMessage {
		fn render_body(&self) -> Html {
			Html::new(self.0)
		}
		fn render_nickname(&self) -> Html {
			Html::new("")
		}
		fn render_combined(&self) -> Html {
			Html::new(self.0)
		}
		fn chat_name(&self) -> &'static str {
			"stub"
		}
		fn plain_text(&self) -> &str {
			self.0
		}
		fn mentions_user(&self, _name: &str) -> bool {
			false
		}
		fn sender_name(&self) -> &str {
			"stub"
		}
		fn is_user_message(&self) -> bool {
			true
		}
		fn channel_name(&self) -> String {
			"stub".to_string()
		}
		fn sender_color(&self) -> String {
			"#000".to_string()
		}
		fn is_moderation_event(&self) -> bool {
			false
		}
	}

	#[tokio::test]
	async fn fan_in_preserves_per_producer_order() {
		let (sink, mut rx) = Sink::bounded(16);

		let handler = sink.handler();
		handler(Arc::new(StubMessage("first")));
		handler(Arc::new(StubMessage("second")));

		assert_eq!(rx.recv().await.unwrap().plain_text(), "first");
		assert_eq!(rx.recv().await.unwrap().plain_text(), "second");
		assert_eq!(sink.dropped(), 0);
	}

	#[tokio::test]
	async fn full_queue_drops_newest_and_counts() {
		let (sink, mut rx) = Sink::bounded(1);

		sink.publish(Arc::new(StubMessage("kept")));
		sink.publish(Arc::new(StubMessage("dropped")));

		assert_eq!(sink.dropped(), 1);
		assert_eq!(rx.recv().await.unwrap().plain_text(), "kept");

		// Capacity freed; publishing works again.
		sink.publish(Arc::new(StubMessage("later")));
		assert_eq!(rx.recv().await.unwrap().plain_text(), "later");
		assert_eq!(sink.dropped(), 1);
	}

	#[tokio::test]
	async fn producers_share_one_consumer() {
		let (sink, mut rx) = Sink::bounded(8);

		let a = sink.handler();
		let b = sink.handler();
		a(Arc::new(StubMessage("from-a")));
		b(Arc::new(StubMessage("from-b")));

		let mut seen = vec![rx.recv().await.unwrap().plain_text().to_string()];
		seen.push(rx.recv().await.unwrap().plain_text().to_string());
		seen.sort();
		assert_eq!(seen, ["from-a", "from-b"]);
	}
}
