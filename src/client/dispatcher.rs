//! Inbound Dispatcher
//!
//! One task per client drains every inbound frame, whatever channel it came
//! from, decodes it and hands the result to the presentation sink. Frames
//! that fail to decode are reported to the observability sink and dropped;
//! the loop carries on with the next frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{self, WireFrame};
use crate::sources::{ObservabilitySink, PresentationSink};
use crate::transport::InboundFrame;

/// Counters for dispatched frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Frames decoded and handed to the presentation sink
    pub delivered: u64,
    /// Frames dropped because they failed to decode
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the running dispatch loop
pub struct InboundDispatcher {
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

impl InboundDispatcher {
    /// Start the dispatch loop
    ///
    /// Must be called from within a Tokio runtime. The loop ends when every
    /// sender for `inbound` is dropped or [`shutdown`](Self::shutdown) is called.
    pub fn spawn(
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
        presentation: Arc<dyn PresentationSink>,
        observer: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let loop_counters = Arc::clone(&counters);

        let handle = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                dispatch_frame(frame, presentation.as_ref(), observer.as_ref(), &loop_counters);
            }
            tracing::debug!("Inbound dispatcher stopped");
        });

        Self { counters, handle }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop without waiting for queued frames
    pub fn shutdown(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

fn dispatch_frame(
    frame: InboundFrame,
    presentation: &dyn PresentationSink,
    observer: &dyn ObservabilitySink,
    counters: &Counters,
) {
    let decoded = WireFrame::from_bytes(&frame.payload).and_then(|wire| codec::decode(&wire));

    match decoded {
        Ok(message) => {
            tracing::debug!(
                topic = %frame.topic,
                coordinates = %message.coordinates,
                date = %message.captured_date,
                image_bytes = message.image_bytes.len(),
                "Received message"
            );
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            presentation.on_message(&frame.topic, message);
        }
        Err(e) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            observer.decode_failed(&frame.topic, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, Coordinates, GeoPhotoMessage};
    use crate::sources::Delivery;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        failures: Mutex<Vec<(String, CodecError)>>,
    }

    impl ObservabilitySink for RecordingObserver {
        fn decode_failed(&self, topic: &str, error: &CodecError) {
            self.failures
                .lock()
                .unwrap()
                .push((topic.to_string(), error.clone()));
        }
    }

    fn valid_frame(topic: &str, lat: f64) -> InboundFrame {
        let message = GeoPhotoMessage::new(
            Coordinates::new(lat, 10.0),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            vec![0xFF, 0xD8, 0xFF, 0xD9],
        );
        InboundFrame {
            topic: topic.to_string(),
            payload: codec::encode(&message).unwrap().into_payload(),
        }
    }

    #[test]
    fn test_dispatch_frame_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let observer = RecordingObserver::default();
        let counters = Counters::default();

        dispatch_frame(valid_frame("c1", 1.0), &tx, &observer, &counters);

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.topic, "c1");
        assert_eq!(delivery.message.coordinates.latitude, 1.0);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 1);
        assert!(observer.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_frame_reports_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let observer = RecordingObserver::default();
        let counters = Counters::default();

        let frames = [
            Bytes::from_static(&[0xC3, 0x28]),
            Bytes::from_static(b"{\"data\":\"2024-01-01\"}"),
        ];
        for payload in frames {
            let frame = InboundFrame {
                topic: "c1".to_string(),
                payload,
            };
            dispatch_frame(frame, &tx, &observer, &counters);
        }

        assert!(rx.try_recv().is_err());
        assert_eq!(counters.dropped.load(Ordering::Relaxed), 2);
        let failures = observer.failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|(topic, e)| topic == "c1" && matches!(e, CodecError::Decoding(_))));
    }

    #[tokio::test]
    async fn test_loop_survives_bad_frames_and_keeps_order() {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let observer = Arc::new(RecordingObserver::default());

        let dispatcher = InboundDispatcher::spawn(inbound_rx, Arc::new(tx), observer.clone());

        inbound_tx.send(valid_frame("c1", 1.0)).unwrap();
        inbound_tx
            .send(InboundFrame {
                topic: "c1".to_string(),
                payload: Bytes::from_static(b"garbage"),
            })
            .unwrap();
        inbound_tx.send(valid_frame("c2", 2.0)).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.topic.as_str(), first.message.coordinates.latitude), ("c1", 1.0));
        assert_eq!((second.topic.as_str(), second.message.coordinates.latitude), ("c2", 2.0));

        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                delivered: 2,
                dropped: 1
            }
        );
        assert_eq!(observer.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_when_senders_drop() {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel::<Delivery>();
        let dispatcher = InboundDispatcher::spawn(
            inbound_rx,
            Arc::new(tx),
            Arc::new(crate::sources::TracingObserver),
        );

        drop(inbound_tx);
        for _ in 0..100 {
            if !dispatcher.is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!dispatcher.is_running());
    }
}
