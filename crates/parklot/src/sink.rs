//! Presentation sink: where vehicle transitions are reported for rendering.
//!
//! Sinks are not assumed to be safe for concurrent use, and they may block
//! (animating a car out of the lot takes time). Vehicles therefore never call
//! a sink directly. They push [`SinkEvent`]s onto an unbounded queue through a
//! [`SinkHandle`]; a single dedicated thread owns the sink and delivers events
//! in queue order. The thread is a plain OS thread, outside the runtime.

use std::io::Write;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::permit::SlotIndex;
use crate::vehicle::VehicleId;

/// Receiver of vehicle lifecycle notifications.
pub trait PresentationSink: Send + 'static {
    fn on_approach(&mut self, vehicle: VehicleId);
    fn on_entered(&mut self, vehicle: VehicleId, slot: SlotIndex);
    fn on_queued_to_depart(&mut self, vehicle: VehicleId);
    fn on_departed(&mut self, vehicle: VehicleId);

    /// Vehicle gave up waiting for admission (run cancelled).
    fn on_abandoned(&mut self, _vehicle: VehicleId) {}

    /// Queue drained and every handle dropped. Last call the sink receives.
    fn on_closed(&mut self) {}
}

/// One notification, as queued for the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    Approach { vehicle: VehicleId },
    Entered { vehicle: VehicleId, slot: SlotIndex },
    QueuedToDepart { vehicle: VehicleId },
    Departed { vehicle: VehicleId },
    Abandoned { vehicle: VehicleId },
}

impl SinkEvent {
    pub fn vehicle(&self) -> VehicleId {
        match *self {
            SinkEvent::Approach { vehicle }
            | SinkEvent::Entered { vehicle, .. }
            | SinkEvent::QueuedToDepart { vehicle }
            | SinkEvent::Departed { vehicle }
            | SinkEvent::Abandoned { vehicle } => vehicle,
        }
    }

    fn deliver<S: PresentationSink + ?Sized>(self, sink: &mut S) {
        match self {
            SinkEvent::Approach { vehicle } => sink.on_approach(vehicle),
            SinkEvent::Entered { vehicle, slot } => sink.on_entered(vehicle, slot),
            SinkEvent::QueuedToDepart { vehicle } => sink.on_queued_to_depart(vehicle),
            SinkEvent::Departed { vehicle } => sink.on_departed(vehicle),
            SinkEvent::Abandoned { vehicle } => sink.on_abandoned(vehicle),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to start sink dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sink dispatch thread exited without returning the sink (sink panicked)")]
    Panicked,
}

/// Cloneable, non-blocking entry point to the dispatch queue.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl SinkHandle {
    /// Handle whose events go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue an event. Never blocks; a closed queue drops the event.
    pub fn notify(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "Sink queue closed - event dropped");
        }
    }
}

/// Owner of the dispatch thread. Await [`SinkDispatcher::finish`] after every
/// [`SinkHandle`] is gone to get the sink back.
pub struct SinkDispatcher<S> {
    done_rx: oneshot::Receiver<S>,
}

impl<S: PresentationSink> SinkDispatcher<S> {
    pub async fn finish(self) -> Result<S, SinkError> {
        self.done_rx.await.map_err(|_| SinkError::Panicked)
    }
}

/// Move `sink` onto its own thread and return the handle that feeds it.
pub fn spawn_dispatcher<S: PresentationSink>(
    mut sink: S,
) -> Result<(SinkHandle, SinkDispatcher<S>), SinkError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SinkEvent>();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("parklot-sink".to_string())
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                event.deliver(&mut sink);
            }
            sink.on_closed();
            let _ = done_tx.send(sink);
        })
        .map_err(SinkError::Spawn)?;

    Ok((SinkHandle { tx }, SinkDispatcher { done_rx }))
}

/// Reports each transition as a tracing event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl PresentationSink for TracingSink {
    fn on_approach(&mut self, vehicle: VehicleId) {
        tracing::info!(%vehicle, "Vehicle approaching");
    }

    fn on_entered(&mut self, vehicle: VehicleId, slot: SlotIndex) {
        tracing::info!(%vehicle, %slot, "Vehicle parked");
    }

    fn on_queued_to_depart(&mut self, vehicle: VehicleId) {
        tracing::info!(%vehicle, "Vehicle queued to depart");
    }

    fn on_departed(&mut self, vehicle: VehicleId) {
        tracing::info!(%vehicle, "Vehicle departed");
    }

    fn on_abandoned(&mut self, vehicle: VehicleId) {
        tracing::warn!(%vehicle, "Vehicle left without parking");
    }
}

/// Writes one JSON object per event, newline-delimited.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write(&mut self, event: SinkEvent) {
        let result = serde_json::to_writer(&mut self.writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"));
        if let Err(e) = result {
            tracing::warn!(error = %e, ?event, "Failed to write sink event");
        }
    }
}

impl<W: Write + Send + 'static> PresentationSink for JsonLinesSink<W> {
    fn on_approach(&mut self, vehicle: VehicleId) {
        self.write(SinkEvent::Approach { vehicle });
    }

    fn on_entered(&mut self, vehicle: VehicleId, slot: SlotIndex) {
        self.write(SinkEvent::Entered { vehicle, slot });
    }

    fn on_queued_to_depart(&mut self, vehicle: VehicleId) {
        self.write(SinkEvent::QueuedToDepart { vehicle });
    }

    fn on_departed(&mut self, vehicle: VehicleId) {
        self.write(SinkEvent::Departed { vehicle });
    }

    fn on_abandoned(&mut self, vehicle: VehicleId) {
        self.write(SinkEvent::Abandoned { vehicle });
    }

    fn on_closed(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "Failed to flush sink output");
        }
    }
}

/// Keeps every event in memory, in delivery order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Vec<SinkEvent>,
    closed: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// Events for one vehicle, in order.
    pub fn events_for(&self, vehicle: VehicleId) -> Vec<SinkEvent> {
        self.events
            .iter()
            .copied()
            .filter(|e| e.vehicle() == vehicle)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PresentationSink for RecordingSink {
    fn on_approach(&mut self, vehicle: VehicleId) {
        self.events.push(SinkEvent::Approach { vehicle });
    }

    fn on_entered(&mut self, vehicle: VehicleId, slot: SlotIndex) {
        self.events.push(SinkEvent::Entered { vehicle, slot });
    }

    fn on_queued_to_depart(&mut self, vehicle: VehicleId) {
        self.events.push(SinkEvent::QueuedToDepart { vehicle });
    }

    fn on_departed(&mut self, vehicle: VehicleId) {
        self.events.push(SinkEvent::Departed { vehicle });
    }

    fn on_abandoned(&mut self, vehicle: VehicleId) {
        self.events.push(SinkEvent::Abandoned { vehicle });
    }

    fn on_closed(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> VehicleId {
        VehicleId::new(n)
    }

    #[tokio::test]
    async fn dispatcher_delivers_in_queue_order() {
        let (handle, dispatcher) = spawn_dispatcher(RecordingSink::new()).unwrap();
        handle.notify(SinkEvent::Approach { vehicle: id(1) });
        handle.notify(SinkEvent::Entered {
            vehicle: id(1),
            slot: SlotIndex::new(4),
        });
        handle.notify(SinkEvent::Approach { vehicle: id(2) });
        drop(handle);

        let sink = dispatcher.finish().await.unwrap();
        assert!(sink.is_closed());
        assert_eq!(
            sink.events(),
            &[
                SinkEvent::Approach { vehicle: id(1) },
                SinkEvent::Entered {
                    vehicle: id(1),
                    slot: SlotIndex::new(4)
                },
                SinkEvent::Approach { vehicle: id(2) },
            ]
        );
        assert_eq!(sink.events_for(id(2)), vec![SinkEvent::Approach { vehicle: id(2) }]);
    }

    #[tokio::test]
    async fn dispatcher_waits_for_every_handle() {
        let (handle, dispatcher) = spawn_dispatcher(RecordingSink::new()).unwrap();
        let clone = handle.clone();
        drop(handle);

        let late = tokio::spawn(async move {
            tokio::task::yield_now().await;
            clone.notify(SinkEvent::Departed { vehicle: id(9) });
        });
        late.await.unwrap();

        let sink = dispatcher.finish().await.unwrap();
        assert_eq!(sink.events(), &[SinkEvent::Departed { vehicle: id(9) }]);
    }

    #[test]
    fn detached_handle_swallows_events() {
        let handle = SinkHandle::detached();
        handle.notify(SinkEvent::Approach { vehicle: id(1) });
    }

    struct Panicking;

    impl PresentationSink for Panicking {
        fn on_approach(&mut self, _vehicle: VehicleId) {
            panic!("renderer crashed");
        }
        fn on_entered(&mut self, _vehicle: VehicleId, _slot: SlotIndex) {}
        fn on_queued_to_depart(&mut self, _vehicle: VehicleId) {}
        fn on_departed(&mut self, _vehicle: VehicleId) {}
    }

    #[tokio::test]
    async fn panicking_sink_surfaces_on_finish() {
        let (handle, dispatcher) = spawn_dispatcher(Panicking).unwrap();
        handle.notify(SinkEvent::Approach { vehicle: id(1) });
        drop(handle);

        assert!(matches!(dispatcher.finish().await, Err(SinkError::Panicked)));
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.on_approach(id(3));
        sink.on_entered(id(3), SlotIndex::new(0));
        sink.on_departed(id(3));
        sink.on_closed();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            concat!(
                "{\"event\":\"approach\",\"vehicle\":3}\n",
                "{\"event\":\"entered\",\"vehicle\":3,\"slot\":0}\n",
                "{\"event\":\"departed\",\"vehicle\":3}\n",
            )
        );
    }

    #[test]
    fn sink_event_serializes_tagged() {
        insta::assert_json_snapshot!(
            [
                SinkEvent::Approach { vehicle: id(7) },
                SinkEvent::Entered { vehicle: id(7), slot: SlotIndex::new(2) },
                SinkEvent::QueuedToDepart { vehicle: id(7) },
                SinkEvent::Departed { vehicle: id(7) },
                SinkEvent::Abandoned { vehicle: id(8) },
            ],
            @r#"
        [
          {
            "event": "approach",
            "vehicle": 7
          },
          {
            "event": "entered",
            "vehicle": 7,
            "slot": 2
          },
          {
            "event": "queued_to_depart",
            "vehicle": 7
          },
          {
            "event": "departed",
            "vehicle": 7
          },
          {
            "event": "abandoned",
            "vehicle": 8
          }
        ]
        "#
        );
    }
}
