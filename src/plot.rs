//! Live-plot consumer: a bounded sink between the runner and a renderer.
//!
//! The sink runs on its own OS thread, drains the runner's data channel and
//! maintains one xy series per followed parameter. The actual drawing is
//! behind the [`PlotRenderer`] seam so the engine never links a GUI
//! toolkit; tests plug in a capturing renderer and applications plug in
//! whatever they draw with. Under backpressure the *runner* drops plot
//! updates (never persistence rows); the sink itself renders every point it
//! receives, decimated by the plot bin.

use crate::runner::{ControlMessage, DataEvent};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

/// Channel depth between runner and sink. One update queue worth of
/// buffering; beyond this the runner drops renders.
pub const PLOT_CHANNEL_DEPTH: usize = 256;

/// One xy series tracked by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Followed parameter identity (`instrument.name`).
    pub name: String,
    pub unit: String,
    /// Points in arrival order; breaks appear as NaN pairs so renderers do
    /// not connect across discontinuities.
    pub points: Vec<(f64, f64)>,
}

/// Rendering seam. Called from the sink thread.
pub trait PlotRenderer: Send {
    /// Redraw with the current series buffers.
    fn render(&mut self, series: &[Series]);
    /// The run finished; flush anything pending.
    fn finish(&mut self, _series: &[Series]) {}
}

/// Renderer that only logs; the default when no GUI is attached.
#[derive(Default)]
pub struct NullRenderer;

impl PlotRenderer for NullRenderer {
    fn render(&mut self, _series: &[Series]) {}
    fn finish(&mut self, series: &[Series]) {
        let total: usize = series.iter().map(|s| s.points.len()).sum();
        log::info!("plot sink closed with {} buffered points", total);
    }
}

/// Keyboard controls accepted by the sink. Advisory: the sink forwards the
/// mapped action on the sweep's control channel and the sweep decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    /// ESC → stop.
    Escape,
    /// ENTER → resume.
    Enter,
    /// SPACE → flip direction.
    Space,
}

impl KeyCommand {
    fn to_control(self) -> ControlMessage {
        match self {
            KeyCommand::Escape => ControlMessage::Stop,
            KeyCommand::Enter => ControlMessage::Resume,
            KeyCommand::Space => ControlMessage::FlipDirection,
        }
    }
}

/// Where the x value of a series comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotAxis {
    /// Plot follow values against elapsed time (time-only sweeps).
    Time,
    /// Plot follow values against the first controlled setpoint.
    Setpoint,
}

/// Handle owned by the sweep; the worker exits when the data channel
/// completes or disconnects.
pub struct PlotSink {
    key_tx: Sender<KeyCommand>,
    worker: Option<JoinHandle<Vec<Series>>>,
}

impl PlotSink {
    /// Spawn the sink thread.
    ///
    /// `names` declares the follow-set series (identity, unit) in the
    /// order values arrive in [`DataEvent::Point`]. `plot_bin` decimates
    /// renderer updates: the renderer is called every `plot_bin` points.
    pub fn spawn(
        data_rx: Receiver<DataEvent>,
        control_tx: Option<Sender<ControlMessage>>,
        names: Vec<(String, String)>,
        axis: PlotAxis,
        plot_bin: usize,
        mut renderer: Box<dyn PlotRenderer>,
    ) -> Self {
        let (key_tx, key_rx) = bounded::<KeyCommand>(16);
        let worker = std::thread::Builder::new()
            .name("labsweep-plot".to_string())
            .spawn(move || {
                let mut series: Vec<Series> = names
                    .into_iter()
                    .map(|(name, unit)| Series {
                        name,
                        unit,
                        points: Vec::new(),
                    })
                    .collect();
                let bin = plot_bin.max(1);
                let mut since_render = 0usize;

                let forward_key = |key: KeyCommand| {
                    if let Some(tx) = &control_tx {
                        let _ = tx.try_send(key.to_control());
                    }
                };

                'sink: loop {
                    let event = crossbeam_channel::select! {
                        recv(key_rx) -> key => {
                            if let Ok(key) = key {
                                forward_key(key);
                            }
                            continue 'sink;
                        }
                        recv(data_rx) -> event => match event {
                            Ok(event) => event,
                            Err(_) => break 'sink,
                        },
                    };
                    match event {
                        DataEvent::Point {
                            elapsed,
                            setpoints,
                            values,
                            ..
                        } => {
                            let x = match axis {
                                PlotAxis::Time => elapsed,
                                PlotAxis::Setpoint => {
                                    setpoints.first().copied().unwrap_or(elapsed)
                                }
                            };
                            for (slot, value) in series.iter_mut().zip(values.iter()) {
                                slot.points.push((x, *value));
                            }
                            since_render += 1;
                            if since_render >= bin {
                                renderer.render(&series);
                                since_render = 0;
                            }
                        }
                        DataEvent::Break { .. } => {
                            for slot in series.iter_mut() {
                                slot.points.push((f64::NAN, f64::NAN));
                            }
                            renderer.render(&series);
                            since_render = 0;
                        }
                        DataEvent::Complete => break 'sink,
                    }
                }

                // Forward any controls that were still queued at shutdown.
                while let Ok(key) = key_rx.try_recv() {
                    forward_key(key);
                }

                renderer.finish(&series);
                series
            })
            .expect("failed to spawn plot sink thread");

        Self {
            key_tx,
            worker: Some(worker),
        }
    }

    /// Post a keyboard control. Dropped if the sink's queue is full.
    pub fn send_key(&self, key: KeyCommand) {
        let _ = self.key_tx.try_send(key);
    }

    /// Wait for the sink to drain and return the final series buffers.
    pub fn join(mut self) -> Vec<Series> {
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for PlotSink {
    fn drop(&mut self) {
        // Detached: the worker exits when the data channel closes.
        if let Some(worker) = self.worker.take() {
            drop(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Capture {
        renders: Arc<Mutex<usize>>,
        last: Arc<Mutex<Vec<Series>>>,
    }

    impl PlotRenderer for Capture {
        fn render(&mut self, series: &[Series]) {
            *self.renders.lock() += 1;
            *self.last.lock() = series.to_vec();
        }
    }

    fn point(elapsed: f64, x: f64, y: f64) -> DataEvent {
        DataEvent::Point {
            elapsed,
            setpoints: vec![x],
            persist: None,
            values: vec![y],
            direction: 1,
        }
    }

    #[test]
    fn breaks_become_nan_gaps() {
        let (tx, rx) = bounded(PLOT_CHANNEL_DEPTH);
        let renders = Arc::new(Mutex::new(0));
        let last = Arc::new(Mutex::new(Vec::new()));
        let sink = PlotSink::spawn(
            rx,
            None,
            vec![("meter.current".to_string(), "A".to_string())],
            PlotAxis::Setpoint,
            1,
            Box::new(Capture {
                renders: renders.clone(),
                last: last.clone(),
            }),
        );

        tx.send(point(0.0, 0.0, 1.0)).unwrap();
        tx.send(DataEvent::Break { direction: -1 }).unwrap();
        tx.send(point(0.1, 0.1, 2.0)).unwrap();
        tx.send(DataEvent::Complete).unwrap();

        let series = sink.join();
        assert_eq!(series.len(), 1);
        let pts = &series[0].points;
        assert_eq!(pts.len(), 3);
        assert!(pts[1].0.is_nan() && pts[1].1.is_nan());
        assert_eq!(pts[2], (0.1, 2.0));
        assert!(*renders.lock() >= 3);
    }

    #[test]
    fn plot_bin_decimates_renderer_updates() {
        let (tx, rx) = bounded(PLOT_CHANNEL_DEPTH);
        let renders = Arc::new(Mutex::new(0));
        let last = Arc::new(Mutex::new(Vec::new()));
        let sink = PlotSink::spawn(
            rx,
            None,
            vec![("meter.current".to_string(), "A".to_string())],
            PlotAxis::Time,
            4,
            Box::new(Capture {
                renders: renders.clone(),
                last: last.clone(),
            }),
        );

        for i in 0..8 {
            tx.send(point(i as f64 * 0.1, 0.0, i as f64)).unwrap();
        }
        tx.send(DataEvent::Complete).unwrap();

        let series = sink.join();
        // All 8 points buffered, but only 2 renders (every 4th point).
        assert_eq!(series[0].points.len(), 8);
        assert_eq!(*renders.lock(), 2);
    }

    #[test]
    fn key_commands_are_forwarded_to_the_control_channel() {
        let (data_tx, data_rx) = bounded(PLOT_CHANNEL_DEPTH);
        let (ctrl_tx, ctrl_rx) = bounded(16);
        let sink = PlotSink::spawn(
            data_rx,
            Some(ctrl_tx),
            vec![],
            PlotAxis::Time,
            1,
            Box::new(NullRenderer),
        );

        sink.send_key(KeyCommand::Escape);
        sink.send_key(KeyCommand::Space);
        // A point wakes the worker so it processes the key queue.
        data_tx.send(point(0.0, 0.0, 0.0)).unwrap();
        data_tx.send(DataEvent::Complete).unwrap();
        sink.join();

        let received: Vec<ControlMessage> = ctrl_rx.try_iter().collect();
        assert_eq!(
            received,
            vec![ControlMessage::Stop, ControlMessage::FlipDirection]
        );
    }
}
