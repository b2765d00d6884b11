//! Heatmap sink for composed (two-axis) sweeps.
//!
//! Consumes the inner sweep's point stream and assembles a 2-D grid: one
//! row per outer setpoint, cells keyed by the inner setpoint. Only the
//! forward pass of each inner line is recorded, so the grid is rectangular
//! regardless of the inner sweep's bidirectional return pass. Rendering is
//! behind the [`HeatmapRenderer`] seam, as with the line plots.

use crate::runner::DataEvent;
use crossbeam_channel::Receiver;
use std::thread::JoinHandle;

/// The assembled grid: rows in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeatmapGrid {
    /// Parameter identity of the value being mapped.
    pub value_name: String,
    pub rows: Vec<HeatmapRow>,
}

/// One inner pass: the outer setpoint and the (inner, value) cells.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapRow {
    pub outer: f64,
    pub cells: Vec<(f64, f64)>,
}

/// Rendering seam for 2-D data. Called from the sink thread.
pub trait HeatmapRenderer: Send {
    /// A row finished; redraw with the grid so far.
    fn render(&mut self, grid: &HeatmapGrid);
    fn finish(&mut self, _grid: &HeatmapGrid) {}
}

/// Renderer that only logs.
#[derive(Default)]
pub struct NullHeatmapRenderer;

impl HeatmapRenderer for NullHeatmapRenderer {
    fn render(&mut self, _grid: &HeatmapGrid) {}
    fn finish(&mut self, grid: &HeatmapGrid) {
        log::info!("heatmap sink closed with {} rows", grid.rows.len());
    }
}

/// Background consumer building the grid from the inner data stream.
pub struct HeatmapSink {
    worker: Option<JoinHandle<HeatmapGrid>>,
}

impl HeatmapSink {
    /// Spawn the sink.
    ///
    /// `value_index` selects which follow value to map; `value_name` is
    /// its identity for labeling. Points with a different `persist` value
    /// than the previous point start a new row; break markers flip
    /// pass-parity so only forward passes land in the grid.
    pub fn spawn(
        data_rx: Receiver<DataEvent>,
        value_index: usize,
        value_name: String,
        mut renderer: Box<dyn HeatmapRenderer>,
    ) -> Self {
        let worker = std::thread::Builder::new()
            .name("labsweep-heatmap".to_string())
            .spawn(move || {
                let mut grid = HeatmapGrid {
                    value_name,
                    rows: Vec::new(),
                };
                let mut forward_pass = true;

                while let Ok(event) = data_rx.recv() {
                    match event {
                        DataEvent::Point {
                            setpoints,
                            persist,
                            values,
                            ..
                        } => {
                            if !forward_pass {
                                continue;
                            }
                            let (Some(outer), Some(&inner)) = (persist, setpoints.first())
                            else {
                                continue;
                            };
                            let Some(&value) = values.get(value_index) else {
                                continue;
                            };
                            match grid.rows.last_mut() {
                                Some(row) if row.outer == outer => {
                                    row.cells.push((inner, value));
                                }
                                _ => {
                                    if !grid.rows.is_empty() {
                                        renderer.render(&grid);
                                    }
                                    grid.rows.push(HeatmapRow {
                                        outer,
                                        cells: vec![(inner, value)],
                                    });
                                }
                            }
                        }
                        DataEvent::Break { .. } => {
                            forward_pass = !forward_pass;
                        }
                        // Inner passes complete once per line; the grid
                        // outlives them and closes with the channel.
                        DataEvent::Complete => {
                            forward_pass = true;
                            renderer.render(&grid);
                        }
                    }
                }

                renderer.render(&grid);
                renderer.finish(&grid);
                grid
            })
            .expect("failed to spawn heatmap sink thread");

        Self {
            worker: Some(worker),
        }
    }

    /// Wait for the sink to drain and return the assembled grid.
    pub fn join(mut self) -> HeatmapGrid {
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_default(),
            None => HeatmapGrid::default(),
        }
    }
}
