//! # labsweep
//!
//! A sweep execution engine for laboratory instruments. A *sweep* steps one
//! or more control parameters through prescribed trajectories, samples a
//! set of followed parameters after each step, streams point tuples to
//! consumers (dataset persistence, live plots), and enforces a process-wide
//! guard so at most one unrelated acquisition touches the instruments at a
//! time.
//!
//! ## Crate structure
//!
//! - **`parameter`**: the [`Parameter`](parameter::Parameter) handle:
//!   uniform get/set over instrument channels, with retry and error
//!   classification.
//! - **`sweep`**: the sweep hierarchy. [`sweep::Sweep`] carries the common
//!   lifecycle; kinds cover time-only, one-axis, two-axis composed,
//!   simultaneous multi-axis, listening, leakage-limited and
//!   magnet-coupled sweeps.
//! - **`runner`**: the per-sweep acquisition worker thread and its control
//!   and data channels.
//! - **`plot`** / **`heatmap`**: bounded consumers feeding renderer seams;
//!   the engine never links a GUI toolkit.
//! - **`storage`**: the persistence facade (dataset contexts, measurement
//!   runs, row appends).
//! - **`queue`**: ordered execution of sweeps, hooks, and dataset-target
//!   switches.
//! - **`registry`**: the process-global active-sweep guard.
//! - **`station`** / **`metadata`**: parameter resolution and
//!   self-describing JSON export/import of sweep configurations.
//! - **`config`** / **`logging`**: data-directory discovery and the
//!   per-run sweep log.
//!
//! ## Example
//!
//! ```rust,ignore
//! use labsweep::{Parameter, SaveTarget, Sweep1D};
//!
//! let gate = Parameter::builder("voltage", "dac")
//!     .unit("V")
//!     .getter(move || Ok(dac.read()?))
//!     .setter(move |v| Ok(dac.write(v)?))
//!     .build();
//!
//! let mut sweep = Sweep1D::new(gate, 0.0, 1.0, 0.01)
//!     .bidirectional()
//!     .inter_delay(0.05)
//!     .save_to(SaveTarget::new("transport", "cooldown_3", "sample_a"))
//!     .build()?;
//! sweep.follow_param([drain_current])?;
//! sweep.start()?;
//! sweep.wait_done(std::time::Duration::from_secs(600));
//! ```

pub mod config;
pub mod error;
pub mod heatmap;
pub mod logging;
pub mod metadata;
pub mod parameter;
pub mod plot;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod station;
pub mod storage;
pub mod sweep;

pub use error::{ParameterError, ParameterErrorKind, Result, SweepError};
pub use parameter::Parameter;
pub use progress::{ProgressState, SweepState};
pub use queue::{QueueEntry, SweepQueue};
pub use station::Station;
pub use storage::SaveTarget;
pub use sweep::gate_leakage::GateLeakage;
pub use sweep::listening::ListeningSweep;
pub use sweep::magnet::{MagnetSweep, RampingInstrument};
pub use sweep::simul::SimulSweep;
pub use sweep::sweep0d::Sweep0D;
pub use sweep::sweep1d::Sweep1D;
pub use sweep::sweep2d::Sweep2D;
pub use sweep::{AnySweep, Sweep};
