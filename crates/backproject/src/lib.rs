//! Coalescence back-projection of seismic onset functions: travel-time
//! tables, continuous detection scan, triggering and event location.

pub mod cancel;
pub mod config;
pub mod error;
pub mod grid;
pub mod locate;
pub mod lut;
pub mod onset;
pub mod output;
pub mod scan;
pub mod station;
pub mod trigger;

pub use cancel::CancelToken;
pub use config::{LocateConfig, LowAvailabilityPolicy, Normalisation, PickConfig, ScanConfig, StackMode, TriggerConfig};
pub use error::{Error, Result};
pub use grid::{GeoPoint, Grid, Projection};
pub use locate::{Estimate, Event, Locator, Pick, PickEstimate};
pub use lut::{Phase, TravelTimeTable, VelocityModel};
pub use onset::{OnsetData, OnsetMethod, OnsetSource, Waveforms};
pub use scan::{CoalescenceRecord, CoalescenceSeries, ScanSummary, Scanner, SeriesSink};
pub use station::Station;
pub use trigger::{Candidate, Trigger};
