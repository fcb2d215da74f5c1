pub mod barrier_builder;
pub mod state;

pub use barrier_builder::BarrierBuilder;
pub use state::{
    Access, ImageLayout, ImageTracker, ImageTransition, ResState, Stage, TrackedImage,
    TrackerSnapshot,
};
