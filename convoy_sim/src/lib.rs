//! Convoy Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled road where several convoy agents run
//! deterministically, driven tick by tick from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one tick at a time
//! - **Radio**: Range-limited discovery, groups, link loss and partitions
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock)                           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼─────┐             ┌────▼─────┐                      │
//! │  │ Vehicle  │◄───────────►│ Vehicle  │     ...              │
//! │  │   #1     │   SimAir    │   #2     │                      │
//! │  └──────────┘             └──────────┘                      │
//! │       ▲                        ▲                            │
//! │       │  fixes + inertial      │                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │            Oracle                 │                       │
//! │  │  (Ground Truth Kinematics)        │                       │
//! │  └───────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use convoy_sim::{SimWorld, SimConfig};
//!
//! let mut world = SimWorld::new(SimConfig { seed: 42, ..Default::default() });
//! let a = world.spawn_vehicle("a", 45.07, 7.68, 20.0, 0.0);
//! let b = world.spawn_vehicle("b", 45.0727, 7.68, 20.0, 180.0);
//! world.run_for(5.0);
//! println!("{:?}", world.vehicle(a).alert());
//! ```

mod agent;
mod context;
mod network;
mod oracle;
mod runner;
pub mod scenarios;
mod world;

pub use agent::{SimLink, SimulatedVehicle, VehicleLog};
pub use context::SimContext;
pub use network::{AirStats, SimAir, SimRadio, DEFAULT_RANGE_M, SIM_PORT};
pub use oracle::{Oracle, SensorNoise, TruthVehicle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld};
