//! # xendev-core
//!
//! Device and console controllers of the xendev control plane.
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!   guest channel ───▶ │ EventLoop                    │ ◀─── TCP terminals
//!                      │   ConsoleControllerFactory   │
//!                      │     └─ ConsoleController ×N  │
//!                      └──────────────────────────────┘
//!
//!   domain builder ──▶ DeviceManager (per domain)
//!                        ├─ BlockController     vbd
//!                        ├─ BlktapController    tap ──▶ tapdisk2, PrivilegedDomain
//!                        └─ NetController       vif
//!                              │
//!                              ▼
//!                        ConfigStore (one Transaction per device)
//! ```
//!
//! ## Modules
//!
//! - [`controller`] / [`factory`]: channel-bound controllers and their registry
//! - [`console`]: the console bridge
//! - [`event_loop`]: the single task all console state lives on
//! - [`device`]: device descriptors, controllers and the phantom allocator
//! - [`config`]: settings
//! - [`event`]: lifecycle notifications

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod console;
pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod factory;

pub use config::Settings;
pub use console::{ConsoleController, ConsoleControllerFactory, ConsoleInfo, ConsoleState};
pub use controller::{Controller, Dispatch, InstanceKey};
pub use device::{
    CreatedDevice, DeviceClass, DeviceController, DeviceId, DeviceManager, DeviceRequest,
    ImageKind, PrivilegedDomain,
};
pub use error::{CoreError, Result};
pub use event::{Event, EventBus};
pub use event_loop::{EventLoop, LoopEvent, LoopHandle};
pub use factory::ControllerFactory;
