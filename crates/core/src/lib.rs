//! Trait contracts and plain data model shared across constellation
//! subsystem crates.

pub mod constellation;
pub mod device;
pub mod event;
pub mod planner;

pub use constellation::{
    Constellation, ConstellationSnapshot, EditBatch, GraphEdit, TaskStar, TaskStarLine,
    TaskStarSpec,
};
pub use device::{AipMessage, DeviceManager, DeviceRecord, MessageHeader};
pub use event::{Event, EventBus, Subscription};
pub use planner::{DagSpec, PlannerAdapter, ReplanContext};
