//! Automation Module
//! Mission: Turn comments on watched posts into private-reply DMs

pub mod api;
pub mod dispatch;
pub mod models;
pub mod store;
pub mod webhook;

pub use dispatch::{Delivery, DeliveryOutcome, Dispatcher};
pub use models::{Campaign, CampaignStatus, CommentEvent, DmLog, DmStatus};
pub use store::CampaignStore;
