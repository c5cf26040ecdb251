#![warn(missing_docs)]
//! Concurrent adversarial training core for a painting agent, on `tch`.
//!
//! The agent learns a painting policy with off-policy corrected policy
//! gradients while a discriminator, trained online against a live replay
//! buffer of finished canvases, reshapes its rewards toward realism. The
//! crate provides:
//!
//! * the rollout data model ([`batch`]) and the replay/queue plumbing from
//!   `atelier-core`,
//! * batched inference serving on a published policy copy ([`inference`]),
//! * the policy-learner loop with V-trace correction and adversarial reward
//!   shaping ([`learner`], [`vtrace`], [`loss`]),
//! * the discriminator-learner loop ([`discriminator`]),
//! * checkpointing and orchestration ([`checkpoint`], [`trainer`]).
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod discriminator;
pub mod driver;
pub mod inference;
pub mod learner;
pub mod loss;
pub mod net;
pub mod opt;
pub mod publish;
pub mod trainer;
pub mod vtrace;

pub use config::TrainConfig;
pub use trainer::{ActorHandles, Trainer};
