//! Backdoor attacks on image classifiers.
//!
//! - `Watermark`: the trigger mark (pattern + alpha channel) and blending
//! - `BadNet`: data poisoning with a fixed trigger
//! - `TrojanNn`: BadNet with a trigger optimized to excite chosen neurons
//! - `AttackArtifact`: trained mark (and neurons) saved beside a checkpoint
//!
//! The mark is owned by the attack value. Defenses borrow it through
//! [`BadNet::mark`] and keep their own copies of anything they change.

mod artifact;
mod attack;
pub mod badnet;
mod error;
pub mod trojannn;
pub mod watermark;

pub use artifact::AttackArtifact;
pub use attack::BackdoorAttack;
pub use badnet::{AttackReport, BadNet, BadNetConfig, TrainMode};
pub use error::{AttackError, AttackResult};
pub use trojannn::{smallest_k, NeuronSelection, TrojanNn, TrojanNnConfig};
pub use watermark::{blend_mark, tanh_func, MarkConfig, Watermark};

pub mod prelude {
    pub use super::{
        AttackArtifact, AttackError, AttackResult, BackdoorAttack, BadNet, BadNetConfig, MarkConfig, TrojanNn,
        TrojanNnConfig, Watermark,
    };
}
