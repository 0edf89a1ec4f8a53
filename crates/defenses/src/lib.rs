//! Backdoor defenses evaluated against the attacks in `attacks`.
//!
//! Three families share one [`DefenseContext`]:
//! - input filtering ([`InputFiltering`] + [`Strip`]) scores test inputs;
//! - training filtering ([`TrainingFiltering`] + [`SpectralSignature`]) flags
//!   poisoned training samples;
//! - model inspection ([`ModelInspection`], [`NeuralCleanse`]) reverse-engineers a
//!   trigger per class and flags the outlier.
//!
//! Model inspection persists its per-class results with [`MarkArchive`].

mod backdoor;
pub mod cache;
pub mod early_stop;
mod error;
pub mod input_filtering;
pub mod model_inspection;
pub mod neural_cleanse;
pub mod score;
pub mod spectral;
pub mod strip;
pub mod training_filtering;

pub use backdoor::{DefenseContext, RealMark};
pub use cache::{archive_path, MarkArchive};
pub use early_stop::{NeverStop, Patience};
pub use error::{DefenseError, DefenseResult};
pub use input_filtering::{DetectionReport, InputFilter, InputFiltering};
pub use model_inspection::{
    low_side_anomaly, EpochStats, InspectionConfig, InspectionHooks, InspectionReport,
    InspectionResult, MarkCandidate, ModelInspection,
};
pub use neural_cleanse::{NeuralCleanse, NeuralCleanseConfig};
pub use score::{true_labels, NonZero, RankSplit, ScoreToLabel, Threshold};
pub use spectral::{SpectralConfig, SpectralSignature};
pub use strip::{prediction_entropy, Strip, StripConfig};
pub use training_filtering::{TrainingFilter, TrainingFiltering};

pub mod prelude {
    pub use super::{
        DefenseContext, DefenseError, DefenseResult, InputFiltering, InspectionConfig,
        ModelInspection, NeuralCleanse, SpectralSignature, Strip, TrainingFiltering,
    };
}
