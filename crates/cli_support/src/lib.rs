pub mod common;

pub use common::{
    AttackArgs, AttackKind, DataArgs, DefenseArgs, DefenseKind, MarkArgs, TrainModeArg,
};
