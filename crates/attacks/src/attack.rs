use burn::tensor::backend::Backend;
use models::ImageModel;
use std::path::Path;
use trojan_dataset::ImageSet;

use crate::artifact::AttackArtifact;
use crate::badnet::{AttackReport, BadNet};
use crate::error::AttackResult;
use crate::trojannn::TrojanNn;
use crate::watermark::Watermark;

/// What defenses need from a backdoor attack.
pub trait BackdoorAttack<B: Backend> {
    fn name(&self) -> &'static str;

    /// Experiment stem encoding target class, opacity and mark size.
    fn get_filename(&self) -> String;

    fn badnet(&self) -> &BadNet<B>;

    fn badnet_mut(&mut self) -> &mut BadNet<B>;

    fn validate_fn<M: ImageModel<B>>(
        &mut self,
        model: &M,
        valid: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<AttackReport>;

    fn mark(&self) -> &Watermark<B> {
        self.badnet().mark()
    }

    fn target_class(&self) -> i64 {
        self.badnet().target_class()
    }

    /// Trained state worth keeping next to the model checkpoint.
    fn artifact(&self) -> AttackArtifact {
        AttackArtifact::from_mark(self.name(), self.mark())
    }

    /// Put back the mark saved by [`BackdoorAttack::artifact`].
    fn restore(&mut self, artifact: &AttackArtifact, path: &Path) -> AttackResult<()> {
        artifact.check_attack(self.name(), path)?;
        let device = self.mark().mark().device();
        self.badnet_mut()
            .mark_mut()
            .set_mark(artifact.mark_tensor(&device))
    }
}

impl<B: Backend> BackdoorAttack<B> for BadNet<B> {
    fn name(&self) -> &'static str {
        BadNet::name(self)
    }

    fn get_filename(&self) -> String {
        BadNet::get_filename(self)
    }

    fn badnet(&self) -> &BadNet<B> {
        self
    }

    fn badnet_mut(&mut self) -> &mut BadNet<B> {
        self
    }

    fn validate_fn<M: ImageModel<B>>(
        &mut self,
        model: &M,
        valid: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<AttackReport> {
        BadNet::validate_fn(self, model, valid, batch_size, device)
    }
}

impl<B: Backend> BackdoorAttack<B> for TrojanNn<B> {
    fn name(&self) -> &'static str {
        TrojanNn::name(self)
    }

    fn get_filename(&self) -> String {
        TrojanNn::get_filename(self)
    }

    fn badnet(&self) -> &BadNet<B> {
        TrojanNn::badnet(self)
    }

    fn badnet_mut(&mut self) -> &mut BadNet<B> {
        TrojanNn::badnet_mut(self)
    }

    fn validate_fn<M: ImageModel<B>>(
        &mut self,
        model: &M,
        valid: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<AttackReport> {
        TrojanNn::validate_fn(self, model, valid, batch_size, device)
    }

    fn artifact(&self) -> AttackArtifact {
        AttackArtifact {
            neuron_idx: self.neuron_idx().map(<[usize]>::to_vec),
            ..AttackArtifact::from_mark(self.name(), self.mark())
        }
    }

    fn restore(&mut self, artifact: &AttackArtifact, path: &Path) -> AttackResult<()> {
        artifact.check_attack(TrojanNn::name(self), path)?;
        let device = self.badnet().mark().mark().device();
        self.badnet_mut()
            .mark_mut()
            .set_mark(artifact.mark_tensor(&device))?;
        self.set_neuron_idx(artifact.neuron_idx.clone());
        Ok(())
    }
}
