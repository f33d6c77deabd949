//! Submodel training configuration

use serde::{Deserialize, Serialize};

use crate::data::PropertyGroup;
use crate::device::Device;
use crate::error::{MolPropError, Result};
use crate::hyperparams::Hyperparameters;

/// Settings for one submodel training run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub hps: Hyperparameters,
    /// Passes over the training set
    pub epochs: usize,
    pub device: Device,
    /// The model input carries a one-hot property selector
    pub multi_head: bool,
    /// Validate every `eval_every` epochs (the last epoch is always validated)
    pub eval_every: usize,
}

impl TrainConfig {
    pub fn new(hps: Hyperparameters, epochs: usize) -> Self {
        Self {
            hps,
            epochs,
            device: Device::default(),
            multi_head: false,
            eval_every: 1,
        }
    }

    /// Config for a property group, multi-head when the group has a selector
    pub fn for_group(hps: Hyperparameters, epochs: usize, group: &PropertyGroup) -> Self {
        Self::new(hps, epochs).with_multi_head(group.selector_dim() > 0)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_multi_head(mut self, multi_head: bool) -> Self {
        self.multi_head = multi_head;
        self
    }

    pub fn with_eval_every(mut self, eval_every: usize) -> Self {
        self.eval_every = eval_every;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.hps.validate()?;
        if self.epochs == 0 {
            return Err(MolPropError::ConfigError("epochs must be at least 1".to_string()));
        }
        if self.eval_every == 0 {
            return Err(MolPropError::ConfigError("eval_every must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Whether validation runs after `epoch` (zero-based)
    pub(crate) fn evaluates_at(&self, epoch: usize) -> bool {
        (epoch + 1) % self.eval_every == 0 || epoch + 1 == self.epochs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Activation;

    fn hps() -> Hyperparameters {
        Hyperparameters {
            r_learn: 1e-3,
            batch_size: 8,
            dropout_pct: 0.0,
            capacity: 1,
            activation: Activation::ReLU,
        }
    }

    #[test]
    fn test_multi_head_follows_group() {
        let single = PropertyGroup::new("tg", ["Tg"]);
        let multi = PropertyGroup::new("electronic", ["Egc", "Egb"]);
        assert!(!TrainConfig::for_group(hps(), 5, &single).multi_head);
        assert!(TrainConfig::for_group(hps(), 5, &multi).multi_head);
    }

    #[test]
    fn test_last_epoch_always_evaluated() {
        let config = TrainConfig::new(hps(), 5).with_eval_every(2);
        let evaluated: Vec<usize> = (0..5).filter(|&e| config.evaluates_at(e)).collect();
        assert_eq!(evaluated, vec![1, 3, 4]);
    }

    #[test]
    fn test_zero_epochs_rejected() {
        assert!(TrainConfig::new(hps(), 0).validate().is_err());
        assert!(TrainConfig::new(hps(), 1).with_eval_every(0).validate().is_err());
    }
}
