//! Loss terms of the policy update and the adversarial reward transform.
use tch::{Kind, Tensor};

const REWARD_EPS: f64 = 1e-12;

/// Policy-gradient loss: per-dimension negative log-probability of the taken
/// actions, weighted by the detached advantages and summed.
pub fn policy_gradient_loss(logits: &[Tensor], actions: &Tensor, advantages: &Tensor) -> Tensor {
    let mut cross_entropy: Option<Tensor> = None;
    for (d, logit) in logits.iter().enumerate() {
        let action = actions.select(2, d as i64).unsqueeze(-1);
        let nll = logit
            .log_softmax(-1, Kind::Float)
            .gather(-1, &action, false)
            .squeeze_dim(-1)
            .neg();
        cross_entropy = Some(match cross_entropy {
            Some(t) => t + nll,
            None => nll,
        });
    }
    let cross_entropy = cross_entropy.expect("at least one action dimension");
    (cross_entropy * advantages.detach()).sum(Kind::Float)
}

/// Baseline loss: half the summed squared value-target error.
pub fn baseline_loss(advantages: &Tensor) -> Tensor {
    advantages.square().sum(Kind::Float) * 0.5
}

/// Entropy loss, i.e. the negative entropy of the policy, summed over the
/// independent action dimensions.
pub fn entropy_loss(logits: &[Tensor]) -> Tensor {
    let mut entropy: Option<Tensor> = None;
    for logit in logits {
        let policy = logit.softmax(-1, Kind::Float);
        let log_policy = logit.log_softmax(-1, Kind::Float);
        let term = (policy * log_policy).sum(Kind::Float);
        entropy = Some(match entropy {
            Some(t) => t + term,
            None => term,
        });
    }
    entropy.expect("at least one action dimension")
}

/// Maps discriminator scores to a reward correction,
/// `log(relu(p) + eps) - log(relu(1 - p) + eps)`.
pub fn shaped_reward(p: &Tensor) -> Tensor {
    let positive = (p.relu() + REWARD_EPS).log();
    let negative = ((p.neg() + 1.0).relu() + REWARD_EPS).log();
    positive - negative
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn entropy_loss_of_a_deterministic_policy_is_zero() {
        // A near-one-hot policy has entropy close to zero from below.
        let logits = vec![Tensor::from_slice(&[50f32, 0.0, 0.0]).view([1, 1, 3])];
        let loss = entropy_loss(&logits).double_value(&[]);
        assert!(loss.abs() < 1e-4);

        let uniform = vec![Tensor::zeros([1, 1, 3], (Kind::Float, Device::Cpu))];
        let uniform_loss = entropy_loss(&uniform).double_value(&[]);
        assert!(uniform_loss < loss - 0.5);
    }

    #[test]
    fn shaped_reward_is_antisymmetric_around_one_half() {
        let p = Tensor::from_slice(&[0.2f32, 0.5, 0.8]);
        let r = shaped_reward(&p);
        let r0 = r.double_value(&[0]);
        let r1 = r.double_value(&[1]);
        let r2 = r.double_value(&[2]);
        assert!(r1.abs() < 1e-6);
        assert!((r0 + r2).abs() < 1e-5);
        assert!(r2 > 0.0);
    }

    #[test]
    fn policy_gradient_loss_pushes_towards_advantaged_actions() {
        let logits = vec![Tensor::zeros([1, 1, 2], (Kind::Float, Device::Cpu))];
        let actions = Tensor::zeros([1, 1, 1], (Kind::Float, Device::Cpu)).to_kind(Kind::Int64);
        let advantages = Tensor::ones([1, 1], (Kind::Float, Device::Cpu));
        let loss = policy_gradient_loss(&logits, &actions, &advantages).double_value(&[]);
        // NLL of a uniform two-way choice.
        assert!((loss - (2f64).ln()).abs() < 1e-5);
    }
}
