//! Off-policy correction of value targets and advantages.
//!
//! Pure function over time-major tensors: given behavior and target policy
//! logits, it corrects the n-step value targets and policy-gradient
//! advantages for the gap between the data-collecting policy and the policy
//! being trained. No gradients flow through the returned tensors.
use tch::{no_grad, Kind, Tensor};

/// Corrected value targets and advantages.
pub struct VtraceReturns {
    /// Corrected value targets `v_s`, `[T, B]`.
    pub vs: Tensor,

    /// Corrected policy-gradient advantages, `[T, B]`.
    pub pg_advantages: Tensor,
}

fn action_log_probs(logits: &[Tensor], actions: &Tensor) -> Tensor {
    let mut total: Option<Tensor> = None;
    for (d, logit) in logits.iter().enumerate() {
        let action = actions.select(2, d as i64).unsqueeze(-1);
        let log_prob = logit
            .log_softmax(-1, Kind::Float)
            .gather(-1, &action, false)
            .squeeze_dim(-1);
        total = Some(match total {
            Some(t) => t + log_prob,
            None => log_prob,
        });
    }
    total.expect("at least one action dimension")
}

/// Computes corrected returns from policy logits.
///
/// All sequence arguments are `[T, B]`-shaped (logits `[T, B, A_d]` per
/// action dimension, actions `[T, B, D]`); `bootstrap_value` is `[B]`.
#[allow(clippy::too_many_arguments)]
pub fn from_logits(
    behavior_policy_logits: &[Tensor],
    target_policy_logits: &[Tensor],
    actions: &Tensor,
    discounts: &Tensor,
    rewards: &Tensor,
    values: &Tensor,
    bootstrap_value: &Tensor,
    clip_rho_threshold: f64,
    clip_pg_rho_threshold: f64,
) -> VtraceReturns {
    let target_log_probs = action_log_probs(target_policy_logits, actions);
    let behavior_log_probs = action_log_probs(behavior_policy_logits, actions);
    let log_rhos = target_log_probs - behavior_log_probs;
    from_importance_weights(
        &log_rhos,
        discounts,
        rewards,
        values,
        bootstrap_value,
        clip_rho_threshold,
        clip_pg_rho_threshold,
    )
}

/// Computes corrected returns from log importance weights.
pub fn from_importance_weights(
    log_rhos: &Tensor,
    discounts: &Tensor,
    rewards: &Tensor,
    values: &Tensor,
    bootstrap_value: &Tensor,
    clip_rho_threshold: f64,
    clip_pg_rho_threshold: f64,
) -> VtraceReturns {
    no_grad(|| {
        let log_rhos = log_rhos.detach();
        let discounts = discounts.detach();
        let rewards = rewards.detach();
        let values = values.detach();
        let bootstrap_value = bootstrap_value.detach();

        let rhos = log_rhos.exp();
        let clipped_rhos = rhos.clamp_max(clip_rho_threshold);
        let cs = rhos.clamp_max(1.0);

        let t = values.size()[0];
        let values_t_plus_1 = Tensor::cat(
            &[values.narrow(0, 1, t - 1), bootstrap_value.unsqueeze(0)],
            0,
        );
        let deltas = &clipped_rhos * (&rewards + &discounts * &values_t_plus_1 - &values);

        // Backward recursion over the unroll.
        let mut acc = Tensor::zeros_like(&bootstrap_value);
        let mut corrections = Vec::with_capacity(t as usize);
        for i in (0..t).rev() {
            acc = deltas.get(i) + discounts.get(i) * cs.get(i) * acc;
            corrections.push(acc.shallow_clone());
        }
        corrections.reverse();
        let vs = Tensor::stack(&corrections, 0) + &values;

        let vs_t_plus_1 = Tensor::cat(&[vs.narrow(0, 1, t - 1), bootstrap_value.unsqueeze(0)], 0);
        let clipped_pg_rhos = rhos.clamp_max(clip_pg_rho_threshold);
        let pg_advantages = clipped_pg_rhos * (rewards + discounts * vs_t_plus_1 - values);

        VtraceReturns { vs, pg_advantages }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use tch::Device;

    fn seq(values: &[f32], t: i64, b: i64) -> Tensor {
        Tensor::from_slice(values).view([t, b])
    }

    /// Scalar reference recursion for matched behavior/target policies: with
    /// all importance weights at one, `v_s` is the n-step bootstrapped return
    /// and the advantage is the plain one-step advantage against it.
    fn on_policy_reference(
        rewards: &[f32],
        values: &[f32],
        discounts: &[f32],
        bootstrap: f32,
    ) -> (Vec<f32>, Vec<f32>) {
        let t = rewards.len();
        let mut vs = vec![0f32; t];
        let mut acc = 0f32;
        for i in (0..t).rev() {
            let next_value = if i + 1 < t { values[i + 1] } else { bootstrap };
            let delta = rewards[i] + discounts[i] * next_value - values[i];
            acc = delta + discounts[i] * acc;
            vs[i] = acc + values[i];
        }
        let adv = (0..t)
            .map(|i| {
                let next_vs = if i + 1 < t { vs[i + 1] } else { bootstrap };
                rewards[i] + discounts[i] * next_vs - values[i]
            })
            .collect();
        (vs, adv)
    }

    #[test]
    fn matched_policies_reduce_to_the_plain_advantage() {
        tch::manual_seed(0);
        let (t, b) = (5, 1);
        let logits = vec![Tensor::randn([t, b, 4], (Kind::Float, Device::Cpu))];
        let actions = Tensor::zeros([t, b, 1], (Kind::Float, Device::Cpu)).to_kind(Kind::Int64);

        let rewards = [0.5f32, -0.2, 1.0, 0.0, 0.3];
        let values = [0.1f32, 0.4, -0.3, 0.2, 0.6];
        let discounts = [0.99f32, 0.99, 0.0, 0.99, 0.99];
        let bootstrap = 0.7f32;

        let returns = from_logits(
            &logits,
            &logits,
            &actions,
            &seq(&discounts, t, b),
            &seq(&rewards, t, b),
            &seq(&values, t, b),
            &Tensor::from_slice(&[bootstrap]),
            1.0,
            1.0,
        );

        let (expected_vs, expected_adv) = on_policy_reference(&rewards, &values, &discounts, bootstrap);
        let got_vs = Vec::<f32>::try_from(&returns.vs.flatten(0, -1)).unwrap();
        let got_adv = Vec::<f32>::try_from(&returns.pg_advantages.flatten(0, -1)).unwrap();
        for i in 0..t as usize {
            assert!((got_vs[i] - expected_vs[i]).abs() < 1e-5);
            assert!((got_adv[i] - expected_adv[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn clipping_caps_large_importance_weights() {
        let (t, b) = (3, 2);
        let log_rhos = Tensor::full([t, b], 3.0, (Kind::Float, Device::Cpu));
        let uniform = Tensor::ones([t, b], (Kind::Float, Device::Cpu));
        let returns = from_importance_weights(
            &log_rhos,
            &(&uniform * 0.9),
            &uniform,
            &(&uniform * 0.5),
            &Tensor::zeros([b], (Kind::Float, Device::Cpu)),
            1.0,
            1.0,
        );
        // With rho clipped to one, the result matches the on-policy one.
        let matched = from_importance_weights(
            &Tensor::zeros([t, b], (Kind::Float, Device::Cpu)),
            &(&uniform * 0.9),
            &uniform,
            &(&uniform * 0.5),
            &Tensor::zeros([b], (Kind::Float, Device::Cpu)),
            1.0,
            1.0,
        );
        let a = Vec::<f32>::try_from(&returns.vs.flatten(0, -1)).unwrap();
        let b = Vec::<f32>::try_from(&matched.vs.flatten(0, -1)).unwrap();
        assert_eq!(a, b);
    }
}
