//! A deterministic in-process actor driver.
//!
//! The production actor pool lives outside this crate and feeds the queues
//! over environment-server pipes. This driver stands in for it: it simulates
//! `num_actors` painting episodes with a trivial canvas dynamic, requests
//! actions through the inference batcher and fills the learner and replay
//! queues with correctly shaped unrolls. Used by the smoke-training binary
//! and the end-to-end tests.
use crate::batch::{AgentOutput, CanvasBatch, EnvOutput, TrajectoryBatch};
use crate::config::TrainConfig;
use crate::inference::InferenceInput;
use crate::trainer::ActorHandles;
use anyhow::Result;
use tch::{Device, Kind, Tensor};

struct Actor {
    canvas: Tensor,
    state: Tensor,
}

/// Applies an action to the canvas: a shade derived from the first action
/// dimension is blended in, so the painting evolves deterministically with
/// the chosen actions.
fn paint(canvas: &Tensor, action: &Tensor, action_dims: &[i64]) -> Tensor {
    let a0 = action.int64_value(&[0, 0, 0]);
    let shade = a0 as f64 / action_dims[0] as f64;
    canvas * 0.8 + shade * 0.2
}

/// Runs unrolls round-robin over the simulated actors until the learner
/// queue or the inference batcher is closed.
pub fn run_synthetic_driver(handles: ActorHandles, config: TrainConfig) -> Result<()> {
    let (c, h, w) = config.obs_shape;
    let t = config.unroll_length as i64;
    let blank = || Tensor::zeros([c, h, w], (Kind::Float, Device::Cpu));

    let mut actors: Vec<Actor> = (0..config.num_actors)
        .map(|_| Actor {
            canvas: blank(),
            state: handles.initial_state.copy(),
        })
        .collect();

    loop {
        for actor in actors.iter_mut() {
            let initial_state = actor.state.copy();
            let mut env_rows: Vec<EnvOutput> = Vec::with_capacity(t as usize + 1);
            let mut agent_rows: Vec<AgentOutput> = Vec::with_capacity(t as usize + 1);

            for step in 0..=t {
                // Row zero observes a freshly reset episode; the final row
                // ends it, so episodes stay aligned with unrolls.
                let done = step == 0 || step == t;
                let reward = 0f32;
                let canvas_row = actor.canvas.view([1, 1, c, h, w]).copy();
                let done_row = Tensor::from_slice(&[done]).view([1, 1]);

                let output = match handles.inference.infer(InferenceInput {
                    canvas: canvas_row.shallow_clone(),
                    done: done_row.shallow_clone(),
                    state: actor.state.shallow_clone(),
                }) {
                    Ok(output) => output,
                    // A closed batcher is the shutdown signal.
                    Err(_) => return Ok(()),
                };
                actor.state = output.state;
                actor.canvas = paint(&actor.canvas, &output.action, &config.action_dims);

                env_rows.push(EnvOutput {
                    canvas: canvas_row,
                    reward: Tensor::from_slice(&[reward]).view([1, 1]),
                    done: done_row,
                    episode_step: Tensor::from_slice(&[step]).view([1, 1]),
                    episode_return: Tensor::from_slice(&[reward * step as f32]).view([1, 1]),
                });
                agent_rows.push(AgentOutput {
                    action: output.action,
                    policy_logits: output.policy_logits,
                    baseline: output.baseline.view([1, 1]),
                });
            }

            let final_canvas = env_rows
                .last()
                .expect("unroll has rows")
                .canvas
                .shallow_clone();

            let n_dims = config.action_dims.len();
            let item = TrajectoryBatch {
                env: EnvOutput {
                    canvas: Tensor::cat(
                        &env_rows.iter().map(|r| &r.canvas).collect::<Vec<_>>(),
                        0,
                    ),
                    reward: Tensor::cat(
                        &env_rows.iter().map(|r| &r.reward).collect::<Vec<_>>(),
                        0,
                    ),
                    done: Tensor::cat(&env_rows.iter().map(|r| &r.done).collect::<Vec<_>>(), 0),
                    episode_step: Tensor::cat(
                        &env_rows.iter().map(|r| &r.episode_step).collect::<Vec<_>>(),
                        0,
                    ),
                    episode_return: Tensor::cat(
                        &env_rows
                            .iter()
                            .map(|r| &r.episode_return)
                            .collect::<Vec<_>>(),
                        0,
                    ),
                },
                agent: AgentOutput {
                    action: Tensor::cat(
                        &agent_rows.iter().map(|r| &r.action).collect::<Vec<_>>(),
                        0,
                    ),
                    policy_logits: (0..n_dims)
                        .map(|d| {
                            Tensor::cat(
                                &agent_rows
                                    .iter()
                                    .map(|r| &r.policy_logits[d])
                                    .collect::<Vec<_>>(),
                                0,
                            )
                        })
                        .collect(),
                    baseline: Tensor::cat(
                        &agent_rows.iter().map(|r| &r.baseline).collect::<Vec<_>>(),
                        0,
                    ),
                },
                initial_state,
                final_canvas: final_canvas.shallow_clone(),
            };

            if handles.learner.send(item).is_err() {
                return Ok(());
            }
            if handles.replay.send(CanvasBatch(final_canvas)).is_err() {
                return Ok(());
            }

            // The episode ended with this unroll; start the next one on a
            // blank canvas.
            actor.canvas = blank();
        }
    }
}
