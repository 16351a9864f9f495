//! Latent Diffusion Model
//!
//! Wraps a conditional UNet together with the noise schedule it was trained
//! with so that it can be driven by the samplers.
use crate::control::AttentionHook;
use crate::error::{Error, Result};
use crate::models::unet_2d::UNet2DConditionModel;
use crate::samplers::{Conditioning, DiffusionModel};
use crate::schedulers::noise::NoiseSchedule;
use crate::schedulers::Parameterization;
use tch::Tensor;

/// Conditioning entries concatenated to the latent along the channels.
pub const CONCAT_KEY: &str = "c_concat";
/// Conditioning entries concatenated along the sequence and used for
/// cross-attention.
pub const CROSSATTN_KEY: &str = "c_crossattn";

#[derive(Debug)]
pub struct LatentDiffusion {
    unet: UNet2DConditionModel,
    schedule: NoiseSchedule,
    parameterization: Parameterization,
}

impl LatentDiffusion {
    pub fn new(
        unet: UNet2DConditionModel,
        schedule: NoiseSchedule,
        parameterization: Parameterization,
    ) -> Self {
        Self { unet, schedule, parameterization }
    }

    pub fn unet(&self) -> &UNet2DConditionModel {
        &self.unet
    }
}

fn cat_entries(cond: &Conditioning, dim: i64) -> Result<Tensor> {
    let tensors = cond.tensors();
    if tensors.is_empty() {
        return Err(Error::Conditioning("empty conditioning".to_string()));
    }
    Ok(Tensor::f_cat(&tensors, dim)?)
}

impl DiffusionModel for LatentDiffusion {
    /// A plain tensor or a list of tensors is used as the cross-attention
    /// context. A map can hold both `c_concat` and `c_crossattn` entries.
    fn apply_model(&self, x: &Tensor, t: &Tensor, cond: Option<&Conditioning>) -> Result<Tensor> {
        let (x, context) = match cond {
            None => (x.shallow_clone(), None),
            Some(Conditioning::Map(entries)) => {
                let known = |key: &str| key == CONCAT_KEY || key == CROSSATTN_KEY;
                if let Some(key) = entries.keys().find(|key| !known(key)) {
                    return Err(Error::Conditioning(format!("unexpected key {key}")));
                }
                let x = match entries.get(CONCAT_KEY) {
                    Some(c_concat) => {
                        let mut xs = vec![x.shallow_clone()];
                        xs.extend(c_concat.tensors().into_iter().map(|c| c.shallow_clone()));
                        Tensor::f_cat(&xs, 1)?
                    }
                    None => x.shallow_clone(),
                };
                let context = entries.get(CROSSATTN_KEY).map(|c| cat_entries(c, 1)).transpose()?;
                (x, context)
            }
            Some(cond) => (x.shallow_clone(), Some(cat_entries(cond, 1)?)),
        };
        Ok(self.unet.forward(&x, t, context.as_ref()))
    }

    fn parameterization(&self) -> Parameterization {
        self.parameterization
    }

    fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn attention_hook(&self) -> Option<&AttentionHook> {
        Some(self.unet.attention_hook())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AttentionController, AttentionPlace, SharedController};
    use crate::models::unet_2d::{BlockConfig, UNet2DConditionModelConfig};
    use crate::samplers::ddim_v::{DdimVSampler, SamplingOptions};
    use std::sync::{Arc, Mutex};
    use tch::{kind, nn, Device};

    fn tiny_model(in_channels: i64, parameterization: Parameterization) -> LatentDiffusion {
        let vs = nn::VarStore::new(Device::Cpu);
        let bc = |out_channels, use_cross_attn| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim: 2,
        };
        let config = UNet2DConditionModelConfig {
            blocks: vec![bc(32, true), bc(64, false)],
            layers_per_block: 1,
            cross_attention_dim: 16,
            ..Default::default()
        };
        let unet = UNet2DConditionModel::new(vs.root(), in_channels, 4, config);
        let schedule = NoiseSchedule::new(Default::default(), Device::Cpu);
        LatentDiffusion::new(unet, schedule, parameterization)
    }

    #[test]
    fn hybrid_conditioning() {
        tch::manual_seed(0);
        let model = tiny_model(5, Parameterization::Epsilon);
        let x = Tensor::randn([2, 4, 8, 8], kind::FLOAT_CPU);
        let t = Tensor::from_slice(&[1i64, 1]);
        let cond = Conditioning::map([
            (CONCAT_KEY, Conditioning::from(Tensor::zeros([2, 1, 8, 8], kind::FLOAT_CPU))),
            (
                CROSSATTN_KEY,
                Conditioning::from(vec![
                    Tensor::randn([2, 3, 16], kind::FLOAT_CPU),
                    Tensor::randn([2, 2, 16], kind::FLOAT_CPU),
                ]),
            ),
        ]);
        let out = model.apply_model(&x, &t, Some(&cond)).unwrap();
        assert_eq!(out.size(), [2, 4, 8, 8]);

        let film = Conditioning::from(Tensor::zeros([2], kind::FLOAT_CPU));
        let cond = Conditioning::map([("c_film", film)]);
        assert!(matches!(model.apply_model(&x, &t, Some(&cond)), Err(Error::Conditioning(_))));
    }

    #[derive(Default)]
    struct Tracker {
        steps: usize,
        cross: usize,
        places: Vec<AttentionPlace>,
    }

    impl AttentionController for Tracker {
        fn set_step(&mut self, _: usize) {
            self.steps += 1
        }

        fn control(
            &mut self,
            context: Tensor,
            is_cross: bool,
            place: Option<AttentionPlace>,
        ) -> Tensor {
            if is_cross {
                self.cross += 1
            }
            if let Some(place) = place {
                if !self.places.contains(&place) {
                    self.places.push(place)
                }
            }
            context
        }
    }

    #[test]
    fn sampling_routes_attention_through_the_controller() {
        tch::manual_seed(1);
        let model = tiny_model(4, Parameterization::V);
        let sampler = DdimVSampler::new(&model);
        let cond = Conditioning::from(Tensor::randn([1, 3, 16], kind::FLOAT_CPU));
        let uncond = Conditioning::from(Tensor::zeros([1, 3, 16], kind::FLOAT_CPU));
        let tracker = Arc::new(Mutex::new(Tracker::default()));
        let controller: SharedController = tracker.clone();
        let options = SamplingOptions {
            controller: Some(controller),
            unconditional_guidance_scale: 5.,
            unconditional_conditioning: Some(&uncond),
            ..Default::default()
        };
        let (latent, _) = sampler.sample(3, 1, (4, 8, 8), Some(&cond), options).unwrap();
        assert_eq!(latent.size(), [1, 4, 8, 8]);
        let tracker = tracker.lock().unwrap();
        assert_eq!(tracker.steps, 3);
        // Four cross-attention layers, two network queries per step.
        assert_eq!(tracker.cross, 4 * 2 * 3);
        assert_eq!(tracker.places, [AttentionPlace::Down, AttentionPlace::Mid, AttentionPlace::Up]);
    }
}
