//! # DDIM sampler with target guidance and attention control
//!
//! A DDIM sampler supporting both epsilon and v parameterized models. On
//! top of the usual classifier-free guidance it can:
//! - pull the sample toward a noised target latent under a mask, the mask
//!   weight can be given once or for every step,
//! - restart the trajectory from a noised initial latent after a fraction
//!   of the steps,
//! - route the attention layers of the network and the denoised estimates
//!   through an [`AttentionController`](crate::control::AttentionController).
//!
//! Noise is drawn from the libtorch generator, use `tch::manual_seed` for
//! reproducible runs.
use super::{Conditioning, DiffusionModel, Quantizer, ScoreCorrector};
use crate::control::{lock, register_attention_control, SharedController};
use crate::error::{Error, Result};
use crate::schedulers::ddim::{DdimDiscretization, DdimSchedule};
use crate::schedulers::Parameterization;
use crate::utils::{extract_into_tensor, noise_like};
use tch::{Kind, Tensor};

pub type StepCallback<'a> = &'a mut dyn FnMut(usize) -> Result<()>;
pub type ImageCallback<'a> = &'a mut dyn FnMut(&Tensor, usize) -> Result<()>;

/// Blend weights between the sample and the target latent, `1` means that
/// the target is used as is.
#[derive(Debug)]
pub enum Mask {
    /// The same weight for all the steps.
    Weight(Tensor),
    /// One weight per step, `None` skips the blending for that step.
    PerStep(Vec<Option<Tensor>>),
}

impl Mask {
    fn weight(&self, step: usize) -> Option<&Tensor> {
        match self {
            Self::Weight(weight) => Some(weight),
            Self::PerStep(weights) => weights.get(step).and_then(|w| w.as_ref()),
        }
    }
}

/// The settings of a sampling run.
pub struct SamplingOptions<'a> {
    /// Called with the step index after each step, returning an error stops
    /// the sampling.
    pub callback: Option<StepCallback<'a>>,
    /// Called with the denoised estimate and the step index after each step.
    pub img_callback: Option<ImageCallback<'a>>,
    pub quantize_denoised: Option<&'a dyn Quantizer>,
    pub eta: f64,
    pub discretization: DdimDiscretization,
    pub mask: Option<Mask>,
    /// Initial latent, noised and substituted to the sample at step
    /// `floor(steps * strength)`.
    pub x0: Option<Tensor>,
    /// Target latent the sample is pulled toward under the mask.
    pub xtrg: Option<Tensor>,
    /// Interpolates the rescaling of the direction term after blending
    /// between `1 - weight` (0.) and `max(1 - w, 0.9 * sqrt(1 - w²))` (1.).
    pub noise_rescale: Option<f64>,
    pub temperature: f64,
    pub noise_dropout: f64,
    pub score_corrector: Option<&'a dyn ScoreCorrector>,
    /// Starting latent, a standard normal sample is used when not set.
    pub x_t: Option<Tensor>,
    pub log_every_t: usize,
    pub unconditional_guidance_scale: f64,
    pub unconditional_conditioning: Option<&'a Conditioning>,
    pub dynamic_threshold: Option<f64>,
    /// Per-step guidance scales, overriding `unconditional_guidance_scale`.
    pub ucg_schedule: Option<Vec<f64>>,
    pub controller: Option<SharedController>,
    pub strength: f64,
    /// Run over the full training schedule rather than the DDIM one.
    pub ddim_use_original_steps: bool,
    /// Only run the first steps of the schedule.
    pub timesteps: Option<usize>,
}

impl<'a> Default for SamplingOptions<'a> {
    fn default() -> Self {
        Self {
            callback: None,
            img_callback: None,
            quantize_denoised: None,
            eta: 0.,
            discretization: DdimDiscretization::Uniform,
            mask: None,
            x0: None,
            xtrg: None,
            noise_rescale: None,
            temperature: 1.,
            noise_dropout: 0.,
            score_corrector: None,
            x_t: None,
            log_every_t: 100,
            unconditional_guidance_scale: 1.,
            unconditional_conditioning: None,
            dynamic_threshold: None,
            ucg_schedule: None,
            controller: None,
            strength: 0.,
            ddim_use_original_steps: false,
            timesteps: None,
        }
    }
}

/// The settings of a single denoising step.
#[derive(Clone, Copy)]
pub struct StepOptions<'a> {
    pub use_original_steps: bool,
    /// Use the same noise sample for all the batch elements.
    pub repeat_noise: bool,
    pub quantize_denoised: Option<&'a dyn Quantizer>,
    pub temperature: f64,
    pub noise_dropout: f64,
    pub score_corrector: Option<&'a dyn ScoreCorrector>,
    pub unconditional_guidance_scale: f64,
    pub unconditional_conditioning: Option<&'a Conditioning>,
    pub dynamic_threshold: Option<f64>,
    pub controller: Option<&'a SharedController>,
    pub return_dir: bool,
}

impl<'a> Default for StepOptions<'a> {
    fn default() -> Self {
        Self {
            use_original_steps: false,
            repeat_noise: false,
            quantize_denoised: None,
            temperature: 1.,
            noise_dropout: 0.,
            score_corrector: None,
            unconditional_guidance_scale: 1.,
            unconditional_conditioning: None,
            dynamic_threshold: None,
            controller: None,
            return_dir: false,
        }
    }
}

/// The result of a denoising step.
#[derive(Debug)]
pub struct DdimStep {
    pub x_prev: Tensor,
    pub pred_x0: Tensor,
    /// The direction pointing to `x_t`, only set when requested.
    pub dir_xt: Option<Tensor>,
}

/// Latents and denoised estimates recorded along a sampling run, in
/// chronological order. Both start with the initial latent.
#[derive(Debug)]
pub struct Intermediates {
    pub x_inter: Vec<Tensor>,
    pub pred_x0: Vec<Tensor>,
}

#[derive(Default)]
pub struct EncodeOptions<'a> {
    pub use_original_steps: bool,
    /// Approximate number of intermediate latents to record.
    pub return_intermediates: Option<usize>,
    pub unconditional_guidance_scale: Option<f64>,
    pub unconditional_conditioning: Option<&'a Conditioning>,
    pub callback: Option<StepCallback<'a>>,
}

#[derive(Debug)]
pub struct EncodeOutput {
    pub x_encoded: Tensor,
    pub intermediate_steps: Vec<usize>,
    pub intermediates: Option<Vec<Tensor>>,
}

#[derive(Default)]
pub struct DecodeOptions<'a> {
    pub use_original_steps: bool,
    pub unconditional_guidance_scale: Option<f64>,
    pub unconditional_conditioning: Option<&'a Conditioning>,
    pub callback: Option<StepCallback<'a>>,
}

/// Pulls `img` toward `img_ref`, the target latent noised to the current
/// timestep. The direction term of the previous step is rescaled so that
/// the blended latent keeps a sensible amount of noise.
pub fn blend_toward_target(
    img: &Tensor,
    img_ref: &Tensor,
    weight: &Tensor,
    dir_xt: Option<&Tensor>,
    noise_rescale: Option<f64>,
) -> Tensor {
    let dir_xt = match dir_xt {
        Some(dir_xt) => dir_xt.shallow_clone(),
        None => img.zeros_like(),
    };
    let keep = 1f64 - weight;
    let rescale = keep.maximum(&((1f64 - weight.square()).sqrt() * 0.9));
    let rescale = match noise_rescale {
        Some(nr) => &keep * (1. - nr) + rescale * nr,
        None => rescale,
    };
    img_ref * weight + keep * (img - &dir_xt) + rescale * dir_xt
}

pub struct DdimVSampler<'a, M: DiffusionModel + ?Sized> {
    model: &'a M,
    parameterization: Parameterization,
    ddpm_num_timesteps: usize,
}

impl<'a, M: DiffusionModel + ?Sized> DdimVSampler<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self {
            model,
            parameterization: model.parameterization(),
            ddpm_num_timesteps: model.num_timesteps(),
        }
    }

    pub fn model(&self) -> &M {
        self.model
    }

    /// Computes the buffers for sampling with `ddim_num_steps` steps.
    pub fn make_schedule(
        &self,
        ddim_num_steps: usize,
        discretization: DdimDiscretization,
        eta: f64,
    ) -> Result<DdimSchedule> {
        DdimSchedule::new(
            self.model.noise_schedule(),
            ddim_num_steps,
            discretization,
            eta,
            self.model.device(),
        )
    }

    /// Generates `batch_size` latents of shape `(c, h, w)` using `s` steps.
    pub fn sample(
        &self,
        s: usize,
        batch_size: i64,
        shape: (i64, i64, i64),
        conditioning: Option<&Conditioning>,
        options: SamplingOptions<'_>,
    ) -> Result<(Tensor, Intermediates)> {
        if let Some(conditioning) = conditioning {
            conditioning.check_batch_size(batch_size)
        }
        let schedule = self.make_schedule(s, options.discretization, options.eta)?;
        let (c, h, w) = shape;
        let size = [batch_size, c, h, w];
        log::info!("data shape for ddim sampling is {size:?}, eta {}", options.eta);
        let options =
            SamplingOptions { ddim_use_original_steps: false, timesteps: None, ..options };
        self.ddim_sampling(&schedule, conditioning, &size, options)
    }

    pub fn ddim_sampling(
        &self,
        schedule: &DdimSchedule,
        cond: Option<&Conditioning>,
        shape: &[i64],
        options: SamplingOptions<'_>,
    ) -> Result<(Tensor, Intermediates)> {
        let SamplingOptions {
            mut callback,
            mut img_callback,
            quantize_denoised,
            eta: _,
            discretization: _,
            mask,
            x0,
            xtrg,
            noise_rescale,
            temperature,
            noise_dropout,
            score_corrector,
            x_t,
            log_every_t,
            mut unconditional_guidance_scale,
            unconditional_conditioning,
            dynamic_threshold,
            ucg_schedule,
            controller,
            strength,
            ddim_use_original_steps,
            timesteps,
        } = options;

        let device = self.model.device();
        let b = shape[0];
        let mut img = match x_t {
            Some(x_t) => x_t,
            None => Tensor::randn(shape, (Kind::Float, device)),
        };

        let timesteps: Vec<usize> = match (ddim_use_original_steps, timesteps) {
            (true, timesteps) => (0..timesteps.unwrap_or(self.ddpm_num_timesteps)).collect(),
            (false, None) => schedule.timesteps.clone(),
            (false, Some(timesteps)) => {
                let len = schedule.len();
                let ratio = f64::min(timesteps as f64 / len as f64, 1.);
                let subset_end = (ratio * len as f64) as usize;
                // An empty subset counts back from the end and drops the last step.
                let subset_end = subset_end.checked_sub(1).unwrap_or(len.saturating_sub(1));
                schedule.timesteps[..subset_end].to_vec()
            }
        };
        let total_steps = timesteps.len();
        log::info!("running ddim sampling with {total_steps} timesteps");

        if let Some(ucg_schedule) = &ucg_schedule {
            if ucg_schedule.len() != total_steps {
                return Err(Error::GuidanceScheduleLength {
                    expected: total_steps,
                    got: ucg_schedule.len(),
                });
            }
        }
        if let Some(Mask::PerStep(weights)) = &mask {
            if weights.len() != total_steps {
                return Err(Error::MaskScheduleLength { expected: total_steps, got: weights.len() });
            }
        }
        if let Some(hook) = self.model.attention_hook() {
            register_attention_control(hook, controller.clone());
        }

        let mut intermediates =
            Intermediates { x_inter: vec![img.shallow_clone()], pred_x0: vec![img.shallow_clone()] };
        if let Some(controller) = &controller {
            lock(controller).set_total_step(total_steps)
        }
        let log_every_t = log_every_t.max(1);

        let mut dir_xt: Option<Tensor> = None;
        for (i, &step) in timesteps.iter().rev().enumerate() {
            if let Some(controller) = &controller {
                lock(controller).set_step(i)
            }
            let index = total_steps - i - 1;
            let ts = Tensor::full([b], step as i64, (Kind::Int64, device));

            if strength >= 0. && i == (total_steps as f64 * strength) as usize {
                if let Some(x0) = &x0 {
                    log::debug!("replacing the latent at step {i}, timestep {step}");
                    img = self.model.q_sample(x0, &ts, None);
                }
            }

            if let (Some(mask), Some(xtrg)) = (&mask, &xtrg) {
                if let Some(weight) = mask.weight(i) {
                    let weight = weight.to_device(device);
                    let img_ref = self.model.q_sample(xtrg, &ts, None);
                    img = blend_toward_target(
                        &img,
                        &img_ref,
                        &weight,
                        dir_xt.as_ref(),
                        noise_rescale,
                    );
                }
            }

            if let Some(ucg_schedule) = &ucg_schedule {
                unconditional_guidance_scale = ucg_schedule[i];
            }

            let step_options = StepOptions {
                use_original_steps: ddim_use_original_steps,
                repeat_noise: false,
                quantize_denoised,
                temperature,
                noise_dropout,
                score_corrector,
                unconditional_guidance_scale,
                unconditional_conditioning,
                dynamic_threshold,
                controller: controller.as_ref(),
                return_dir: true,
            };
            let out = self.p_sample_ddim(schedule, &img, cond, &ts, index, &step_options)?;
            img = out.x_prev;
            let pred_x0 = out.pred_x0;
            dir_xt = out.dir_xt;
            log::debug!("ddim step {}/{total_steps}, timestep {step}", i + 1);

            if let Some(callback) = callback.as_deref_mut() {
                callback(i)?
            }
            if let Some(img_callback) = img_callback.as_deref_mut() {
                img_callback(&pred_x0, i)?
            }

            if index % log_every_t == 0 || index == total_steps - 1 {
                intermediates.x_inter.push(img.shallow_clone());
                intermediates.pred_x0.push(pred_x0);
            }
        }

        Ok((img, intermediates))
    }

    /// Performs a single denoising step from `x` at timesteps `t`, `index`
    /// being the position in the schedule.
    pub fn p_sample_ddim(
        &self,
        schedule: &DdimSchedule,
        x: &Tensor,
        c: Option<&Conditioning>,
        t: &Tensor,
        index: usize,
        options: &StepOptions<'_>,
    ) -> Result<DdimStep> {
        let _no_grad_guard = tch::no_grad_guard();
        let b = x.size()[0];
        let device = x.device();

        let model_output = match options.unconditional_conditioning {
            Some(uc) if options.unconditional_guidance_scale != 1. => {
                let model_t = self.model.apply_model(x, t, c)?;
                let model_uncond = self.model.apply_model(x, t, Some(uc))?;
                &model_uncond + (model_t - &model_uncond) * options.unconditional_guidance_scale
            }
            _ => self.model.apply_model(x, t, c)?,
        };

        let e_t = self.parameterization.noise_estimate(self.model, x, t, &model_output);
        let e_t = match options.score_corrector {
            Some(score_corrector) => {
                if self.parameterization != Parameterization::Epsilon {
                    return Err(Error::ScoreCorrectorParameterization(self.parameterization));
                }
                score_corrector.modify_score(&e_t, x, t, c)
            }
            None => e_t,
        };

        // select parameters corresponding to the currently considered timestep
        let coefs = schedule.coefficients(index, options.use_original_steps);
        let full = |v: f64| Tensor::full([b, 1, 1, 1], v, (Kind::Float, device));
        let a_t = full(coefs.a_t);
        let a_prev = full(coefs.a_prev);
        let sigma_t = full(coefs.sigma_t);
        let sqrt_one_minus_at = full(coefs.sqrt_one_minus_at);

        // current prediction for x_0
        let pred_x0 = self.parameterization.denoised_estimate(
            self.model,
            x,
            t,
            &model_output,
            &e_t,
            &a_t,
            &sqrt_one_minus_at,
        );
        let pred_x0 = match options.quantize_denoised {
            Some(quantizer) => quantizer.quantize(&pred_x0),
            None => pred_x0,
        };
        if options.dynamic_threshold.is_some() {
            return Err(Error::NotImplemented("dynamic thresholding"));
        }
        let pred_x0 = match options.controller {
            Some(controller) => lock(controller).update_x0(pred_x0),
            None => pred_x0,
        };

        // direction pointing to x_t
        let dir_xt = (1f64 - &a_prev - sigma_t.square()).sqrt() * &e_t;
        let noise =
            &sigma_t * noise_like(&x.size(), device, options.repeat_noise) * options.temperature;
        let noise = if options.noise_dropout > 0. {
            noise.dropout(options.noise_dropout, true)
        } else {
            noise
        };
        let x_prev = a_prev.sqrt() * &pred_x0 + &dir_xt + noise;

        let dir_xt = if options.return_dir { Some(dir_xt) } else { None };
        Ok(DdimStep { x_prev, pred_x0, dir_xt })
    }

    /// Runs the deterministic DDIM process forward for `t_enc` steps,
    /// mapping `x0` to a noisy latent that decodes back to it.
    pub fn encode(
        &self,
        schedule: &DdimSchedule,
        x0: &Tensor,
        c: Option<&Conditioning>,
        t_enc: usize,
        options: EncodeOptions<'_>,
    ) -> Result<(Tensor, EncodeOutput)> {
        let EncodeOptions {
            use_original_steps,
            return_intermediates,
            unconditional_guidance_scale,
            unconditional_conditioning,
            mut callback,
        } = options;
        let _no_grad_guard = tch::no_grad_guard();
        let unconditional_guidance_scale = unconditional_guidance_scale.unwrap_or(1.);
        let timesteps: Vec<usize> = if use_original_steps {
            (0..self.ddpm_num_timesteps).collect()
        } else {
            schedule.timesteps.clone()
        };
        let num_reference_steps = timesteps.len();
        if t_enc > num_reference_steps {
            return Err(Error::EncodeSteps { t_enc, available: num_reference_steps });
        }
        let num_steps = t_enc;
        let (alphas_next, alphas) = if use_original_steps {
            (&schedule.alphas_cumprod, &schedule.alphas_cumprod_prev)
        } else {
            (&schedule.ddim_alphas, &schedule.ddim_alphas_prev)
        };
        let return_intermediates = return_intermediates.filter(|&r| r > 0);

        let b = x0.size()[0];
        let device = self.model.device();
        let mut x_next = x0.shallow_clone();
        let mut intermediates = vec![];
        let mut inter_steps = vec![];
        for (i, &step) in timesteps.iter().take(num_steps).enumerate() {
            let t = Tensor::full([b], step as i64, (Kind::Int64, device));
            let noise_pred = if unconditional_guidance_scale == 1. {
                self.model.apply_model(&x_next, &t, c)?
            } else {
                let (uc, c) = match (unconditional_conditioning, c) {
                    (Some(uc), Some(c)) => (uc, c),
                    _ => {
                        return Err(Error::Conditioning(
                            "guided encoding requires both conditionings".to_string(),
                        ))
                    }
                };
                let out = self.model.apply_model(
                    &Tensor::cat(&[&x_next, &x_next], 0),
                    &Tensor::cat(&[&t, &t], 0),
                    Some(&uc.cat(c)?),
                )?;
                let out = out.chunk(2, 0);
                let (e_t_uncond, noise_pred) = (&out[0], &out[1]);
                e_t_uncond + (noise_pred - e_t_uncond) * unconditional_guidance_scale
            };
            let alpha_next = alphas_next.double_value(&[i as i64]);
            let alpha = alphas.double_value(&[i as i64]);
            let xt_weighted = (alpha_next / alpha).sqrt() * &x_next;
            let weighted_noise_pred = alpha_next.sqrt()
                * ((1. / alpha_next - 1.).sqrt() - (1. / alpha - 1.).sqrt())
                * noise_pred;
            x_next = xt_weighted + weighted_noise_pred;
            if let Some(return_intermediates) = return_intermediates {
                let every = usize::max(num_steps / return_intermediates, 1);
                if (i % every == 0 && i + 1 < num_steps) || i + 2 >= num_steps {
                    intermediates.push(x_next.shallow_clone());
                    inter_steps.push(i);
                }
            }
            if let Some(callback) = callback.as_deref_mut() {
                callback(i)?
            }
        }

        let out = EncodeOutput {
            x_encoded: x_next.shallow_clone(),
            intermediate_steps: inter_steps,
            intermediates: return_intermediates.map(|_| intermediates),
        };
        Ok((x_next, out))
    }

    /// Noises `x0` to position `t` of the schedule in one go. This is fast
    /// but, unlike [`Self::encode`], does not allow for exact
    /// reconstruction. Returns the noise itself when `t` is past the end of
    /// the schedule.
    pub fn stochastic_encode(
        &self,
        schedule: &DdimSchedule,
        x0: &Tensor,
        t: usize,
        use_original_steps: bool,
        noise: Option<Tensor>,
    ) -> Tensor {
        let (sqrt_alphas_cumprod, sqrt_one_minus_alphas_cumprod) = if use_original_steps {
            (
                schedule.sqrt_alphas_cumprod.shallow_clone(),
                schedule.sqrt_one_minus_alphas_cumprod.shallow_clone(),
            )
        } else {
            (schedule.ddim_alphas.sqrt(), schedule.ddim_sqrt_one_minus_alphas.shallow_clone())
        };
        let noise = noise.unwrap_or_else(|| Tensor::randn_like(x0));
        if t as i64 >= sqrt_alphas_cumprod.size()[0] {
            return noise;
        }
        let shape = x0.size();
        let t = Tensor::full([shape[0]], t as i64, (Kind::Int64, sqrt_alphas_cumprod.device()));
        extract_into_tensor(&sqrt_alphas_cumprod, &t, &shape) * x0
            + extract_into_tensor(&sqrt_one_minus_alphas_cumprod, &t, &shape) * noise
    }

    /// Denoises `x_latent`, assumed to be at position `t_start` of the
    /// schedule.
    pub fn decode(
        &self,
        schedule: &DdimSchedule,
        x_latent: &Tensor,
        cond: Option<&Conditioning>,
        t_start: usize,
        options: DecodeOptions<'_>,
    ) -> Result<Tensor> {
        let DecodeOptions {
            use_original_steps,
            unconditional_guidance_scale,
            unconditional_conditioning,
            mut callback,
        } = options;
        let timesteps: Vec<usize> = if use_original_steps {
            (0..self.ddpm_num_timesteps).collect()
        } else {
            schedule.timesteps.clone()
        };
        let timesteps = &timesteps[..usize::min(t_start, timesteps.len())];
        let total_steps = timesteps.len();
        log::info!("running ddim decoding with {total_steps} timesteps");

        let step_options = StepOptions {
            use_original_steps,
            unconditional_guidance_scale: unconditional_guidance_scale.unwrap_or(1.),
            unconditional_conditioning,
            ..Default::default()
        };
        let b = x_latent.size()[0];
        let mut x_dec = x_latent.shallow_clone();
        for (i, &step) in timesteps.iter().rev().enumerate() {
            let index = total_steps - i - 1;
            let ts = Tensor::full([b], step as i64, (Kind::Int64, x_latent.device()));
            x_dec = self.p_sample_ddim(schedule, &x_dec, cond, &ts, index, &step_options)?.x_prev;
            if let Some(callback) = callback.as_deref_mut() {
                callback(i)?
            }
        }
        Ok(x_dec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AttentionController, AttentionHook, AttentionPlace};
    use crate::schedulers::noise::NoiseSchedule;
    use std::cell::{Cell, RefCell};
    use std::sync::{Arc, Mutex};
    use tch::{kind, Device};

    struct MockModel {
        schedule: NoiseSchedule,
        parameterization: Parameterization,
        calls: Cell<usize>,
        inputs: RefCell<Vec<Tensor>>,
        hook: Option<AttentionHook>,
    }

    impl MockModel {
        fn new(parameterization: Parameterization) -> Self {
            let schedule = NoiseSchedule::new(Default::default(), Device::Cpu);
            Self {
                schedule,
                parameterization,
                calls: Cell::new(0),
                inputs: RefCell::new(vec![]),
                hook: None,
            }
        }
    }

    impl DiffusionModel for MockModel {
        fn apply_model(
            &self,
            x: &Tensor,
            t: &Tensor,
            cond: Option<&Conditioning>,
        ) -> Result<Tensor> {
            self.calls.set(self.calls.get() + 1);
            self.inputs.borrow_mut().push(x.copy());
            let x = match &self.hook {
                Some(hook) => hook.route(x.shallow_clone(), false, Some(AttentionPlace::Mid)),
                None => x.shallow_clone(),
            };
            let t = t.to_kind(Kind::Float).view([-1, 1, 1, 1]) / 1000.;
            let shift = match cond {
                Some(Conditioning::Tensor(c)) => c.mean(Kind::Float).double_value(&[]),
                _ => 0.,
            };
            Ok(x * 0.1 + t * 0.05 + shift)
        }

        fn parameterization(&self) -> Parameterization {
            self.parameterization
        }

        fn noise_schedule(&self) -> &NoiseSchedule {
            &self.schedule
        }

        fn attention_hook(&self) -> Option<&AttentionHook> {
            self.hook.as_ref()
        }
    }

    /// Returns a fixed noise estimate whatever the input.
    struct OracleModel {
        schedule: NoiseSchedule,
        noise: Tensor,
    }

    impl DiffusionModel for OracleModel {
        fn apply_model(&self, _: &Tensor, _: &Tensor, _: Option<&Conditioning>) -> Result<Tensor> {
            Ok(self.noise.shallow_clone())
        }

        fn parameterization(&self) -> Parameterization {
            Parameterization::Epsilon
        }

        fn noise_schedule(&self) -> &NoiseSchedule {
            &self.schedule
        }
    }

    fn max_abs_diff(lhs: &Tensor, rhs: &Tensor) -> f64 {
        (lhs - rhs).abs().max().double_value(&[])
    }

    #[test]
    fn twenty_steps_end_to_end() {
        tch::manual_seed(42);
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let cond = Conditioning::from(Tensor::ones([1, 77, 8], kind::FLOAT_CPU));
        let (latent, intermediates) =
            sampler.sample(20, 1, (4, 64, 64), Some(&cond), Default::default()).unwrap();
        assert_eq!(latent.size(), [1, 4, 64, 64]);
        assert_eq!(model.calls.get(), 20);
        // The initial latent plus the first and last steps.
        assert_eq!(intermediates.x_inter.len(), 3);
        assert_eq!(intermediates.pred_x0.len(), 3);
        assert_eq!(intermediates.x_inter[2], latent);

        let uncond = Conditioning::from(Tensor::zeros([1, 77, 8], kind::FLOAT_CPU));
        let options = SamplingOptions {
            unconditional_guidance_scale: 7.5,
            unconditional_conditioning: Some(&uncond),
            ..Default::default()
        };
        sampler.sample(20, 1, (4, 64, 64), Some(&cond), options).unwrap();
        assert_eq!(model.calls.get(), 60);
    }

    #[test]
    fn deterministic_for_zero_eta() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let run = || {
            tch::manual_seed(7);
            sampler.sample(10, 2, (4, 8, 8), None, Default::default()).unwrap().0
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn unit_guidance_scale_skips_unconditional_query() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let cond = Conditioning::from(Tensor::ones([1, 77, 8], kind::FLOAT_CPU));
        let uncond = Conditioning::from(Tensor::zeros([1, 77, 8], kind::FLOAT_CPU));
        let x_t = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);

        let options = SamplingOptions { x_t: Some(x_t.copy()), ..Default::default() };
        let (plain, _) = sampler.sample(10, 1, (4, 8, 8), Some(&cond), options).unwrap();
        let options = SamplingOptions {
            x_t: Some(x_t),
            unconditional_guidance_scale: 1.,
            unconditional_conditioning: Some(&uncond),
            ..Default::default()
        };
        let (guided, _) = sampler.sample(10, 1, (4, 8, 8), Some(&cond), options).unwrap();
        assert_eq!(model.calls.get(), 20);
        assert_eq!(plain, guided);
    }

    #[test]
    fn zero_eta_injects_no_noise() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(10, DdimDiscretization::Uniform, 0.).unwrap();
        let x = Tensor::randn([2, 4, 8, 8], kind::FLOAT_CPU);
        let t = Tensor::full([2], schedule.timesteps[5] as i64, (Kind::Int64, Device::Cpu));
        let cold = StepOptions { temperature: 1., ..Default::default() };
        let hot = StepOptions { temperature: 100., noise_dropout: 0.5, ..Default::default() };
        let cold = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &cold).unwrap();
        let hot = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &hot).unwrap();
        assert_eq!(cold.x_prev, hot.x_prev);
        assert!(cold.dir_xt.is_none());

        let schedule = sampler.make_schedule(10, DdimDiscretization::Uniform, 1.).unwrap();
        let first = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &Default::default());
        let second = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &Default::default());
        assert_ne!(first.unwrap().x_prev, second.unwrap().x_prev);
    }

    #[test]
    fn blending_with_empty_and_full_masks() {
        tch::manual_seed(3);
        let img = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let img_ref = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let zeros = Tensor::zeros([1, 1, 8, 8], kind::FLOAT_CPU);
        let ones = Tensor::ones([1, 1, 8, 8], kind::FLOAT_CPU);

        let blended = blend_toward_target(&img, &img_ref, &zeros, None, None);
        assert_eq!(blended, img);
        let blended = blend_toward_target(&img, &img_ref, &ones, None, Some(0.5));
        assert_eq!(blended, img_ref);

        let dir_xt = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let blended = blend_toward_target(&img, &img_ref, &ones, Some(&dir_xt), None);
        assert_eq!(blended, img_ref);
        let blended = blend_toward_target(&img, &img_ref, &zeros, Some(&dir_xt), None);
        assert!(max_abs_diff(&blended, &img) < 1e-5);
    }

    #[test]
    fn blending_with_partial_mask() {
        tch::manual_seed(4);
        let img = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let img_ref = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let dir_xt = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let half = Tensor::full([1, 1, 8, 8], 0.5, kind::FLOAT_CPU);

        // max(1 - 0.5, 0.9 * sqrt(1 - 0.25)) picks the second branch.
        let rescale = 0.9 * f64::sqrt(0.75);
        let expected = &img_ref * 0.5 + (&img - &dir_xt) * 0.5 + &dir_xt * rescale;
        let blended = blend_toward_target(&img, &img_ref, &half, Some(&dir_xt), None);
        assert!(max_abs_diff(&blended, &expected) < 1e-5);

        let rescale = 0.5 * 0.7 + rescale * 0.3;
        let expected = &img_ref * 0.5 + (&img - &dir_xt) * 0.5 + &dir_xt * rescale;
        let blended = blend_toward_target(&img, &img_ref, &half, Some(&dir_xt), Some(0.3));
        assert!(max_abs_diff(&blended, &expected) < 1e-5);

        // A low weight keeps the direction term as is.
        let low = Tensor::full([1, 1, 8, 8], 0.1, kind::FLOAT_CPU);
        let expected = &img_ref * 0.1 + (&img - &dir_xt) * 0.9 + &dir_xt * 0.9;
        let blended = blend_toward_target(&img, &img_ref, &low, Some(&dir_xt), None);
        assert!(max_abs_diff(&blended, &expected) < 1e-5);
    }

    #[test]
    fn full_mask_feeds_the_noised_target() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(5, DdimDiscretization::Uniform, 0.).unwrap();
        let xtrg = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let options = SamplingOptions {
            x_t: Some(Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU)),
            mask: Some(Mask::Weight(Tensor::ones([1, 1, 8, 8], kind::FLOAT_CPU))),
            xtrg: Some(xtrg.copy()),
            ..Default::default()
        };
        tch::manual_seed(21);
        sampler.sample(5, 1, (4, 8, 8), None, options).unwrap();
        let inputs = model.inputs.borrow();
        assert_eq!(inputs.len(), 5);

        // Each step draws the target noise then the step noise.
        tch::manual_seed(21);
        for (i, input) in inputs.iter().enumerate() {
            let step = schedule.timesteps[4 - i] as i64;
            let t = Tensor::full([1], step, (Kind::Int64, Device::Cpu));
            let img_ref = model.q_sample(&xtrg, &t, None);
            assert!(max_abs_diff(input, &img_ref) < 1e-5, "step {i}");
            let _ = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        }
    }

    #[test]
    fn reset_then_blend_with_previous_direction() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(4, DdimDiscretization::Uniform, 0.).unwrap();
        let x0 = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let xtrg = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let weight = Tensor::full([1, 1, 8, 8], 0.5, kind::FLOAT_CPU);
        let options = SamplingOptions {
            x_t: Some(Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU)),
            x0: Some(x0.copy()),
            strength: 0.5,
            mask: Some(Mask::Weight(weight.copy())),
            xtrg: Some(xtrg.copy()),
            ..Default::default()
        };
        tch::manual_seed(17);
        sampler.sample(4, 1, (4, 8, 8), None, options).unwrap();
        let inputs: Vec<Tensor> = model.inputs.borrow().iter().map(|x| x.copy()).collect();
        assert_eq!(inputs.len(), 4);

        let timestep = |i: usize| {
            Tensor::full([1], schedule.timesteps[3 - i] as i64, (Kind::Int64, Device::Cpu))
        };
        // The direction term returned by the step before the reset.
        let e_t = model.apply_model(&inputs[1], &timestep(1), None).unwrap();
        let coefs = schedule.coefficients(2, false);
        let dir_xt = e_t * (1. - coefs.a_prev - coefs.sigma_t * coefs.sigma_t).sqrt();

        // Two steps with two draws each, then the reset and the target noise.
        tch::manual_seed(17);
        for _ in 0..4 {
            let _ = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        }
        let reset = model.q_sample(&x0, &timestep(2), None);
        let img_ref = model.q_sample(&xtrg, &timestep(2), None);
        let expected = blend_toward_target(&reset, &img_ref, &weight, Some(&dir_xt), None);
        assert!(max_abs_diff(&inputs[2], &expected) < 1e-4);
        let without_dir = blend_toward_target(&reset, &img_ref, &weight, None, None);
        assert!(max_abs_diff(&inputs[2], &without_dir) > 1e-3);
    }

    #[test]
    fn per_step_mask_schedule() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let xtrg = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let mut seen = vec![];
        let mut record = |_: &Tensor, i: usize| -> Result<()> {
            seen.push(i);
            Ok(())
        };
        let weights =
            (0..5).map(|i| if i % 2 == 0 { Some(Tensor::from_slice(&[1f32])) } else { None });
        let options = SamplingOptions {
            mask: Some(Mask::PerStep(weights.collect())),
            xtrg: Some(xtrg),
            img_callback: Some(&mut record),
            ..Default::default()
        };
        let (latent, _) = sampler.sample(5, 1, (4, 8, 8), None, options).unwrap();
        assert_eq!(latent.size(), [1, 4, 8, 8]);
        assert_eq!(seen, [0, 1, 2, 3, 4]);

        let options = SamplingOptions {
            mask: Some(Mask::PerStep((0..3).map(|_| None).collect())),
            xtrg: Some(Tensor::zeros([1, 4, 8, 8], kind::FLOAT_CPU)),
            ..Default::default()
        };
        let err = sampler.sample(5, 1, (4, 8, 8), None, options).unwrap_err();
        assert!(matches!(err, Error::MaskScheduleLength { expected: 5, got: 3 }));
    }

    #[test]
    fn strength_replaces_the_starting_latent() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let x0 = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let run = |x_t: Tensor| {
            tch::manual_seed(11);
            let options = SamplingOptions {
                x_t: Some(x_t),
                x0: Some(x0.copy()),
                strength: 0.,
                ..Default::default()
            };
            sampler.sample(8, 1, (4, 8, 8), None, options).unwrap().0
        };
        let lhs = run(Tensor::zeros([1, 4, 8, 8], kind::FLOAT_CPU));
        let rhs = run(Tensor::ones([1, 4, 8, 8], kind::FLOAT_CPU) * 100.);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn guidance_schedule_must_match_steps() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let options = SamplingOptions { ucg_schedule: Some(vec![7.5; 4]), ..Default::default() };
        let err = sampler.sample(5, 1, (4, 8, 8), None, options).unwrap_err();
        assert!(matches!(err, Error::GuidanceScheduleLength { expected: 5, got: 4 }));
        assert_eq!(model.calls.get(), 0);

        let uncond = Conditioning::from(Tensor::zeros([1, 77, 8], kind::FLOAT_CPU));
        let options = SamplingOptions {
            ucg_schedule: Some(vec![1., 1., 5., 5., 1.]),
            unconditional_conditioning: Some(&uncond),
            ..Default::default()
        };
        sampler.sample(5, 1, (4, 8, 8), None, options).unwrap();
        assert_eq!(model.calls.get(), 7);
    }

    #[test]
    fn rejected_runs_keep_the_installed_controller() {
        let mut model = MockModel::new(Parameterization::Epsilon);
        let hook = AttentionHook::new();
        hook.attach(Some(AttentionPlace::Mid));
        model.hook = Some(hook);
        let sampler = DdimVSampler::new(&model);
        let tracker = Arc::new(Mutex::new(StepTracker::default()));
        let controller: SharedController = tracker.clone();
        let options = SamplingOptions {
            ucg_schedule: Some(vec![7.5; 4]),
            controller: Some(controller.clone()),
            ..Default::default()
        };
        let err = sampler.sample(5, 1, (4, 8, 8), None, options).unwrap_err();
        assert!(matches!(err, Error::GuidanceScheduleLength { .. }));
        let options = SamplingOptions {
            mask: Some(Mask::PerStep(vec![])),
            xtrg: Some(Tensor::zeros([1, 4, 8, 8], kind::FLOAT_CPU)),
            controller: Some(controller),
            ..Default::default()
        };
        let err = sampler.sample(5, 1, (4, 8, 8), None, options).unwrap_err();
        assert!(matches!(err, Error::MaskScheduleLength { .. }));

        let hook = model.attention_hook().unwrap();
        hook.route(Tensor::zeros([1, 4], kind::FLOAT_CPU), false, None);
        let tracker = tracker.lock().unwrap();
        assert_eq!(tracker.attention_calls, 0);
        assert_eq!(tracker.total, None);
    }

    #[test]
    fn subset_of_timesteps() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(10, DdimDiscretization::Uniform, 0.).unwrap();
        let run = |timesteps: usize| {
            let options = SamplingOptions { timesteps: Some(timesteps), ..Default::default() };
            sampler.ddim_sampling(&schedule, None, &[1, 4, 8, 8], options).unwrap();
        };
        run(4);
        assert_eq!(model.calls.get(), 3);
        run(25);
        assert_eq!(model.calls.get(), 3 + 9);
        // An empty subset counts from the end.
        run(0);
        assert_eq!(model.calls.get(), 3 + 9 + 9);
    }

    #[test]
    fn unsupported_step_options() {
        let model = MockModel::new(Parameterization::V);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(10, DdimDiscretization::Uniform, 0.).unwrap();
        let x = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let t = Tensor::full([1], 501, (Kind::Int64, Device::Cpu));

        let options = StepOptions { dynamic_threshold: Some(0.995), ..Default::default() };
        let err = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &options).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));

        struct Noop;
        impl ScoreCorrector for Noop {
            fn modify_score(
                &self,
                e_t: &Tensor,
                _: &Tensor,
                _: &Tensor,
                _: Option<&Conditioning>,
            ) -> Tensor {
                e_t.shallow_clone()
            }
        }
        let options = StepOptions { score_corrector: Some(&Noop), ..Default::default() };
        let err = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &options).unwrap_err();
        assert!(matches!(err, Error::ScoreCorrectorParameterization(Parameterization::V)));

        let options = StepOptions { return_dir: true, ..Default::default() };
        let step = sampler.p_sample_ddim(&schedule, &x, None, &t, 5, &options).unwrap();
        assert!(step.dir_xt.is_some());
        assert_eq!(step.x_prev.size(), [1, 4, 8, 8]);
    }

    #[test]
    fn stochastic_encode_then_reverse_step() {
        tch::manual_seed(5);
        let noise = Tensor::randn([2, 4, 8, 8], kind::FLOAT_CPU);
        let model = OracleModel {
            schedule: NoiseSchedule::new(Default::default(), Device::Cpu),
            noise: noise.copy(),
        };
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(50, DdimDiscretization::Uniform, 0.).unwrap();
        let x0 = Tensor::randn([2, 4, 8, 8], kind::FLOAT_CPU);

        let index = 30;
        let x_t = sampler.stochastic_encode(&schedule, &x0, index, false, Some(noise.copy()));
        let t = Tensor::full([2], schedule.timesteps[index] as i64, (Kind::Int64, Device::Cpu));
        let step =
            sampler.p_sample_ddim(&schedule, &x_t, None, &t, index, &Default::default()).unwrap();
        assert!(max_abs_diff(&step.pred_x0, &x0) < 1e-3);
        let expected = sampler.stochastic_encode(&schedule, &x0, index - 1, false, Some(noise));
        assert!(max_abs_diff(&step.x_prev, &expected) < 1e-3);
    }

    #[test]
    fn stochastic_encode_out_of_range_is_noise() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(10, DdimDiscretization::Uniform, 0.).unwrap();
        let x0 = Tensor::ones([1, 4, 8, 8], kind::FLOAT_CPU);
        let noise = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let out = sampler.stochastic_encode(&schedule, &x0, 10, false, Some(noise.copy()));
        assert_eq!(out, noise);
        let out = sampler.stochastic_encode(&schedule, &x0, 999, true, Some(noise.copy()));
        assert_ne!(out, noise);
    }

    #[test]
    fn encode_records_intermediates() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(20, DdimDiscretization::Uniform, 0.).unwrap();
        let x0 = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let options = EncodeOptions { return_intermediates: Some(5), ..Default::default() };
        let (x_enc, out) = sampler.encode(&schedule, &x0, None, 10, options).unwrap();
        assert_eq!(out.intermediate_steps, [0, 2, 4, 6, 8, 9]);
        assert_eq!(out.intermediates.map(|xs| xs.len()), Some(6));
        assert_eq!(out.x_encoded, x_enc);
        assert_eq!(model.calls.get(), 10);

        let err = sampler.encode(&schedule, &x0, None, 21, Default::default()).unwrap_err();
        assert!(matches!(err, Error::EncodeSteps { t_enc: 21, available: 20 }));
    }

    #[test]
    fn guided_encode_batches_both_branches() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(20, DdimDiscretization::Uniform, 0.).unwrap();
        let x0 = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let cond = Conditioning::from(Tensor::ones([1, 77, 8], kind::FLOAT_CPU));
        let uncond = Conditioning::from(Tensor::zeros([1, 77, 8], kind::FLOAT_CPU));
        let options = EncodeOptions {
            unconditional_guidance_scale: Some(3.),
            unconditional_conditioning: Some(&uncond),
            ..Default::default()
        };
        let (x_enc, out) = sampler.encode(&schedule, &x0, Some(&cond), 4, options).unwrap();
        assert_eq!(x_enc.size(), [1, 4, 8, 8]);
        assert!(out.intermediates.is_none());
        assert_eq!(model.calls.get(), 4);

        let options =
            EncodeOptions { unconditional_guidance_scale: Some(3.), ..Default::default() };
        let err = sampler.encode(&schedule, &x0, Some(&cond), 4, options).unwrap_err();
        assert!(matches!(err, Error::Conditioning(_)));
    }

    #[test]
    fn decode_runs_truncated_schedule() {
        let model = MockModel::new(Parameterization::V);
        let sampler = DdimVSampler::new(&model);
        let schedule = sampler.make_schedule(20, DdimDiscretization::Quad, 0.).unwrap();
        let x = Tensor::randn([1, 4, 8, 8], kind::FLOAT_CPU);
        let mut steps = vec![];
        let mut callback = |i: usize| -> Result<()> {
            steps.push(i);
            Ok(())
        };
        let options = DecodeOptions { callback: Some(&mut callback), ..Default::default() };
        let x_dec = sampler.decode(&schedule, &x, None, 7, options).unwrap();
        assert_eq!(x_dec.size(), [1, 4, 8, 8]);
        assert_eq!(model.calls.get(), 7);
        assert_eq!(steps, [0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn callback_error_stops_sampling() {
        let model = MockModel::new(Parameterization::Epsilon);
        let sampler = DdimVSampler::new(&model);
        let mut callback =
            |i: usize| if i == 2 { Err(Error::Interrupted { step: i }) } else { Ok(()) };
        let options = SamplingOptions { callback: Some(&mut callback), ..Default::default() };
        let err = sampler.sample(10, 1, (4, 8, 8), None, options).unwrap_err();
        assert!(matches!(err, Error::Interrupted { step: 2 }));
        assert_eq!(model.calls.get(), 3);
    }

    #[derive(Default)]
    struct StepTracker {
        total: Option<usize>,
        steps: Vec<usize>,
        attention_calls: usize,
        x0_updates: usize,
    }

    impl AttentionController for StepTracker {
        fn set_total_step(&mut self, total_steps: usize) {
            self.total = Some(total_steps)
        }

        fn set_step(&mut self, step: usize) {
            self.steps.push(step)
        }

        fn control(&mut self, context: Tensor, _: bool, _: Option<AttentionPlace>) -> Tensor {
            self.attention_calls += 1;
            context
        }

        fn update_x0(&mut self, pred_x0: Tensor) -> Tensor {
            self.x0_updates += 1;
            pred_x0.zeros_like()
        }
    }

    #[test]
    fn controller_follows_the_run() {
        let mut model = MockModel::new(Parameterization::Epsilon);
        let hook = AttentionHook::new();
        hook.attach(Some(AttentionPlace::Mid));
        model.hook = Some(hook);
        let sampler = DdimVSampler::new(&model);
        let tracker = Arc::new(Mutex::new(StepTracker::default()));
        let mut denoised = vec![];
        let mut record = |pred_x0: &Tensor, _: usize| -> Result<()> {
            denoised.push(pred_x0.abs().max().double_value(&[]));
            Ok(())
        };
        let controller: SharedController = tracker.clone();
        let options = SamplingOptions {
            controller: Some(controller),
            img_callback: Some(&mut record),
            ..Default::default()
        };
        sampler.sample(5, 1, (4, 8, 8), None, options).unwrap();
        let tracker = tracker.lock().unwrap();
        assert_eq!(tracker.total, Some(5));
        assert_eq!(tracker.steps, [0, 1, 2, 3, 4]);
        assert_eq!(tracker.attention_calls, 5);
        assert_eq!(tracker.x0_updates, 5);
        assert_eq!(denoised, [0.; 5]);

        // Without a controller the identity is installed back.
        sampler.sample(5, 1, (4, 8, 8), None, Default::default()).unwrap();
        assert_eq!(tracker.attention_calls, 5);
    }
}
