//! # Attention control
//!
//! Every attention layer built by this crate holds a clone of an
//! [`AttentionHook`] together with its position in the UNet. On each
//! forward pass the layer hands the tensor used for the key/value
//! projections to the controller installed in the hook and uses whatever
//! comes back. This is the single entry point for externally injected
//! attention behaviour, e.g. substituting keys and values from another
//! frame when editing videos.
//!
//! A hook starts with an [`IdentityController`] so that networks can always
//! be run without any controller being registered.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tch::Tensor;

/// The UNet branch an attention layer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionPlace {
    Down,
    Mid,
    Up,
}

impl AttentionPlace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Mid => "mid",
            Self::Up => "up",
        }
    }
}

impl std::fmt::Display for AttentionPlace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stateful object steering the attention layers and the denoised
/// estimates of a sampling run.
pub trait AttentionController: Send {
    /// Called once before the first step with the number of steps to run.
    fn set_total_step(&mut self, _total_steps: usize) {}

    /// Called at the beginning of each step.
    fn set_step(&mut self, _step: usize) {}

    /// Called by every attention layer with the tensor that is about to be
    /// projected to keys and values: the conditioning for cross-attention,
    /// the layer input for self-attention.
    fn control(
        &mut self,
        context: Tensor,
        is_cross: bool,
        place: Option<AttentionPlace>,
    ) -> Tensor;

    /// Called once per step on the denoised estimate.
    fn update_x0(&mut self, pred_x0: Tensor) -> Tensor {
        pred_x0
    }
}

/// Returns the attention inputs unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityController;

impl AttentionController for IdentityController {
    fn control(&mut self, context: Tensor, _: bool, _: Option<AttentionPlace>) -> Tensor {
        context
    }
}

pub type SharedController = Arc<Mutex<dyn AttentionController>>;

pub fn shared<C: AttentionController + 'static>(controller: C) -> SharedController {
    Arc::new(Mutex::new(controller))
}

pub(crate) fn lock(controller: &SharedController) -> MutexGuard<'_, dyn AttentionController + 'static> {
    controller.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HookState {
    controller: SharedController,
    places: Vec<Option<AttentionPlace>>,
}

/// Shared slot through which all the attention layers of one network reach
/// the current controller.
#[derive(Clone)]
pub struct AttentionHook {
    state: Arc<Mutex<HookState>>,
}

impl Default for AttentionHook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AttentionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionHook").field("layers", &self.num_layers()).finish()
    }
}

impl AttentionHook {
    pub fn new() -> Self {
        let state = HookState { controller: shared(IdentityController), places: vec![] };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new attention layer, called when the layer is built.
    pub(crate) fn attach(&self, place: Option<AttentionPlace>) {
        self.state().places.push(place)
    }

    /// The positions of the attention layers routed through this hook, in
    /// construction order.
    pub fn places(&self) -> Vec<Option<AttentionPlace>> {
        self.state().places.clone()
    }

    pub fn num_layers(&self) -> usize {
        self.state().places.len()
    }

    pub fn controller(&self) -> SharedController {
        self.state().controller.clone()
    }

    fn install(&self, controller: SharedController) {
        self.state().controller = controller
    }

    pub(crate) fn route(
        &self,
        context: Tensor,
        is_cross: bool,
        place: Option<AttentionPlace>,
    ) -> Tensor {
        // Release the hook before running the controller so that it can
        // query the hook itself.
        let controller = self.controller();
        let mut controller = lock(&controller);
        controller.control(context, is_cross, place)
    }
}

/// Installs `controller` in the hook shared by the attention layers of a
/// network, or an [`IdentityController`] when `None`. Returns the number of
/// attention layers now routed through the controller; a hook without any
/// attention layer is left untouched.
pub fn register_attention_control(
    hook: &AttentionHook,
    controller: Option<SharedController>,
) -> usize {
    let num_layers = hook.num_layers();
    if num_layers == 0 {
        return 0;
    }
    let controller = controller.unwrap_or_else(|| shared(IdentityController));
    hook.install(controller);
    log::debug!("registered attention control on {num_layers} layers");
    num_layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(bool, Option<AttentionPlace>)>,
    }

    impl AttentionController for Recorder {
        fn control(
            &mut self,
            context: Tensor,
            is_cross: bool,
            place: Option<AttentionPlace>,
        ) -> Tensor {
            self.calls.push((is_cross, place));
            context * 2.
        }
    }

    #[test]
    fn register_without_layers_is_noop() {
        let hook = AttentionHook::new();
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let controller: SharedController = recorder.clone();
        assert_eq!(register_attention_control(&hook, Some(controller)), 0);
        let xs = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        let ys = hook.route(xs.shallow_clone(), false, None);
        assert_eq!(ys, xs);
        assert!(recorder.lock().unwrap().calls.is_empty());
    }

    #[test]
    fn route_goes_through_registered_controller() {
        let hook = AttentionHook::new();
        hook.attach(Some(AttentionPlace::Down));
        hook.attach(Some(AttentionPlace::Up));
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let controller: SharedController = recorder.clone();
        assert_eq!(register_attention_control(&hook, Some(controller)), 2);
        let xs = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        let ys = hook.route(xs, true, Some(AttentionPlace::Mid));
        assert_eq!(ys.double_value(&[0, 0]), 2.);
        assert_eq!(recorder.lock().unwrap().calls, vec![(true, Some(AttentionPlace::Mid))]);

        // Registering without a controller restores the identity.
        assert_eq!(register_attention_control(&hook, None), 2);
        let xs = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        assert_eq!(hook.route(xs.shallow_clone(), true, None), xs);
        assert_eq!(recorder.lock().unwrap().calls.len(), 1);
    }

    #[test]
    fn place_names() {
        let places = [AttentionPlace::Down, AttentionPlace::Mid, AttentionPlace::Up];
        let names: Vec<_> = places.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, ["down", "mid", "up"]);
    }
}
