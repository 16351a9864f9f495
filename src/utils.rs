// Tensor helpers shared by the schedules and the sampler.
use tch::{Device, Kind, Tensor};

/// A standard normal sample of the given shape. With `repeat` set a single
/// sample is drawn and repeated over the batch dimension.
pub fn noise_like(shape: &[i64], device: Device, repeat: bool) -> Tensor {
    match shape.split_first() {
        Some((&batch, rest)) if repeat => {
            let mut single = vec![1];
            single.extend_from_slice(rest);
            let mut repeats = vec![batch];
            repeats.extend(rest.iter().map(|_| 1));
            Tensor::randn(single.as_slice(), (Kind::Float, device)).repeat(repeats.as_slice())
        }
        _ => Tensor::randn(shape, (Kind::Float, device)),
    }
}

/// Gathers `a[t]` for each batch element and reshapes the result so that it
/// broadcasts against a tensor of shape `x_shape`.
pub fn extract_into_tensor(a: &Tensor, t: &Tensor, x_shape: &[i64]) -> Tensor {
    let batch = t.size()[0];
    let mut shape = vec![batch];
    shape.extend(x_shape.iter().skip(1).map(|_| 1));
    a.gather(-1, &t.to_kind(Kind::Int64).to_device(a.device()), false).reshape(shape.as_slice())
}

/// Per-channel mean and standard deviation of a `(n, c, h, w)` feature map,
/// both of shape `(n, c, 1, 1)`. `eps` is added to the variance.
pub fn calc_mean_std(feat: &Tensor, eps: f64) -> Result<(Tensor, Tensor), tch::TchError> {
    let (n, c, _h, _w) = feat.size4()?;
    let feat = feat.view((n, c, -1));
    let var = feat.var_dim(Some([2].as_slice()), true, false) + eps;
    let std = var.sqrt().view((n, c, 1, 1));
    let mean = feat.mean_dim(Some([2].as_slice()), false, Kind::Float).view((n, c, 1, 1));
    Ok((mean, std))
}

/// Adaptive instance normalization: renormalizes each channel of `content`
/// to the mean and standard deviation of the same channel of `style`.
///
/// Arbitrary Style Transfer in Real-time with Adaptive Instance Normalization,
/// X. Huang, S. Belongie, 2017. https://arxiv.org/abs/1703.06868
pub fn adaptive_instance_normalization(
    content: &Tensor,
    style: &Tensor,
) -> Result<Tensor, tch::TchError> {
    let (cn, cc, _, _) = content.size4()?;
    let (sn, sc, _, _) = style.size4()?;
    if (cn, cc) != (sn, sc) {
        return Err(tch::TchError::Shape(format!(
            "content {:?} and style {:?} differ in batch or channels",
            content.size(),
            style.size()
        )));
    }
    let (style_mean, style_std) = calc_mean_std(style, 1e-5)?;
    let (content_mean, content_std) = calc_mean_std(content, 1e-5)?;
    let normalized = (content - content_mean) / content_std;
    Ok(normalized * style_std + style_mean)
}
