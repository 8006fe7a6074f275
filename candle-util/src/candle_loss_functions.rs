use candle_core::{Result, Tensor};

/// What to do when `‖mask ⊙ x‖` vanishes in the reconstruction loss
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum DenominatorGuard {
    /// divide anyway; a zero norm propagates as a non-finite loss
    #[default]
    Unguarded,
    /// divide by `norm + eps`
    Epsilon(f64),
    /// report an error
    Strict,
}

/// Binary mask of the entries that take part in the reconstruction loss
///
/// * `use_mask = true` - `1[x - delta > 0]`, observed entries only
/// * `use_mask = false` - `1[x - delta + 1 > 0]`, practically everything
///
/// * `x_corrected_nd` - batch-corrected data `x - delta`
pub fn reconstruction_mask(x_corrected_nd: &Tensor, use_mask: bool) -> Result<Tensor> {
    let mask_nd = if use_mask {
        x_corrected_nd.gt(0.0)?
    } else {
        (x_corrected_nd + 1.0)?.gt(0.0)?
    };
    mask_nd.to_dtype(x_corrected_nd.dtype())
}

const NORM_FLOOR: f64 = 1e-24;

/// `‖x‖_F` with a zero gradient at `x = 0`
///
/// `sqrt` has an infinite derivative at zero, and `0 * inf` would put
/// NaN into every upstream gradient.
fn frobenius_norm(x: &Tensor) -> Result<Tensor> {
    let ssq = x.sqr()?.sum_all()?;
    let positive = ssq.gt(0.0)?.to_dtype(ssq.dtype())?;
    ssq.maximum(NORM_FLOOR)?.sqrt()?.mul(&positive)
}

/// Masked reconstruction loss summed over imputation rounds
///
/// loss = Σ_r ‖ m ⊙ recon_r - m ⊙ (x - delta) ‖ / ‖ m ⊙ x ‖
///
/// where `m` is `reconstruction_mask(x - delta, use_mask)`. The
/// denominator deliberately takes the uncorrected data.
///
/// * `recon_nd_list` - reconstruction of each round (n x d)
/// * `x_nd` - observed data (n x d)
/// * `delta_nd` - batch correction (n x d)
/// * `use_mask` - restrict to observed entries
/// * `guard` - zero-denominator policy
///
/// Returns a scalar tensor
pub fn masked_reconstruction_loss(
    recon_nd_list: &[Tensor],
    x_nd: &Tensor,
    delta_nd: &Tensor,
    use_mask: bool,
    guard: DenominatorGuard,
) -> Result<Tensor> {
    if recon_nd_list.is_empty() {
        return Err(candle_core::Error::Msg("no reconstruction to evaluate".into()));
    }

    let x_corrected_nd = (x_nd - delta_nd)?;
    let mask_nd = reconstruction_mask(&x_corrected_nd, use_mask)?;
    let target_nd = x_corrected_nd.mul(&mask_nd)?;

    let denom = frobenius_norm(&x_nd.mul(&mask_nd)?)?;
    let denom = match guard {
        DenominatorGuard::Unguarded => denom,
        DenominatorGuard::Epsilon(eps) => (denom + eps)?,
        DenominatorGuard::Strict => {
            if denom.to_scalar::<f32>()? <= 0. {
                return Err(candle_core::Error::Msg(
                    "masked data norm is zero; nothing to reconstruct".into(),
                ));
            }
            denom
        }
    };

    let mut loss: Option<Tensor> = None;
    for recon_nd in recon_nd_list {
        let resid_nd = (recon_nd.mul(&mask_nd)? - &target_nd)?;
        let loss_r = frobenius_norm(&resid_nd)?.div(&denom)?;
        loss = Some(match loss {
            None => loss_r,
            Some(acc) => (acc + loss_r)?,
        });
    }

    loss.ok_or_else(|| candle_core::Error::Msg("empty loss".into()))
}
