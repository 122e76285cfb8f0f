//! Lookup in tabulated functions.

use crate::error::{Result, SphError};

/// Linear interpolation in a table sampled on a uniform grid.
///
/// `tab_x` must be uniformly spaced and increasing. Values of `x` outside
/// of the table are clamped to the first or last sample.
pub fn interp_1d(x: f64, tab_x: &[f64], tab_y: &[f64]) -> Result<f64> {
    if tab_x.is_empty() || tab_x.len() != tab_y.len() {
        return Err(SphError::Precondition(format!(
            "interpolation table needs matching non-empty columns, got {} and {} samples",
            tab_x.len(),
            tab_y.len()
        )));
    }

    let n = tab_x.len();
    if n == 1 {
        return Ok(tab_y[0]);
    }

    let xmin = tab_x[0];
    let xmax = tab_x[n - 1];
    let x = x.clamp(xmin, xmax);
    let dx = (xmax - xmin) / (n - 1) as f64;

    let ix = (((x - xmin) / dx) as usize).min(n - 2);
    let delx = (x - tab_x[ix]) / dx;

    Ok((1.0 - delx) * tab_y[ix] + delx * tab_y[ix + 1])
}
