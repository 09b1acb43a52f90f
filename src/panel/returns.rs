use ndarray::{Array2, ArrayView2, Zip, s};

use crate::{data::window::Mode, panel::Panel};

/// The per-mode series the window engine slices.
#[derive(Debug, Clone)]
pub enum DerivedSeries {
    /// `r[t] = ln(v[t] / v[t-1])`; row 0 and every step touching an absent value are `NaN`.
    LogReturns(Array2<f64>),
    /// The panel levels, unchanged.
    Levels(Array2<f64>),
}

impl DerivedSeries {
    pub fn derive(panel: &Panel, mode: Mode) -> Self {
        match mode {
            Mode::Metrics => Self::LogReturns(log_returns(panel.values())),
            Mode::Flow => Self::Levels(panel.values().to_owned()),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::LogReturns(_) => Mode::Metrics,
            Self::Levels(_) => Mode::Flow,
        }
    }

    pub fn matrix(&self) -> &Array2<f64> {
        match self {
            Self::LogReturns(m) | Self::Levels(m) => m,
        }
    }
}

/// Log returns along the date axis. Undefined inputs propagate as `NaN`, never as `0`.
pub fn log_returns(levels: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::from_elem(levels.raw_dim(), f64::NAN);
    if levels.nrows() < 2 {
        return out;
    }

    Zip::from(out.slice_mut(s![1.., ..]))
        .and(levels.slice(s![1.., ..]))
        .and(levels.slice(s![..-1, ..]))
        .for_each(|r, &cur, &prev| {
            *r = if cur > 0.0 && prev > 0.0 {
                (cur / prev).ln()
            } else {
                f64::NAN
            };
        });
    out
}
