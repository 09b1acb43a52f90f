use std::collections::HashSet;

use chrono::NaiveDate;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    data::{
        domain::{AnnualizationFactor, EntityId, IndexCode},
        window::WindowSpec,
    },
    error::{DataError, EngineResult},
    panel::{Panel, benchmark::BenchmarkAligner},
    window::{MetricRecord, WindowResult, reference_row},
};

/// Constants shared by every metrics window of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSettings {
    pub annualization: AnnualizationFactor,
    pub risk_free_index: IndexCode,
    pub market_index: IndexCode,
}

impl Default for MetricSettings {
    fn default() -> Self {
        Self {
            annualization: AnnualizationFactor::default(),
            risk_free_index: IndexCode::from("CDI"),
            market_index: IndexCode::from("IBOV"),
        }
    }
}

/// Metrics-mode window engine over a log-return matrix.
#[derive(Debug)]
pub struct MetricsCalculator<'a> {
    panel: &'a Panel,
    returns: &'a Array2<f64>,
    benchmarks: &'a BenchmarkAligner,
    /// Per panel column: benchmark the information ratio against the market index.
    equity: Vec<bool>,
    settings: MetricSettings,
}

impl<'a> MetricsCalculator<'a> {
    pub fn new(
        panel: &'a Panel,
        returns: &'a Array2<f64>,
        benchmarks: &'a BenchmarkAligner,
        equity: Vec<bool>,
        settings: MetricSettings,
    ) -> EngineResult<Self> {
        if returns.dim() != panel.values().dim() {
            return Err(DataError::ShapeMismatch(format!(
                "returns {:?} vs panel {:?}",
                returns.dim(),
                panel.values().dim()
            ))
            .into());
        }
        if equity.len() != panel.n_entities() {
            return Err(DataError::ShapeMismatch(format!(
                "{} classifications for {} entities",
                equity.len(),
                panel.n_entities()
            ))
            .into());
        }
        Ok(Self {
            panel,
            returns,
            benchmarks,
            equity,
            settings,
        })
    }

    pub fn compute(
        &self,
        reference_date: NaiveDate,
        window: &WindowSpec,
        candidates: Option<&HashSet<EntityId>>,
    ) -> EngineResult<WindowResult> {
        let grid = self.panel.grid();
        let i_end = reference_row(grid, reference_date)?;
        let Some(i_start) = i_end.checked_sub(window.periods()) else {
            return Ok(WindowResult::InsufficientHistory);
        };

        let entities = self.panel.entities();
        let valid: Vec<usize> = self
            .panel
            .inception_rows()
            .iter()
            .enumerate()
            .filter(|(j, inception)| {
                **inception <= i_start && candidates.is_none_or(|c| c.contains(&entities[*j]))
            })
            .map(|(j, _)| j)
            .collect();
        if valid.is_empty() {
            return Ok(WindowResult::Metrics(Vec::new()));
        }

        let block = self
            .returns
            .slice(s![i_start + 1..=i_end, ..])
            .select(Axis(1), &valid);
        if block.nrows() == 0 {
            return Err(DataError::EmptySlice {
                window: window.label().to_string(),
                date: reference_date.to_string(),
            }
            .into());
        }

        let levels = self
            .panel
            .values()
            .slice(s![i_start..=i_end, ..])
            .select(Axis(1), &valid);
        let stats = WindowStats::compute(block.view(), levels.view(), self.settings.annualization);

        // Benchmarks are aligned to the exact dates spanned by the slice, not a day count.
        let window_dates = &grid.dates()[i_start..=i_end];
        let risk_free = self
            .benchmarks
            .window_return(&self.settings.risk_free_index, window_dates);
        let market = self
            .benchmarks
            .window_return(&self.settings.market_index, window_dates);

        let mut records = Vec::with_capacity(valid.len());
        for (k, &j) in valid.iter().enumerate() {
            let ret = stats.ret[k];
            if !ret.is_finite() {
                debug!(
                    entity = %entities[j],
                    window = window.label(),
                    "Non-finite return; row omitted"
                );
                continue;
            }
            let vol = stats.volatility[k];
            let mdd = stats.max_drawdown[k];
            let ir_benchmark = if self.equity[j] { market } else { risk_free };

            records.push(MetricRecord {
                entity: entities[j].clone(),
                reference_date,
                window: window.label().to_string(),
                ret,
                volatility: vol.is_finite().then_some(vol),
                max_drawdown: mdd,
                recovery_time: stats.recovery_time[k],
                sharpe: risk_free.and_then(|rf| ratio(ret - rf, vol)),
                calmar: ratio(ret, mdd.abs()),
                hit_ratio: stats.hit_ratio[k],
                information_ratio: ir_benchmark.and_then(|b| ratio(ret - b, vol)),
            });
        }
        Ok(WindowResult::Metrics(records))
    }
}

/// Column-wise statistics of one window (`periods × entities` returns, `periods + 1` levels).
#[derive(Debug, Clone)]
pub struct WindowStats {
    pub ret: Array1<f64>,
    pub volatility: Array1<f64>,
    pub max_drawdown: Array1<f64>,
    pub recovery_time: Array1<f64>,
    pub hit_ratio: Array1<f64>,
}

impl WindowStats {
    pub fn compute(
        block: ArrayView2<'_, f64>,
        levels: ArrayView2<'_, f64>,
        annualization: AnnualizationFactor,
    ) -> Self {
        let (n, k) = block.dim();

        let ret = block.sum_axis(Axis(0)).mapv(f64::exp_m1);

        let volatility = if n >= 2 {
            block.std_axis(Axis(0), 1.0) * annualization.sqrt()
        } else {
            Array1::from_elem(k, f64::NAN)
        };

        // Drawdowns run on the stored levels: a path rebuilt from log returns can miss an
        // exact return to the previous high by one ulp.
        let profile = levels.map_axis(Axis(0), drawdown_profile);
        let max_drawdown = profile.mapv(|(mdd, _)| mdd);
        let recovery_time = profile.mapv(|(_, recovery)| recovery);

        let hit_ratio = block.map_axis(Axis(0), |c| {
            c.iter().filter(|r| **r > 0.0).count() as f64 / c.len() as f64
        });

        Self {
            ret,
            volatility,
            max_drawdown,
            recovery_time,
            hit_ratio,
        }
    }
}

/// Maximum drawdown and mean underwater-run length of a price path.
///
/// A run still open at the end of the path counts at its truncated length.
pub fn drawdown_profile(path: ArrayView1<'_, f64>) -> (f64, f64) {
    let mut running_max = f64::NEG_INFINITY;
    let mut max_drawdown = 0.0_f64;
    let mut runs = 0usize;
    let mut run_total = 0usize;
    let mut current_run = 0usize;

    for &p in path {
        running_max = running_max.max(p);
        max_drawdown = max_drawdown.min(p / running_max - 1.0);

        if p < running_max {
            current_run += 1;
        } else if current_run > 0 {
            runs += 1;
            run_total += current_run;
            current_run = 0;
        }
    }
    if current_run > 0 {
        runs += 1;
        run_total += current_run;
    }

    let recovery = if runs == 0 {
        0.0
    } else {
        run_total as f64 / runs as f64
    };
    (max_drawdown, recovery)
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (numerator.is_finite() && denominator.is_finite() && denominator != 0.0)
        .then(|| numerator / denominator)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{
        data::{domain::EntityId, grid::DateGrid, observation::EntitySeries},
        panel::{benchmark::BenchmarkSeries, builder::PanelBuilder, returns::log_returns},
    };

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn month_ends(n: usize) -> Vec<NaiveDate> {
        let all = [
            d(2024, 1, 31),
            d(2024, 2, 29),
            d(2024, 3, 31),
            d(2024, 4, 30),
            d(2024, 5, 31),
            d(2024, 6, 30),
            d(2024, 7, 31),
            d(2024, 8, 31),
            d(2024, 9, 30),
        ];
        all[..n].to_vec()
    }

    fn flat_benchmarks(dates: &[NaiveDate]) -> BenchmarkAligner {
        let mut aligner = BenchmarkAligner::default();
        let flat = BenchmarkSeries::new(dates.iter().map(|d| (*d, Some(1.0))));
        aligner.insert(IndexCode::from("CDI"), flat.clone());
        aligner.insert(IndexCode::from("IBOV"), flat);
        aligner
    }

    fn panel_of(rows: &[(&str, &[(NaiveDate, f64)])], dates: &[NaiveDate]) -> Panel {
        let mut series = EntitySeries::new();
        for (code, points) in rows {
            series.insert(
                EntityId::new(*code, None),
                points.iter().map(|(d, v)| (*d, Some(*v))).collect(),
            );
        }
        PanelBuilder::new(DateGrid::observed(dates.iter().copied()))
            .build(&series)
            .expect("panel builds")
    }

    fn metrics(result: WindowResult) -> Vec<MetricRecord> {
        match result {
            WindowResult::Metrics(rows) => rows,
            other => panic!("expected metrics rows, got {other:?}"),
        }
    }

    #[test]
    fn four_month_example_matches_hand_computation() {
        let dates = month_ends(4);
        let e1: Vec<_> = dates.iter().copied().zip([100.0, 110.0, 99.0, 121.0]).collect();
        let panel = panel_of(&[("E1", e1.as_slice())], &dates);
        let returns = log_returns(panel.values());
        let bench = flat_benchmarks(&dates);
        let calc = MetricsCalculator::new(
            &panel,
            &returns,
            &bench,
            vec![false],
            MetricSettings::default(),
        )
        .expect("calculator");

        let one = WindowSpec::new("1P", 1).expect("window");
        let rows = metrics(calc.compute(dates[3], &one, None).expect("compute"));
        assert_eq!(rows.len(), 1);
        assert!(
            (rows[0].ret - (121.0 / 99.0 - 1.0)).abs() < 1e-12,
            "1-period return mismatch: {}",
            rows[0].ret
        );
        assert_eq!(rows[0].volatility, None, "a single return has no sample deviation");
        assert_eq!(rows[0].sharpe, None);

        let three = WindowSpec::new("3P", 3).expect("window");
        let rows = metrics(calc.compute(dates[3], &three, None).expect("compute"));
        let r = &rows[0];
        assert!((r.ret - 0.21).abs() < 1e-12, "3-period return mismatch: {}", r.ret);
        assert!(
            (r.max_drawdown - (99.0 / 110.0 - 1.0)).abs() < 1e-12,
            "drawdown mismatch: {}",
            r.max_drawdown
        );
        assert!((r.max_drawdown + 0.10).abs() < 1e-12);
        assert_eq!(r.recovery_time, 1.0);
        assert!((r.hit_ratio - 2.0 / 3.0).abs() < 1e-12);

        let vol = r.volatility.expect("volatility defined");
        let sharpe = r.sharpe.expect("sharpe defined");
        assert!((sharpe - r.ret / vol).abs() < 1e-12, "flat risk-free benchmark");

        let calmar = r.calmar.expect("calmar defined");
        assert!(
            (calmar * r.max_drawdown.abs() - r.ret).abs() < 1e-12,
            "calmar × |mdd| must reconstruct the return"
        );
    }

    #[test]
    fn window_without_history_is_skipped() {
        let dates = month_ends(4);
        let e1: Vec<_> = dates.iter().copied().zip([100.0, 110.0, 99.0, 121.0]).collect();
        let panel = panel_of(&[("E1", e1.as_slice())], &dates);
        let returns = log_returns(panel.values());
        let bench = flat_benchmarks(&dates);
        let calc =
            MetricsCalculator::new(&panel, &returns, &bench, vec![false], MetricSettings::default())
                .expect("calculator");

        let w = WindowSpec::new("3P", 3).expect("window");
        assert_eq!(
            calc.compute(dates[2], &w, None).expect("compute"),
            WindowResult::InsufficientHistory
        );
        assert!(calc.compute(d(2024, 4, 15), &w, None).is_err(), "off-grid date");
    }

    #[test]
    fn late_entity_excluded_until_window_starts_after_inception() {
        let dates = month_ends(9);
        let old: Vec<_> = dates.iter().map(|d| (*d, 100.0)).collect();
        let late: Vec<_> = dates[5..].iter().map(|d| (*d, 10.0)).collect();
        let panel = panel_of(&[("E1", old.as_slice()), ("E2", late.as_slice())], &dates);
        let returns = log_returns(panel.values());
        let bench = flat_benchmarks(&dates);
        let calc = MetricsCalculator::new(
            &panel,
            &returns,
            &bench,
            vec![false, false],
            MetricSettings::default(),
        )
        .expect("calculator");
        let w = WindowSpec::new("3P", 3).expect("window");
        let e2 = EntityId::new("E2", None);

        // Aug: window starts in May, before E2's June inception.
        let rows = metrics(calc.compute(dates[7], &w, None).expect("compute"));
        assert!(rows.iter().all(|r| r.entity != e2));
        assert_eq!(rows.len(), 1);

        // Sep: window starts in June.
        let rows = metrics(calc.compute(dates[8], &w, None).expect("compute"));
        assert!(rows.iter().any(|r| r.entity == e2));
    }

    #[test]
    fn candidates_restrict_output() {
        let dates = month_ends(3);
        let a: Vec<_> = dates.iter().map(|d| (*d, 1.0)).collect();
        let panel = panel_of(&[("A", a.as_slice()), ("B", a.as_slice())], &dates);
        let returns = log_returns(panel.values());
        let bench = flat_benchmarks(&dates);
        let calc = MetricsCalculator::new(
            &panel,
            &returns,
            &bench,
            vec![false, false],
            MetricSettings::default(),
        )
        .expect("calculator");
        let w = WindowSpec::new("1P", 1).expect("window");

        let only_b: HashSet<_> = [EntityId::new("B", None)].into_iter().collect();
        let rows = metrics(calc.compute(dates[2], &w, Some(&only_b)).expect("compute"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity.code(), "B");
        assert_eq!(rows[0].calmar, None, "no drawdown, calmar undefined");
        assert_eq!(rows[0].recovery_time, 0.0);
    }

    #[test]
    fn information_ratio_uses_market_index_for_equity() {
        let dates = month_ends(3);
        let e: Vec<_> = dates.iter().copied().zip([100.0, 104.0, 103.0]).collect();
        let panel = panel_of(&[("EQ", e.as_slice()), ("FI", e.as_slice())], &dates);
        let returns = log_returns(panel.values());

        let mut bench = BenchmarkAligner::default();
        bench.insert(
            IndexCode::from("CDI"),
            BenchmarkSeries::new(dates.iter().copied().zip([Some(1.0), Some(1.01), Some(1.02)])),
        );
        bench.insert(
            IndexCode::from("IBOV"),
            BenchmarkSeries::new(dates.iter().copied().zip([Some(10.0), Some(9.0), Some(11.0)])),
        );
        let calc = MetricsCalculator::new(
            &panel,
            &returns,
            &bench,
            vec![true, false],
            MetricSettings::default(),
        )
        .expect("calculator");
        let w = WindowSpec::new("2P", 2).expect("window");
        let rows = metrics(calc.compute(dates[2], &w, None).expect("compute"));

        let eq = rows.iter().find(|r| r.entity.code() == "EQ").expect("EQ row");
        let fi = rows.iter().find(|r| r.entity.code() == "FI").expect("FI row");
        let vol = eq.volatility.expect("vol");

        let ir_eq = eq.information_ratio.expect("ir");
        let ir_fi = fi.information_ratio.expect("ir");
        assert!((ir_eq - (eq.ret - 0.1) / vol).abs() < 1e-12);
        assert!((ir_fi - (fi.ret - 0.02) / vol).abs() < 1e-12);
        assert_eq!(fi.sharpe, fi.information_ratio, "non-equity IR equals sharpe");
    }

    #[test]
    fn exact_return_to_high_ends_the_drawdown() {
        let dates = month_ends(4);
        let e: Vec<_> = dates.iter().copied().zip([100.0, 100.37, 82.88, 100.37]).collect();
        let panel = panel_of(&[("E", e.as_slice())], &dates);
        let returns = log_returns(panel.values());
        let bench = flat_benchmarks(&dates);
        let calc =
            MetricsCalculator::new(&panel, &returns, &bench, vec![false], MetricSettings::default())
                .expect("calculator");

        let w = WindowSpec::new("3P", 3).expect("window");
        let rows = metrics(calc.compute(dates[3], &w, None).expect("compute"));
        assert_eq!(rows[0].recovery_time, 1.0, "one period under water");
        assert!((rows[0].max_drawdown - (82.88 / 100.37 - 1.0)).abs() < 1e-12);

        let path = array![1.0, 1.0037, 0.8288, 1.0037];
        let (_, recovery) = drawdown_profile(path.view());
        assert_eq!(recovery, 1.0);
    }

    #[test]
    fn open_drawdown_counts_at_truncated_length() {
        let path = array![1.0, 0.9, 0.95];
        let (mdd, recovery) = drawdown_profile(path.view());
        assert!((mdd + 0.1).abs() < 1e-12);
        assert_eq!(recovery, 2.0);

        let path = array![1.0, 0.9, 1.1, 1.0, 1.2, 1.1];
        let (_, recovery) = drawdown_profile(path.view());
        assert_eq!(recovery, 1.0, "three one-period runs");
    }
}
