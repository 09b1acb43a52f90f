use fundmetrics::prelude::*;

mod common;
use common::*;

#[test]
fn e1_windows_match_hand_computed_values() {
    let store = FixtureBuilder::new()
        .fund("E1", None, 1, &[100.0, 110.0, 99.0, 121.0])
        .benchmarks()
        .build();
    let engine = Engine::new(metrics_config(vec![window("1M", 1), window("3M", 3)]))
        .expect("engine");

    let summaries = engine.run(&store, &store, &store).expect("run");
    let summary = summaries[0];
    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.written, 3, "Feb, Mar and Apr have at least one window");
    assert_eq!(summary.skipped_empty, 1, "Jan has no history");
    assert_eq!(summary.rows, 4);

    let rows = store.metric_rows();
    let one = find_metric(&rows, "E1 | MASTER", me(4), "1M").expect("1M row at Apr");
    assert_close(one.ret, 121.0 / 99.0 - 1.0, "1M return");
    assert_eq!(one.volatility, None, "a single period has no volatility");
    assert_eq!(one.hit_ratio, 1.0);

    let three = find_metric(&rows, "E1 | MASTER", me(4), "3M").expect("3M row at Apr");
    assert_close(three.ret, 0.21, "3M return");
    assert_close(three.max_drawdown, -0.10, "3M max drawdown");
    assert_close(three.recovery_time, 1.0, "3M recovery time");
    assert_close(three.hit_ratio, 2.0 / 3.0, "3M hit ratio");

    let calmar = three.calmar.expect("calmar defined");
    assert_close(calmar * three.max_drawdown.abs(), three.ret, "calmar composition law");

    // Not equity-classified, so the information ratio uses the risk-free index like Sharpe.
    let cdi = 1.01_f64.powi(3) - 1.0;
    let vol = three.volatility.expect("volatility defined");
    assert_close(three.sharpe.expect("sharpe"), (0.21 - cdi) / vol, "sharpe");
    assert_close(
        three.information_ratio.expect("information ratio"),
        (0.21 - cdi) / vol,
        "information ratio",
    );

    assert!(find_metric(&rows, "E1 | MASTER", me(2), "3M").is_none());
    assert!(find_metric(&rows, "E1 | MASTER", me(3), "3M").is_none());
}

#[test]
fn equity_funds_are_compared_with_the_market_index() {
    let store = FixtureBuilder::new()
        .fund("EQ", None, 1, &[100.0, 110.0, 99.0, 121.0])
        .benchmarks()
        .classification("EQ", "Ações Livre")
        .build();
    let engine = Engine::new(metrics_config(vec![window("3M", 3)])).expect("engine");
    engine.run(&store, &store, &store).expect("run");

    let rows = store.metric_rows();
    let row = find_metric(&rows, "EQ | MASTER", me(4), "3M").expect("row");
    let vol = row.volatility.expect("volatility");
    let ibov = 1.02_f64.powi(3) - 1.0;
    assert_close(
        row.information_ratio.expect("information ratio"),
        (0.21 - ibov) / vol,
        "equity information ratio",
    );
}

#[test]
fn late_inception_is_excluded_until_the_window_is_covered() {
    let store = FixtureBuilder::new()
        .fund("E1", None, 1, &[100.0; 12])
        .fund("E2", Some("S1"), 6, &[10.0, 10.5, 11.0, 11.5, 12.0, 12.5, 13.0])
        .benchmarks()
        .build();
    let engine = Engine::new(metrics_config(vec![window("3M", 3)])).expect("engine");
    engine.run(&store, &store, &store).expect("run");

    let rows = store.metric_rows();
    for month in 4..=8 {
        assert!(
            find_metric(&rows, "E2 | S1", me(month), "3M").is_none(),
            "E2 must be skipped at month {month}"
        );
        assert!(find_metric(&rows, "E1 | MASTER", me(month), "3M").is_some());
    }
    let sep = find_metric(&rows, "E2 | S1", me(9), "3M").expect("E2 at Sep");
    assert_close(sep.ret, 11.5 / 10.0 - 1.0, "E2 3M return at Sep");
}

#[test]
fn second_run_writes_nothing_new() {
    let store = FixtureBuilder::new()
        .fund("E1", None, 1, &[100.0, 110.0, 99.0, 121.0, 125.0, 130.0])
        .fund("E3", Some("S2"), 1, &[50.0, 51.0, 49.0, 52.0, 53.0, 54.0])
        .benchmarks()
        .build();
    let engine = Engine::new(metrics_config(vec![window("1M", 1), window("3M", 3)]))
        .expect("engine");

    let first = engine.run(&store, &store, &store).expect("first run")[0];
    let rows_after_first = store.metric_rows().len();
    assert_eq!(first.rows, rows_after_first);

    let second = engine.run(&store, &store, &store).expect("second run")[0];
    assert_eq!(second.written, 0);
    assert_eq!(second.rows, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(store.metric_rows().len(), rows_after_first, "no duplicate rows");
}

#[test]
fn interrupted_date_is_completed_by_the_next_run() {
    let store = FixtureBuilder::new()
        .fund("E1", None, 1, &[100.0, 101.0, 102.0, 99.0, 104.0, 105.0, 103.0, 108.0, 110.0])
        .benchmarks()
        .build();
    let engine = Engine::new(metrics_config(vec![window("1M", 1), window("3M", 3)]))
        .expect("engine");

    store.fail_writes_on(me(7));
    let first = engine.run(&store, &store, &store).expect("first run")[0];
    assert_eq!(first.failed, 1);
    assert!(
        store.metric_rows().iter().all(|r| r.reference_date != me(7)),
        "a failed date leaves no partial rows"
    );
    let before = store.metric_rows().len();

    store.clear_failures();
    let second = engine.run(&store, &store, &store).expect("second run")[0];
    assert_eq!(second.written, 1, "only July is written");
    assert_eq!(second.rows, 2);
    assert_eq!(store.metric_rows().len(), before + 2);

    let july: Vec<_> = store
        .metric_rows()
        .into_iter()
        .filter(|r| r.reference_date == me(7))
        .collect();
    assert_eq!(july.len(), 2, "July has both windows");
}

#[test]
fn export_writes_one_file_per_written_date() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FixtureBuilder::new()
        .fund("E1", None, 1, &[100.0, 110.0, 99.0, 121.0])
        .benchmarks()
        .build();
    let config = metrics_config(vec![window("1M", 1)]).with_export(ExportConfig {
        dir: dir.path().to_path_buf(),
        format: FileExtension::Json,
    });
    Engine::new(config)
        .expect("engine")
        .run(&store, &store, &store)
        .expect("run");

    for month in 2..=4 {
        let path = dir.path().join(format!("fund_metrics_{}.json", me(month)));
        assert!(path.exists(), "missing export {}", path.display());
    }
    assert!(!dir.path().join(format!("fund_metrics_{}.json", me(1))).exists());
}
