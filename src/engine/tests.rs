use super::*;
use crate::aggregates::{mean_of_children, sum_of_children};
use crate::error::Result;
use crate::grid::{QuadGrid, TileCell};
use crate::types::{Estimate, MAX_DEGREE};
use futures::stream;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Interval of a binary (or n-ary) subdivision, for hand-sized trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BinCell {
    level: u8,
    index: u32,
}

impl BinCell {
    fn new(level: u8, index: u32) -> Self {
        Self { level, index }
    }
}

impl Cell for BinCell {
    fn resolution(&self) -> u8 {
        self.level
    }
}

impl fmt::Display for BinCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}:{}", self.level, self.index)
    }
}

struct TestGrid {
    max: u8,
    fanout: u32,
    weighted: bool,
}

impl TestGrid {
    fn binary(max: u8) -> Arc<Self> {
        Arc::new(Self {
            max,
            fanout: 2,
            weighted: false,
        })
    }
}

impl Grid<BinCell> for TestGrid {
    fn is_bottom(&self, cell: &BinCell) -> bool {
        cell.level >= self.max
    }

    fn children(&self, cell: &BinCell) -> Result<Vec<BinCell>> {
        Ok((0..self.fanout)
            .map(|k| BinCell::new(cell.level + 1, cell.index * self.fanout + k))
            .collect())
    }

    fn child_weight(&self, _parent: &BinCell, child: &BinCell) -> f64 {
        match (self.weighted, child.index % 2) {
            (true, 0) => 3.0,
            _ => 1.0,
        }
    }
}

/// Input yielding a complete value after a per-cell delay
struct DelayedSource {
    delay_ms: fn(&BinCell) -> u64,
    value: fn(&BinCell) -> f64,
}

impl EstimateSource<BinCell, f64> for DelayedSource {
    fn estimate_stream_at(&self, cell: &BinCell) -> EstimateStream<f64> {
        let delay = Duration::from_millis((self.delay_ms)(cell));
        let value = (self.value)(cell);
        EstimateStream::from_stream(stream::once(async move {
            sleep(delay).await;
            Ok(Estimate::complete(value))
        }))
    }
}

/// Input that never produces anything
struct StalledSource;

impl EstimateSource<BinCell, f64> for StalledSource {
    fn estimate_stream_at(&self, _cell: &BinCell) -> EstimateStream<f64> {
        EstimateStream::from_stream(stream::pending())
    }
}

fn two_leaves() -> PyramidBuilder<BinCell, f64> {
    Pyramid::builder("two-leaves", TestGrid::binary(2))
        .map_fn(|_, cell: &BinCell| Ok(if cell.index == 0 { 10.0 } else { 20.0 }))
        .aggregate_fn(mean_of_children)
}

async fn wait_idle(metrics: &PyramidMetrics, pyramid: &str) {
    timeout(Duration::from_secs(2), async {
        while metrics.active_tasks(pyramid) != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("evaluation tasks still running");
}

fn assert_strictly_increasing(degrees: &[f64]) {
    assert!(
        degrees.windows(2).all(|pair| pair[0] < pair[1]),
        "degrees not increasing: {:?}",
        degrees
    );
}

#[tokio::test]
async fn test_mean_of_two_leaves_emits_once() {
    let pyramid = two_leaves().build().unwrap();

    let drained = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .collect_estimates()
        .await;

    assert!(drained.is_ok());
    assert_eq!(drained.estimates, vec![Estimate::complete(15.0)]);
}

#[tokio::test]
async fn test_leaf_failure_closes_parent_without_emitting() {
    let pyramid = Pyramid::builder("failing", TestGrid::binary(2))
        .map_fn(|_, cell: &BinCell| match cell.index {
            0 => Ok(10.0),
            _ => Err(anyhow::anyhow!("no survey data")),
        })
        .aggregate_fn(mean_of_children)
        .build()
        .unwrap();

    let root = BinCell::new(1, 0);
    let drained = pyramid.estimate_stream_at(&root).collect_estimates().await;

    assert!(drained.estimates.is_empty());
    match drained.error {
        Some(PyramidError::Aggregation {
            cell,
            source_slot,
            cause,
        }) => {
            assert_eq!(cell, root.to_string());
            assert_eq!(source_slot, BinCell::new(2, 1).to_string());
            assert!(matches!(*cause, PyramidError::MapEvaluation { ref message, .. } if message.contains("no survey data")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_nested_failure_path() {
    let pyramid = Pyramid::builder("nested", TestGrid::binary(3))
        .map_fn(|_, cell: &BinCell| match cell.index {
            3 => Err(anyhow::anyhow!("corrupt tile")),
            _ => Ok(1.0),
        })
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let err = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .final_estimate()
        .await
        .unwrap_err();

    assert_eq!(err.path(), vec!["L1:0", "L2:1", "L3:3"]);
    assert!(matches!(err.origin(), PyramidError::MapEvaluation { cell, .. } if cell == "L3:3"));
}

#[tokio::test]
async fn test_bottom_cell_evaluates_map_directly() {
    let pyramid = two_leaves().build().unwrap();

    let drained = pyramid
        .estimate_stream_at(&BinCell::new(2, 1))
        .collect_estimates()
        .await;
    assert_eq!(drained.estimates, vec![Estimate::complete(20.0)]);

    let deeper = pyramid
        .estimate_stream_at(&BinCell::new(5, 0))
        .final_estimate()
        .await
        .unwrap();
    assert_eq!(deeper.value, 10.0);
}

#[tokio::test]
async fn test_full_aggregation_waits_for_every_child() {
    let grid = Arc::new(QuadGrid::with_levels(3).unwrap());
    let pyramid = Pyramid::builder("tiles", grid)
        .map_fn(|_, _: &TileCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let drained = pyramid
        .estimate_stream_at(&TileCell::root())
        .collect_estimates()
        .await;
    assert_eq!(drained.estimates, vec![Estimate::complete(16.0)]);
}

#[tokio::test]
async fn test_partial_aggregation_is_monotone_and_terminates() {
    let grid = Arc::new(QuadGrid::with_levels(4).unwrap());
    let pyramid = Pyramid::builder("tiles", grid)
        .map_fn(|_, _: &TileCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .with_partial_aggregation(true)
        .build()
        .unwrap();

    let drained = timeout(
        Duration::from_secs(5),
        pyramid.estimate_stream_at(&TileCell::root()).collect_estimates(),
    )
    .await
    .unwrap();

    assert!(drained.is_ok());
    assert!(drained.estimates.len() >= 2);
    let degrees = drained.degrees();
    assert_strictly_increasing(&degrees);
    assert!(degrees[0] < MAX_DEGREE);

    let last = drained.last().unwrap();
    assert_eq!(last.degree, MAX_DEGREE);
    assert_eq!(last.value, 64.0);
}

#[tokio::test]
async fn test_inputs_at_leaf_and_inner_cells() {
    let grid = Arc::new(QuadGrid::with_levels(2).unwrap());
    let intensity = FnSource::new("intensity", |tile: &TileCell| Ok(f64::from(tile.z)));

    let pyramid = Pyramid::builder("damage", grid)
        .with_input("intensity", intensity)
        .map_fn(|inputs, _: &TileCell| Ok(inputs.require("intensity")? * 10.0))
        .aggregate_fn(|contributions, _: &TileCell| {
            let children: f64 = contributions.child_values().sum();
            Ok(children + contributions.require("intensity")?)
        })
        .build()
        .unwrap();

    let leaf = pyramid
        .estimate_stream_at(&TileCell::new(2, 1, 2))
        .final_estimate()
        .await
        .unwrap();
    assert_eq!(leaf.value, 20.0);

    let root = pyramid
        .estimate_stream_at(&TileCell::root())
        .final_estimate()
        .await
        .unwrap();
    assert_eq!(root.value, 81.0);
}

#[tokio::test]
async fn test_missing_input_is_map_error() {
    let pyramid = Pyramid::builder("damage", TestGrid::binary(2))
        .map_fn(|inputs, _: &BinCell| Ok(*inputs.require("exposure")?))
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let err = pyramid
        .estimate_stream_at(&BinCell::new(2, 0))
        .final_estimate()
        .await
        .unwrap_err();
    assert!(matches!(err, PyramidError::MapEvaluation { ref message, .. } if message.contains("exposure")));
}

#[tokio::test]
async fn test_failing_input_at_leaf() {
    let broken: FnSource<BinCell, f64> =
        FnSource::new("intensity", |_| Err(anyhow::anyhow!("feed unavailable")));
    let pyramid = two_leaves().with_input("intensity", broken).build().unwrap();

    let leaf = BinCell::new(2, 0);
    let err = pyramid
        .estimate_stream_at(&leaf)
        .final_estimate()
        .await
        .unwrap_err();

    assert_eq!(err.path(), vec!["L2:0", "input 'intensity'"]);
    assert!(matches!(err.origin(), PyramidError::MapEvaluation { .. }));
}

#[tokio::test]
async fn test_failing_input_beside_stalled_input_fails_fast() {
    let broken: FnSource<BinCell, f64> =
        FnSource::new("broken", |_| Err(anyhow::anyhow!("feed unavailable")));
    let pyramid = two_leaves()
        .with_input("broken", broken)
        .with_input("never", StalledSource)
        .build()
        .unwrap();

    for cell in [BinCell::new(2, 0), BinCell::new(1, 0)] {
        let err = timeout(
            Duration::from_secs(2),
            pyramid.estimate_stream_at(&cell).final_estimate(),
        )
        .await
        .expect("failing input did not close the stream")
        .unwrap_err();

        match err {
            PyramidError::Aggregation {
                cell: ref failed_at,
                ref source_slot,
                ..
            } => {
                assert_eq!(failed_at, &cell.to_string());
                assert_eq!(source_slot, "input 'broken'");
            }
            other => panic!("unexpected error at {cell}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_empty_child_set() {
    let grid = Arc::new(TestGrid {
        max: 3,
        fanout: 0,
        weighted: false,
    });
    let pyramid = Pyramid::builder("empty", grid)
        .map_fn(|_, _: &BinCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let err = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .final_estimate()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PyramidError::EmptyChildSet {
            cell: "L1:0".to_string()
        }
    );
}

#[tokio::test]
async fn test_unsupported_cell() {
    let grid = Arc::new(QuadGrid::with_levels(3).unwrap());
    let pyramid = Pyramid::builder("tiles", grid)
        .map_fn(|_, _: &TileCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let err = pyramid
        .estimate_stream_at(&TileCell::new(2, 5, 1))
        .final_estimate()
        .await
        .unwrap_err();
    assert!(matches!(err, PyramidError::UnsupportedCell { ref cell } if cell == "2/5/1"));
}

#[tokio::test]
async fn test_aggregate_failure() {
    let pyramid = two_leaves()
        .aggregate_fn(|_, _: &BinCell| Err(anyhow::anyhow!("overflow")))
        .build()
        .unwrap();

    let drained = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .collect_estimates()
        .await;
    assert!(drained.estimates.is_empty());
    assert!(matches!(
        drained.error,
        Some(PyramidError::AggregateEvaluation { ref cell, ref message }) if cell == "L1:0" && message == "overflow"
    ));
}

#[tokio::test]
async fn test_sibling_timing_does_not_change_result() {
    async fn evaluate(delay_ms: fn(&BinCell) -> u64) -> Estimate<f64> {
        let delays = DelayedSource {
            delay_ms,
            value: |_| 0.0,
        };
        Pyramid::builder("timing", TestGrid::binary(4))
            .with_input("clock", delays)
            .map_fn(|_, cell: &BinCell| Ok(f64::from(cell.index + 1)))
            .aggregate_fn(sum_of_children)
            .with_partial_aggregation(true)
            .build()
            .unwrap()
            .estimate_stream_at(&BinCell::new(1, 0))
            .final_estimate()
            .await
            .unwrap()
    }

    let forward = evaluate(|cell| u64::from(cell.index % 5) * 3).await;
    let backward = evaluate(|cell| u64::from(7 - cell.index % 8) * 2).await;

    assert_eq!(forward, backward);
    assert_eq!(forward, Estimate::complete((1..=8).sum::<u32>() as f64));
}

#[tokio::test]
async fn test_weighted_mean_degree() {
    let grid = Arc::new(TestGrid {
        max: 2,
        fanout: 2,
        weighted: true,
    });
    let slow_second = DelayedSource {
        delay_ms: |cell| if cell.level == 2 && cell.index == 1 { 200 } else { 0 },
        value: |_| 1.0,
    };
    let pyramid = Pyramid::builder("weighted", grid)
        .with_input("survey", slow_second)
        .map_fn(|_, cell: &BinCell| Ok(f64::from(cell.index)))
        .aggregate_fn(|contributions, _: &BinCell| Ok(contributions.values().sum()))
        .with_partial_aggregation(true)
        .with_degree_policy(DegreePolicy::WeightedMean)
        .build()
        .unwrap();

    let drained = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .collect_estimates()
        .await;

    let degrees = drained.degrees();
    assert_strictly_increasing(&degrees);
    // first child weighs 3, second child and the input weigh 1 each
    assert!(degrees.iter().any(|d| (d - 0.8).abs() < 1e-9), "{:?}", degrees);
    assert_eq!(drained.last().unwrap(), &Estimate::complete(2.0));
}

#[tokio::test]
async fn test_dropping_stream_stops_subtree() {
    let metrics = Arc::new(PyramidMetrics::new().unwrap());
    let pyramid = Pyramid::builder("stalled", TestGrid::binary(3))
        .with_input("never", StalledSource)
        .map_fn(|_, _: &BinCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .with_metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    let mut estimates = pyramid.estimate_stream_at(&BinCell::new(1, 0));
    assert!(timeout(Duration::from_millis(50), estimates.next()).await.is_err());
    assert!(metrics.active_tasks("stalled") > 1);

    drop(estimates);
    wait_idle(&metrics, "stalled").await;
    assert_eq!(metrics.emitted("stalled", "leaf"), 0);
}

#[tokio::test]
async fn test_cancel_reports_once() {
    let metrics = Arc::new(PyramidMetrics::new().unwrap());
    let pyramid = Pyramid::builder("stalled", TestGrid::binary(2))
        .with_input("never", StalledSource)
        .map_fn(|_, _: &BinCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .with_metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    let mut estimates = pyramid.estimate_stream_at(&BinCell::new(1, 0));
    sleep(Duration::from_millis(20)).await;
    estimates.cancel();

    assert!(matches!(estimates.next().await, Some(Err(PyramidError::Cancelled))));
    assert!(estimates.next().await.is_none());
    wait_idle(&metrics, "stalled").await;

    let text = metrics.gather_text().unwrap();
    assert!(text.contains("pyramid_cancellations_total"));
}

#[tokio::test]
async fn test_slow_consumer_pauses_producers() {
    let metrics = Arc::new(PyramidMetrics::new().unwrap());
    let grid = Arc::new(QuadGrid::with_levels(3).unwrap());
    let pyramid = Pyramid::builder("paused", grid)
        .map_fn(|_, _: &TileCell| Ok(1.0))
        .aggregate_fn(sum_of_children)
        .with_partial_aggregation(true)
        .with_buffer_size(1)
        .with_metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    let estimates = pyramid.estimate_stream_at(&TileCell::root());
    sleep(Duration::from_millis(100)).await;
    let paused = metrics.emitted("paused", "aggregate");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.emitted("paused", "aggregate"), paused);
    assert!(metrics.active_tasks("paused") > 0);

    let drained = timeout(Duration::from_secs(5), estimates.collect_estimates())
        .await
        .unwrap();
    assert!(drained.is_ok());
    assert_strictly_increasing(&drained.degrees());
    assert_eq!(drained.last().unwrap(), &Estimate::complete(16.0));

    wait_idle(&metrics, "paused").await;
    assert!(metrics.emitted("paused", "aggregate") > paused);
}

#[tokio::test]
async fn test_cancel_after_reading_intermediate_estimate() {
    let metrics = Arc::new(PyramidMetrics::new().unwrap());
    let slow_last = DelayedSource {
        delay_ms: |cell| if cell.level == 2 && cell.index == 3 { 10_000 } else { 0 },
        value: |_| 1.0,
    };
    let pyramid = Pyramid::builder("interrupted", TestGrid::binary(2))
        .with_input("survey", slow_last)
        .map_fn(|inputs, _: &BinCell| Ok(*inputs.require("survey")?))
        .aggregate_fn(|contributions, _: &BinCell| Ok(contributions.child_values().sum()))
        .with_partial_aggregation(true)
        .with_metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    let mut estimates = pyramid.estimate_stream_at(&BinCell::new(1, 1));
    let first = timeout(Duration::from_secs(2), estimates.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.degree < MAX_DEGREE);

    estimates.cancel();
    assert!(matches!(estimates.next().await, Some(Err(PyramidError::Cancelled))));
    assert!(estimates.next().await.is_none());

    wait_idle(&metrics, "interrupted").await;
    assert_eq!(metrics.active_tasks("interrupted"), 0);
}

#[tokio::test]
async fn test_pyramid_as_input_of_another() {
    let grid = Arc::new(QuadGrid::with_levels(3).unwrap());
    let buildings = Pyramid::builder("buildings", grid.clone())
        .map_fn(|_, tile: &TileCell| Ok(u32::from(tile.x == tile.y)))
        .aggregate_fn(|contributions, _: &TileCell| Ok(contributions.values().sum()))
        .build()
        .unwrap();

    let damage = Pyramid::builder("damage", grid)
        .with_input("exposure", MappedSource::new(buildings, |n: u32| f64::from(n)))
        .map_fn(|inputs, _: &TileCell| Ok(inputs.require("exposure")? * 0.5))
        .aggregate_fn(sum_of_children)
        .build()
        .unwrap();

    let root = damage
        .estimate_stream_at(&TileCell::root())
        .final_estimate()
        .await
        .unwrap();
    assert_eq!(root.value, 2.0);
}

#[tokio::test]
async fn test_metrics_after_evaluation() {
    let metrics = Arc::new(PyramidMetrics::new().unwrap());
    let pyramid = two_leaves().with_metrics(Arc::clone(&metrics)).build().unwrap();

    pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .final_estimate()
        .await
        .unwrap();
    wait_idle(&metrics, "two-leaves").await;

    assert_eq!(metrics.emitted("two-leaves", "leaf"), 2);
    assert_eq!(metrics.emitted("two-leaves", "aggregate"), 1);
}

#[tokio::test]
async fn test_fan_out_of_pyramid_stream() {
    let pyramid = two_leaves().build().unwrap();
    let copies = pyramid
        .estimate_stream_at(&BinCell::new(1, 0))
        .fan_out(2, 2);

    let results = futures::future::join_all(copies.into_iter().map(|s| s.final_estimate())).await;
    for result in results {
        assert_eq!(result.unwrap(), Estimate::complete(15.0));
    }
}
