//! Building Damage Estimate Example
//!
//! Combines an earthquake intensity raster with a building exposure raster and
//! streams a progressively refined estimate of damaged buildings for a region.
//!
//! Run with: cargo run --release --example damage_estimate
//! Set `RUST_LOG=estimate_pyramid=debug` to follow the evaluation tasks.

use estimate_pyramid::prelude::*;
use estimate_pyramid::PyramidMetrics;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LEVELS: u8 = 5;
const MAX_INTENSITY: f64 = 30.0;

/// Deterministic noise in `0.0..1.0`
fn noise(x: u32, y: u32) -> f64 {
    let h = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263);
    let h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    f64::from(h % 10_000) / 10_000.0
}

/// Shaking intensity, strongest around an epicentre in the upper right
fn intensity_raster(side: u32) -> Raster<f64> {
    let (cx, cy) = (0.6 * f64::from(side), 0.3 * f64::from(side));
    let range = 0.4 * f64::from(side);
    Raster::from_fn(side, |x, y| {
        let distance = (f64::from(x) - cx).hypot(f64::from(y) - cy);
        MAX_INTENSITY * ((range - distance).max(0.0) / range) * (0.5 + 0.5 * noise(x, y))
    })
}

/// Buildings per tile, dense in a ring around the town centre
fn exposure_raster(side: u32) -> Raster<u32> {
    let (cx, cy) = (0.5 * f64::from(side), 0.6 * f64::from(side));
    let radius = 0.3 * f64::from(side);
    Raster::from_fn(side, |x, y| {
        let ring = ((f64::from(x) - cx).hypot(f64::from(y) - cy) - radius).abs();
        let density = (radius - ring).max(0.0) / radius;
        (30.0 * density * noise(y, x)).round() as u32
    })
}

/// Share of buildings damaged at a given intensity
fn fragility(intensity: f64) -> f64 {
    (intensity / MAX_INTENSITY).clamp(0.0, 1.0).powi(2)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let grid = Arc::new(QuadGrid::with_levels(LEVELS)?);
    let side = grid.rows_cols_at_level(grid.max_resolution());
    let metrics = Arc::new(PyramidMetrics::new()?);

    info!(levels = LEVELS, side, "Building pyramids");

    let intensity = Pyramid::raster_builder("intensity", grid.clone(), intensity_raster(side))?
        .aggregate_fn(mean_of_children)
        .with_metrics(Arc::clone(&metrics))
        .build()?;

    let buildings = Pyramid::raster_builder("buildings", grid.clone(), exposure_raster(side))?
        .aggregate_fn(|contributions, _: &TileCell| Ok(contributions.child_values().sum()))
        .with_metrics(Arc::clone(&metrics))
        .build()?;

    let damage = Pyramid::builder("damage", grid)
        .with_input("intensity", intensity)
        .with_input("exposure", MappedSource::new(buildings, |n: u32| f64::from(n)))
        .map_fn(|inputs, _: &TileCell| {
            let intensity = inputs.require("intensity")?;
            let exposure = inputs.require("exposure")?;
            Ok(exposure * fragility(*intensity))
        })
        .aggregate_fn(sum_of_children)
        .with_partial_aggregation(true)
        .with_metrics(Arc::clone(&metrics))
        .build()?;

    let region = TileCell::root();
    info!(pyramid = %damage.name(), cell = %region, "Streaming estimates");

    let mut estimates = damage.estimate_stream_at(&region);
    while let Some(estimate) = estimates.next().await {
        let estimate = estimate?;
        println!("{}", serde_json::to_string(&estimate)?);
    }

    let quarter = TileCell::new(2, 2, 1);
    let estimate = damage.estimate_stream_at(&quarter).final_estimate().await?;
    info!(cell = %quarter, damaged = estimate.value, "Final estimate for the north-east quarter");

    println!("{}", metrics.gather_text()?);
    Ok(())
}
