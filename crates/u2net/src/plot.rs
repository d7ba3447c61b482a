//! Training curve plots.

use std::{fs, ops::Range, path::Path};

use anyhow::{anyhow, bail, Result};
use plotters::{coord::Shift, prelude::*};

use crate::history::{EpochRecord, TrainingHistory};

const PANEL_WIDTH: u32 = 700;
const PANEL_HEIGHT: u32 = 560;

/// Draws loss and Dice curves side by side into a PNG at `path`.
///
/// Validation curves are drawn only when the history has validation
/// scores. The parent directory is created if needed.
///
/// # Errors
///
/// Returns an error if the history is empty or the image cannot be drawn
/// or written.
pub fn plot_training_progress(
    history: &TrainingHistory,
    path: impl AsRef<Path>,
    title: &str,
) -> Result<()> {
    if history.is_empty() {
        bail!("cannot plot an empty training history");
    }
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let root = BitMapBackend::new(path, (2 * PANEL_WIDTH, PANEL_HEIGHT)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| anyhow!("backend error: {e}"))?;
    let root = root
        .titled(title, ("sans-serif", 28))
        .map_err(|e| anyhow!("caption error: {e}"))?;
    let (left, right) = root.split_horizontally(PANEL_WIDTH);

    draw_panel(
        &left,
        "Loss",
        series(history, |r| Some(r.train_loss)),
        series(history, |r| r.val_loss),
    )?;
    draw_panel(
        &right,
        "Dice",
        series(history, |r| Some(r.train_dice)),
        series(history, |r| r.val_dice),
    )?;

    root.present()
        .map_err(|e| anyhow!("render error: {e}"))?;
    tracing::info!(path = %path.display(), epochs = history.len(), "training progress plotted");
    Ok(())
}

fn series(history: &TrainingHistory, value: impl Fn(&EpochRecord) -> Option<f64>) -> Vec<(f64, f64)> {
    history
        .epochs
        .iter()
        .filter_map(|record| {
            value(record)
                .filter(|v| v.is_finite())
                .map(|v| (record.epoch as f64, v))
        })
        .collect()
}

/// Value range covering `values` with a 5 % margin, never empty.
fn padded_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (low, high) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), v| {
        (low.min(v), high.max(v))
    });
    if !low.is_finite() {
        return 0.0..1.0;
    }
    let margin = ((high - low) * 0.05).max(0.05);
    (low - margin)..(high + margin)
}

fn draw_panel(
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    name: &str,
    train: Vec<(f64, f64)>,
    valid: Vec<(f64, f64)>,
) -> Result<()> {
    let last_epoch = train
        .iter()
        .chain(&valid)
        .map(|&(epoch, _)| epoch)
        .fold(1.0, f64::max);
    let y_range = padded_range(train.iter().chain(&valid).map(|&(_, v)| v));

    let mut chart = ChartBuilder::on(area)
        .caption(name, ("sans-serif", 22))
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(1.0..last_epoch.max(2.0), y_range)
        .map_err(|e| anyhow!("chart build error: {e}"))?;
    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc(name)
        .draw()
        .map_err(|e| anyhow!("mesh error: {e}"))?;

    chart
        .draw_series(LineSeries::new(train, &BLUE))
        .map_err(|e| anyhow!("draw error: {e}"))?
        .label("train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    if !valid.is_empty() {
        chart
            .draw_series(LineSeries::new(valid, &RED))
            .map_err(|e| anyhow!("draw error: {e}"))?
            .label("val")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| anyhow!("legend error: {e}"))?;
    Ok(())
}
