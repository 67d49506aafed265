//! Score-matrix heatmap rendering (layer on Y, head on X)

use std::path::Path;
use std::sync::OnceLock;

use plotters::prelude::*;
use plotters::style::{register_font, FontStyle};
use tracing::{debug, warn};

use crate::error::{PatchError, Result};
use crate::sweep::ScoreMatrix;

/// Rendering options for [`plot_patching_heatmap`]
#[derive(Debug, Clone)]
pub struct HeatmapOptions {
    pub title: String,
    /// Print each cell's score inside it
    pub annotate: bool,
    /// Draw title, axis labels and tick labels. Skipped when no system font is found.
    pub labels: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            title: "Activation Patching Scores Heatmap".to_string(),
            annotate: true,
            labels: true,
            width: 1000,
            height: 600,
        }
    }
}

/// matplotlib viridis sampled at nine evenly spaced points
const VIRIDIS: [(u8, u8, u8); 9] = [
    (68, 1, 84),
    (71, 44, 122),
    (59, 81, 139),
    (44, 113, 142),
    (33, 144, 141),
    (39, 173, 129),
    (92, 200, 99),
    (170, 220, 50),
    (253, 231, 37),
];

/// Viridis colour for `t` in `[0, 1]`
pub fn viridis(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0) * (VIRIDIS.len() - 1) as f64;
    let i = (t.floor() as usize).min(VIRIDIS.len() - 2);
    let frac = t - i as f64;
    let (a, b) = (VIRIDIS[i], VIRIDIS[i + 1]);
    let lerp = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * frac).round() as u8;
    RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
}

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Register the first readable system font as "sans-serif"; false if none loads
pub fn register_system_font() -> bool {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    *REGISTERED.get_or_init(|| {
        for path in FONT_CANDIDATES {
            let Ok(bytes) = std::fs::read(path) else {
                continue;
            };
            // plotters keeps registered fonts for the life of the process
            let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
            if register_font("sans-serif", FontStyle::Normal, bytes).is_ok() {
                debug!("Registered heatmap font {}", path);
                return true;
            }
        }
        false
    })
}

const MIN_BAR_WIDTH: u32 = 40;
/// Chart margins take 20px on each axis
const MIN_PANEL_SIZE: u32 = 24;

fn render_err<E: std::fmt::Display>(e: E) -> PatchError {
    PatchError::Render(e.to_string())
}

/// Render `scores` as a PNG heatmap at `path`, with a colour bar on the right
pub fn plot_patching_heatmap(
    scores: &ScoreMatrix,
    path: impl AsRef<Path>,
    options: &HeatmapOptions,
) -> Result<()> {
    let (n_layers, n_heads) = scores.shape();
    let (Some(lo), Some(hi)) = (scores.min(), scores.max()) else {
        return Err(PatchError::Render("empty score matrix".into()));
    };
    if n_layers == 0 || n_heads == 0 {
        return Err(PatchError::Render("empty score matrix".into()));
    }
    let (lo, hi) = (lo as f64, hi as f64);

    let bar_width = (options.width / 8).max(MIN_BAR_WIDTH);
    let main_width = options
        .width
        .checked_sub(bar_width)
        .filter(|&w| w >= MIN_PANEL_SIZE)
        .ok_or_else(|| {
            PatchError::Render(format!(
                "image width {} leaves no room for the heatmap beside a {bar_width}px colour bar",
                options.width
            ))
        })?;
    if options.height < MIN_PANEL_SIZE {
        return Err(PatchError::Render(format!(
            "image height {} is below the minimum of {MIN_PANEL_SIZE}",
            options.height
        )));
    }

    let labels = options.labels && register_system_font();
    if options.labels && !labels {
        warn!("No usable system font found, rendering heatmap without labels");
    }
    let normalize = |v: f64| if hi > lo { (v - lo) / (hi - lo) } else { 0.5 };

    let root = BitMapBackend::new(path.as_ref(), (options.width, options.height)).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;

    let (main, bar) = root.split_horizontally(main_width as i32);

    let mut builder = ChartBuilder::on(&main);
    builder.margin(10);
    if labels {
        builder
            .caption(&options.title, ("sans-serif", 22))
            .x_label_area_size(40)
            .y_label_area_size(50);
    }
    let mut chart = builder
        .build_cartesian_2d(0f64..n_heads as f64, 0f64..n_layers as f64)
        .map_err(render_err)?;

    if labels {
        // Layer 0 is drawn at the top
        let head_label = |x: &f64| {
            let h = x.round() as usize;
            if h < n_heads { h.to_string() } else { String::new() }
        };
        let layer_label = |y: &f64| {
            let k = y.round() as usize;
            if k < n_layers { (n_layers - 1 - k).to_string() } else { String::new() }
        };
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("Head")
            .y_desc("Layer")
            .x_labels(n_heads + 1)
            .y_labels(n_layers + 1)
            .x_label_formatter(&head_label)
            .y_label_formatter(&layer_label)
            .draw()
            .map_err(render_err)?;
    }

    let cell = |layer: usize, head: usize| {
        let y = (n_layers - layer - 1) as f64;
        (head as f64, y)
    };

    chart
        .draw_series(scores.iter().map(|(coord, v)| {
            let (x, y) = cell(coord.layer, coord.head);
            Rectangle::new(
                [(x, y), (x + 1.0, y + 1.0)],
                viridis(normalize(v as f64)).filled(),
            )
        }))
        .map_err(render_err)?;

    if options.annotate && labels {
        chart
            .draw_series(scores.iter().map(|(coord, v)| {
                let (x, y) = cell(coord.layer, coord.head);
                let color = if normalize(v as f64) > 0.6 { &BLACK } else { &WHITE };
                Text::new(
                    format!("{v:.2}"),
                    (x + 0.2, y + 0.65),
                    ("sans-serif", 11).into_font().color(color),
                )
            }))
            .map_err(render_err)?;
    }

    let mut bar_builder = ChartBuilder::on(&bar);
    bar_builder.margin(10).margin_left(4);
    if labels {
        bar_builder.y_label_area_size(60).x_label_area_size(40);
    }
    let (bar_lo, bar_hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) };
    let mut bar_chart = bar_builder
        .build_cartesian_2d(0f64..1f64, bar_lo..bar_hi)
        .map_err(render_err)?;

    const STEPS: usize = 100;
    let step = (bar_hi - bar_lo) / STEPS as f64;
    bar_chart
        .draw_series((0..STEPS).map(|i| {
            let y0 = bar_lo + i as f64 * step;
            Rectangle::new(
                [(0.0, y0), (1.0, y0 + step)],
                viridis(i as f64 / (STEPS - 1) as f64).filled(),
            )
        }))
        .map_err(render_err)?;

    if labels {
        bar_chart
            .configure_mesh()
            .disable_mesh()
            .disable_x_axis()
            .y_desc("Logit Difference Change")
            .y_labels(6)
            .y_label_formatter(&|y| format!("{y:.2}"))
            .draw()
            .map_err(render_err)?;
    }

    root.present().map_err(render_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viridis_endpoints() {
        assert_eq!(viridis(0.0), RGBColor(68, 1, 84));
        assert_eq!(viridis(1.0), RGBColor(253, 231, 37));
        assert_eq!(viridis(-3.0), viridis(0.0));
        assert_eq!(viridis(0.5), RGBColor(33, 144, 141));
    }

    #[test]
    fn test_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heatmap.png");
        let scores = ScoreMatrix::from_vec(3, 4, (0..12).map(|i| i as f32 * 0.1 - 0.3).collect())
            .unwrap();
        let options = HeatmapOptions {
            labels: false,
            width: 320,
            height: 200,
            ..Default::default()
        };
        plot_patching_heatmap(&scores, &path, &options).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_labelled_render_falls_back_without_font() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labelled.png");
        let scores = ScoreMatrix::from_vec(2, 3, vec![0.5, -0.2, 0.0, 1.2, 0.3, -0.7]).unwrap();
        plot_patching_heatmap(&scores, &path, &HeatmapOptions::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_constant_matrix_renders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.png");
        let options = HeatmapOptions {
            labels: false,
            width: 200,
            height: 120,
            ..Default::default()
        };
        plot_patching_heatmap(&ScoreMatrix::zeros(2, 2), &path, &options).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_too_small_image_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let scores = ScoreMatrix::zeros(2, 2);
        for (width, height) in [(30, 30), (60, 120), (320, 10)] {
            let options = HeatmapOptions {
                labels: false,
                width,
                height,
                ..Default::default()
            };
            let result = plot_patching_heatmap(&scores, dir.path().join("tiny.png"), &options);
            assert!(
                matches!(result, Err(PatchError::Render(_))),
                "{width}x{height}: {result:?}"
            );
        }
    }

    #[test]
    fn test_empty_matrix_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = plot_patching_heatmap(
            &ScoreMatrix::zeros(0, 0),
            dir.path().join("none.png"),
            &HeatmapOptions::default(),
        );
        assert!(matches!(result, Err(PatchError::Render(_))));
    }
}
