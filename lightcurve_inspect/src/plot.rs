//! Diagnostic figure for one corrected cutout.
//!
//! The figure sits on a 5×5 grid:
//!
//! ```text
//!  +-------+-------+-----------------------+
//!  | median image  | corrected flux        |
//!  | + aperture    +-----------------------+
//!  | + sources     | amplitude spectrum    |
//!  +---------------+---------------+-------+
//!  | original vs. systematic model | design|
//!  +-------------------------------+ matrix|
//!  | original, outliers, corrected |       |
//!  +-------------------------------+-------+
//! ```

use std::ops::Range;
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;

use crate::analysis::{percentile, AmplitudeSpectrum};
use crate::catalog::CrossMatch;
use crate::correct::Correction;
use crate::cutout::Cutout;

pub const FIGURE_SIZE: (u32, u32) = (1100, 800);
const GRID: u32 = 5;

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

/// Writes the diagnostic PNG for `correction` of `cutout` to `path`.
pub fn render<C: Cutout + ?Sized>(
    path: &Path,
    cutout: &C,
    correction: &Correction,
    cross_match: &CrossMatch,
    spectrum: &AmplitudeSpectrum,
) -> Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, FIGURE_SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    draw_cutout(&cell(&root, (0, 0), (2, 2)), cutout, correction, cross_match)?;
    draw_corrected(&cell(&root, (0, 2), (1, 3)), cutout, correction)?;
    draw_spectrum(&cell(&root, (1, 2), (1, 3)), spectrum)?;
    draw_model(&cell(&root, (2, 0), (1, 4)), correction)?;
    draw_outliers(&cell(&root, (3, 0), (1, 4)), correction)?;
    draw_design_matrix(&cell(&root, (2, 4), (2, 1)), correction)?;

    root.present()?;
    Ok(())
}

/// Sub-area covering `span` grid cells `(rows, columns)` from `start`.
fn cell<'a>(root: &Area<'a>, start: (u32, u32), span: (u32, u32)) -> Area<'a> {
    let (width, height) = root.dim_in_pixel();
    let (cell_w, cell_h) = ((width / GRID) as i32, (height / GRID) as i32);
    root.clone().shrink(
        (start.1 as i32 * cell_w, start.0 as i32 * cell_h),
        (span.1 as i32 * cell_w, span.0 as i32 * cell_h),
    )
}

fn draw_cutout<C: Cutout + ?Sized>(
    area: &Area,
    cutout: &C,
    correction: &Correction,
    cross_match: &CrossMatch,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = cutout.median_image();
    let (rows, columns) = image.dim();
    let (column_origin, row_origin) = cutout.origin();
    let x_range = column_origin - 0.5..column_origin + columns as f64 - 0.5;
    let y_range = row_origin - 0.5..row_origin + rows as f64 - 0.5;

    let finite: ndarray::Array1<f64> = image.iter().copied().filter(|v| v.is_finite()).collect();
    let low = percentile(finite.view(), 1.0).unwrap_or(0.0);
    let high = percentile(finite.view(), 99.0).unwrap_or(1.0);

    let mut chart = ChartBuilder::on(area)
        .caption(cutout.label(), ("sans-serif", 16))
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(45)
        .build_cartesian_2d(x_range.clone(), y_range.clone())?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Pixel Column")
        .y_desc("Pixel Row")
        .x_label_formatter(&|x| format!("{x:.0}"))
        .y_label_formatter(&|y| format!("{y:.0}"))
        .draw()?;

    let pixel = |r: usize, c: usize| {
        let x = column_origin + c as f64;
        let y = row_origin + r as f64;
        [(x - 0.5, y - 0.5), (x + 0.5, y + 0.5)]
    };
    chart.draw_series(image.indexed_iter().map(|((r, c), &v)| {
        let t = if high > low { (v - low) / (high - low) } else { 0.0 };
        Rectangle::new(pixel(r, c), blues(t).filled())
    }))?;
    chart.draw_series(
        correction
            .aperture
            .mask
            .indexed_iter()
            .filter(|(_, inside)| **inside)
            .map(|((r, c), _)| Rectangle::new(pixel(r, c), RED.mix(0.8).stroke_width(1))),
    )?;

    if let CrossMatch::Sources(sources) = cross_match {
        let (faint, bright) = magnitude_range(sources.iter().map(|s| s.gmag));
        chart.draw_series(
            sources
                .iter()
                .filter(|s| x_range.contains(&s.x) && y_range.contains(&s.y))
                .map(|s| {
                    let t = if faint > bright {
                        (faint - s.gmag) / (faint - bright)
                    } else {
                        1.0
                    };
                    let radius = (s.size.sqrt() / 2.0).max(1.0) as i32;
                    Circle::new((s.x, s.y), radius, reds(t).filled())
                }),
        )?;
    }
    Ok(())
}

fn draw_corrected<C: Cutout + ?Sized>(
    area: &Area,
    cutout: &C,
    correction: &Correction,
) -> Result<(), Box<dyn std::error::Error>> {
    let lc = &correction.lightcurve;
    let caption = match cutout.sector() {
        Some(sector) => format!("Sector {}", sector),
        None => cutout.label().to_string(),
    };
    let mut chart = ChartBuilder::on(area)
        .caption(caption, ("sans-serif", 16))
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(55)
        .build_cartesian_2d(
            axis_range(lc.time.iter().copied()),
            axis_range(lc.flux.iter().copied()),
        )?;
    chart
        .configure_mesh()
        .x_desc("Time [BTJD]")
        .y_desc("Normalized Flux")
        .y_label_formatter(&|y| format!("{y:.4}"))
        .draw()?;
    chart.draw_series(LineSeries::new(
        lc.time.iter().copied().zip(lc.flux.iter().copied()),
        &BLACK,
    ))?;
    Ok(())
}

fn draw_spectrum(area: &Area, spectrum: &AmplitudeSpectrum) -> Result<(), Box<dyn std::error::Error>> {
    let ppt: Vec<f64> = spectrum.amplitude.iter().map(|a| a * 1e3).collect();
    let mut chart = ChartBuilder::on(area)
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(55)
        .build_cartesian_2d(
            axis_range(spectrum.frequency.iter().copied()),
            axis_range(ppt.iter().copied().chain(std::iter::once(0.0))),
        )?;
    chart
        .configure_mesh()
        .x_desc("Frequency [1/day]")
        .y_desc("Amplitude [ppt]")
        .draw()?;
    chart.draw_series(LineSeries::new(
        spectrum.frequency.iter().copied().zip(ppt),
        &BLACK,
    ))?;
    Ok(())
}

fn draw_model(area: &Area, correction: &Correction) -> Result<(), Box<dyn std::error::Error>> {
    let raw = &correction.raw;
    let model = correction.regression.diagnostic_model();
    let mut chart = ChartBuilder::on(area)
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(55)
        .build_cartesian_2d(
            axis_range(raw.time.iter().copied()),
            axis_range(raw.flux.iter().chain(model.iter()).copied()),
        )?;
    chart.configure_mesh().y_desc("Flux").draw()?;
    chart
        .draw_series(LineSeries::new(
            raw.time.iter().copied().zip(raw.flux.iter().copied()),
            &BLACK,
        ))?
        .label("Original")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 15, y)], BLACK));
    chart
        .draw_series(LineSeries::new(
            raw.time.iter().copied().zip(model.iter().copied()),
            &RED,
        ))?
        .label("Regressors")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 15, y)], RED));
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    Ok(())
}

fn draw_outliers(area: &Area, correction: &Correction) -> Result<(), Box<dyn std::error::Error>> {
    let raw = &correction.raw;
    let corrected = &correction.regression.corrected;
    let outliers = correction.regression.outliers()?;
    let mut chart = ChartBuilder::on(area)
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(55)
        .build_cartesian_2d(
            axis_range(raw.time.iter().copied()),
            axis_range(raw.flux.iter().chain(corrected.flux.iter()).copied()),
        )?;
    chart
        .configure_mesh()
        .x_desc("Time [BTJD]")
        .y_desc("Flux")
        .draw()?;
    chart.draw_series(LineSeries::new(
        raw.time.iter().copied().zip(raw.flux.iter().copied()),
        &BLUE.mix(0.6),
    ))?;
    chart.draw_series(
        outliers
            .time
            .iter()
            .zip(outliers.flux.iter())
            .map(|(t, f)| Cross::new((*t, *f), 3, RED)),
    )?;
    chart.draw_series(LineSeries::new(
        corrected.time.iter().copied().zip(corrected.flux.iter().copied()),
        &BLACK,
    ))?;
    Ok(())
}

/// Heatmap of the regressors, leaving out the trailing constant column.
fn draw_design_matrix(
    area: &Area,
    correction: &Correction,
) -> Result<(), Box<dyn std::error::Error>> {
    let values = &correction.design_matrix.values;
    let components = values.ncols().saturating_sub(1);
    let cadences = values.nrows();
    let values = values.slice(ndarray::s![.., ..components]);
    let scale = values
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0_f64, |max, v| max.max(v.abs()));

    let mut chart = ChartBuilder::on(area)
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(45)
        .build_cartesian_2d(0..components.max(1), 0..cadences.max(1))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Component")
        .y_desc("X")
        .draw()?;
    chart.draw_series(values.indexed_iter().map(|((row, column), &v)| {
        let t = if scale > 0.0 { 0.5 + 0.5 * v / scale } else { 0.5 };
        Rectangle::new([(column, row), (column + 1, row + 1)], coolwarm(t).filled())
    }))?;
    Ok(())
}

/// Padded range over the finite values; `0..1` when there are none.
fn axis_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
            (min.min(v), max.max(v))
        });
    if min > max {
        return 0.0..1.0;
    }
    let pad = if max > min { (max - min) * 0.05 } else { min.abs().max(1.0) * 0.05 };
    min - pad..max + pad
}

/// `(faintest, brightest)` magnitudes.
fn magnitude_range(magnitudes: impl Iterator<Item = f64>) -> (f64, f64) {
    magnitudes
        .filter(|m| m.is_finite())
        .fold((f64::NEG_INFINITY, f64::INFINITY), |(faint, bright), m| {
            (faint.max(m), bright.min(m))
        })
}

fn interpolate(stops: &[(f64, (u8, u8, u8))], t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    for pair in stops.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
            let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
            return RGBColor(mix(c0.0, c1.0), mix(c0.1, c1.1), mix(c0.2, c1.2));
        }
    }
    let (_, last) = stops[stops.len() - 1];
    RGBColor(last.0, last.1, last.2)
}

/// White to dark blue.
fn blues(t: f64) -> RGBColor {
    interpolate(
        &[
            (0.0, (247, 251, 255)),
            (0.5, (107, 174, 214)),
            (1.0, (8, 48, 107)),
        ],
        t,
    )
}

/// Pale to dark red.
fn reds(t: f64) -> RGBColor {
    interpolate(
        &[
            (0.0, (255, 245, 240)),
            (0.5, (251, 106, 74)),
            (1.0, (103, 0, 13)),
        ],
        t,
    )
}

/// Blue through light grey to red, centered on 0.5.
fn coolwarm(t: f64) -> RGBColor {
    interpolate(
        &[
            (0.0, (59, 76, 192)),
            (0.5, (221, 221, 221)),
            (1.0, (180, 4, 38)),
        ],
        t,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_range() {
        let range = axis_range([1.0, f64::NAN, 3.0].into_iter());
        assert_eq!(range, 0.9..3.1);

        assert_eq!(axis_range(std::iter::empty()), 0.0..1.0);
        assert_eq!(axis_range([2.0].into_iter()), 1.9..2.1);
    }

    #[test]
    fn test_colormaps() {
        assert_eq!(blues(0.0), RGBColor(247, 251, 255));
        assert_eq!(blues(1.0), RGBColor(8, 48, 107));
        assert_eq!(blues(f64::NAN), RGBColor(247, 251, 255));
        assert_eq!(coolwarm(0.5), RGBColor(221, 221, 221));
        assert_eq!(coolwarm(-3.0), RGBColor(59, 76, 192));
        assert_eq!(reds(2.0), RGBColor(103, 0, 13));
        assert_eq!(reds(0.25), RGBColor(253, 176, 157));
    }

    #[test]
    fn test_magnitude_range() {
        assert_eq!(
            magnitude_range([12.0, f64::NAN, 9.5, 15.0].into_iter()),
            (15.0, 9.5)
        );
    }
}
